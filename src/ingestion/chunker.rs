//! Content-aware text chunking with dynamic overlap
//!
//! The recursive strategy splits on a priority list of separators and merges
//! segments up to the target size, carrying a tail overlap into the next
//! chunk. Overlap size is not fixed: content is classified (code, structured
//! data, technical, list, dialogue, prose) and the overlap is derived from
//! the class and the text's sentence/paragraph/punctuation characteristics.

use crate::config::IngestionConfig;
use crate::error::{RagError, Result};
use crate::types::Metadata;
use serde_json::json;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Separator priority for recursive splitting
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// An emitted chunk before it becomes a stored record
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub text: String,
    pub chunk_index: usize,
    pub metadata: Metadata,
}

/// Detected content class driving overlap selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Code,
    StructuredData,
    Technical,
    List,
    Dialogue,
    Prose,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Code => write!(f, "code"),
            ContentType::StructuredData => write!(f, "structured_data"),
            ContentType::Technical => write!(f, "technical"),
            ContentType::List => write!(f, "list"),
            ContentType::Dialogue => write!(f, "dialogue"),
            ContentType::Prose => write!(f, "prose"),
        }
    }
}

/// Recursive size-based chunker
pub struct Chunker {
    config: IngestionConfig,
}

impl Chunker {
    pub fn new(config: IngestionConfig) -> Self {
        info!(
            "Chunker initialized: size={}, overlap={}",
            config.chunk_size, config.chunk_overlap
        );
        Self { config }
    }

    /// Split text into chunks with merged metadata.
    ///
    /// Returns an empty list for blank input. Chunk indices are contiguous
    /// and `total_chunks` is filled in a second pass.
    pub fn chunk_text(&self, text: &str, metadata: Option<&Metadata>) -> Result<Vec<ChunkPiece>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let cleaned = clean_text(text);
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }

        let overlap = self.smart_overlap(&cleaned);
        let segments = split_recursive(&cleaned, self.config.chunk_size, &SEPARATORS);
        let texts = merge_segments(&segments, self.config.chunk_size, overlap);
        if texts.is_empty() {
            return Err(RagError::Chunking("no chunks produced".to_string()));
        }

        let total = texts.len();
        let chunks = texts
            .into_iter()
            .enumerate()
            .map(|(i, chunk_text)| {
                let mut chunk_metadata = Metadata::new();
                chunk_metadata.insert("chunk_index".to_string(), json!(i));
                chunk_metadata.insert("chunk_size".to_string(), json!(chunk_text.chars().count()));
                chunk_metadata.insert("total_chunks".to_string(), json!(total));
                chunk_metadata.insert("chunking_method".to_string(), json!("recursive"));
                if let Some(caller) = metadata {
                    for (key, value) in caller {
                        chunk_metadata.insert(key.clone(), value.clone());
                    }
                }
                ChunkPiece {
                    text: chunk_text,
                    chunk_index: i,
                    metadata: chunk_metadata,
                }
            })
            .collect::<Vec<_>>();

        info!("Created {} chunks from text", chunks.len());
        Ok(chunks)
    }

    /// Compute the overlap for this text from its content class and shape.
    /// The effective value is logged so retrieval behaviour is explainable.
    pub fn smart_overlap(&self, text: &str) -> usize {
        let size = self.config.chunk_size;
        let content_type = classify_content(text);

        let base = match content_type {
            ContentType::Code => 50.min(size / 10),
            ContentType::StructuredData => 300.min(size / 3),
            ContentType::Technical => 250.min(size / 4),
            ContentType::List => 100.min(size / 8),
            ContentType::Dialogue => 200.min(size / 5),
            ContentType::Prose => self.config.chunk_overlap,
        };

        let mut overlap = base as f32;

        let sentences = split_sentences(text);
        let total_chars = text.chars().count();
        if !sentences.is_empty() {
            let avg_sentence = total_chars as f32 / sentences.len() as f32;
            if avg_sentence > 100.0 {
                overlap *= 1.3;
            } else if avg_sentence < 40.0 {
                overlap *= 0.8;
            }
        }

        let paragraphs = text.split("\n\n").filter(|p| !p.trim().is_empty()).count();
        if total_chars > 0 {
            let paragraph_density = paragraphs as f32 / (total_chars as f32 / 1000.0);
            if paragraph_density > 2.0 {
                overlap *= 0.9;
            } else if paragraph_density < 0.5 {
                overlap *= 1.2;
            }

            let punctuation = text
                .chars()
                .filter(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'))
                .count();
            if punctuation as f32 / total_chars as f32 > 0.05 {
                overlap *= 1.1;
            }
        }

        let upper = (size / 2).min(500);
        let effective = (overlap as usize).clamp(20.min(upper), upper);
        debug!(
            "Smart overlap: {} (content_type={}, base={}, chunk_size={})",
            effective, content_type, base, size
        );
        effective
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(IngestionConfig::default())
    }
}

/// Collapse horizontal whitespace and strip control characters, keeping
/// paragraph structure intact for the separator pass.
pub fn clean_text(text: &str) -> String {
    static SPACES: OnceLock<regex::Regex> = OnceLock::new();
    static BLANKS: OnceLock<regex::Regex> = OnceLock::new();
    let spaces = SPACES.get_or_init(|| regex::Regex::new(r"[ \t]+").unwrap());
    let blanks = BLANKS.get_or_init(|| regex::Regex::new(r"\n{3,}").unwrap());

    let without_controls: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect();
    let collapsed = spaces.replace_all(&without_controls, " ");
    let normalized = blanks.replace_all(&collapsed, "\n\n");
    normalized.trim().to_string()
}

/// Split into segments no longer than `chunk_size`, preferring separators in
/// priority order
fn split_recursive(text: &str, chunk_size: usize, separators: &[&str]) -> Vec<String> {
    if text.chars().count() <= chunk_size {
        if text.trim().is_empty() {
            return Vec::new();
        }
        return vec![text.to_string()];
    }

    let (separator, remaining) = match separators.split_first() {
        Some((sep, rest)) => (*sep, rest),
        None => ("", &[] as &[&str]),
    };

    if separator.is_empty() {
        // Hard split on character boundaries
        return text
            .chars()
            .collect::<Vec<_>>()
            .chunks(chunk_size)
            .map(|chars| chars.iter().collect::<String>())
            .filter(|s| !s.trim().is_empty())
            .collect();
    }

    let mut segments = Vec::new();
    for piece in text.split(separator) {
        if piece.trim().is_empty() {
            continue;
        }
        if piece.chars().count() <= chunk_size {
            segments.push(piece.to_string());
        } else {
            segments.extend(split_recursive(piece, chunk_size, remaining));
        }
    }
    segments
}

/// Merge segments into chunks of at most `chunk_size` characters, carrying
/// the last `overlap` characters into the next chunk
fn merge_segments(segments: &[String], chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for segment in segments {
        let segment_len = segment.chars().count();
        let current_len = current.chars().count();

        if current_len > 0 && current_len + segment_len + 1 > chunk_size {
            chunks.push(current.trim().to_string());
            current = overlap_tail(&current, overlap);
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(segment);
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

/// The trailing `overlap` characters of a chunk, cut at a word boundary
fn overlap_tail(text: &str, overlap: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= overlap {
        return text.to_string();
    }

    let tail: String = chars[chars.len() - overlap..].iter().collect();
    match tail.find(' ') {
        Some(space) if space > 0 => tail[space..].trim_start().to_string(),
        _ => tail,
    }
}

/// Split text into sentences on terminal punctuation
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let boundary = matches!(chars.peek(), None | Some(' ') | Some('\n') | Some('\t'));
            if boundary && !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
                current.clear();
            }
        }
    }

    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences
}

/// Classify content by counting domain-specific markers
pub fn classify_content(text: &str) -> ContentType {
    let lower = text.to_lowercase();
    let lines: Vec<&str> = text.lines().collect();
    let line_count = lines.len().max(1);

    let code_keywords = [
        "fn ", "def ", "class ", "import ", "return", "function", "=>", "#include", "let ",
        "const ", "var ",
    ];
    let mut code_score = code_keywords
        .iter()
        .map(|kw| lower.matches(kw).count())
        .sum::<usize>();
    code_score += text.matches(['{', '}', ';']).count() / 4;
    let indented = lines
        .iter()
        .filter(|l| l.starts_with("    ") || l.starts_with('\t'))
        .count();
    if indented * 3 > line_count {
        code_score += 5;
    }

    let mut structured_score = text.matches('|').count() / 2;
    structured_score += text.matches("\":").count();
    structured_score += text.matches("</").count() + text.matches("/>").count();
    structured_score += text.matches("\t").count() / 4;

    let list_lines = lines
        .iter()
        .filter(|l| {
            let trimmed = l.trim_start();
            trimmed.starts_with("- ")
                || trimmed.starts_with("* ")
                || trimmed.starts_with("• ")
                || trimmed
                    .split_once(". ")
                    .map(|(head, _)| head.chars().all(|c| c.is_ascii_digit()) && !head.is_empty())
                    .unwrap_or(false)
        })
        .count();
    let list_score = if list_lines * 2 > line_count {
        list_lines + 3
    } else {
        list_lines / 2
    };

    static SPEAKER: OnceLock<regex::Regex> = OnceLock::new();
    let speaker = SPEAKER.get_or_init(|| regex::Regex::new(r"(?m)^[A-Za-z]+\s*:\s").unwrap());
    let dialogue_score = speaker.find_iter(text).count() + text.matches('"').count() / 6;

    let technical_terms = [
        "server", "config", "network", "protocol", "error", "api", "database", "install",
        "version", "firmware", "interface", "gateway",
    ];
    let technical_score = technical_terms
        .iter()
        .map(|t| lower.matches(t).count())
        .sum::<usize>();

    let scores = [
        (ContentType::Code, code_score),
        (ContentType::StructuredData, structured_score),
        (ContentType::List, list_score),
        (ContentType::Dialogue, dialogue_score),
        (ContentType::Technical, technical_score),
    ];

    scores
        .iter()
        .filter(|(_, score)| *score >= 3)
        .max_by_key(|(_, score)| *score)
        .map(|(content_type, _)| *content_type)
        .unwrap_or(ContentType::Prose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_chunk_short_text() {
        let chunker = Chunker::default();
        let text = "This is a short text.";
        let chunks = chunker.chunk_text(text, None).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].metadata["total_chunks"], 1);
        assert_eq!(chunks[0].metadata["chunking_method"], "recursive");
    }

    #[test]
    fn test_chunk_empty_text() {
        let chunker = Chunker::default();
        assert!(chunker.chunk_text("", None).unwrap().is_empty());
        assert!(chunker.chunk_text("   \n\n  ", None).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_long_text_has_overlap() {
        let config = IngestionConfig {
            chunk_size: 50,
            chunk_overlap: 10,
            ..IngestionConfig::default()
        };
        let chunker = Chunker::new(config);
        let text = "The capital of France is Paris. Paris has a population of 2.1 million.";
        let chunks = chunker.chunk_text(text, None).unwrap();

        assert!(chunks.len() >= 2, "expected multiple chunks");
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert!(!chunk.text.trim().is_empty());
        }
    }

    #[test]
    fn test_metadata_merged_into_chunks() {
        let chunker = Chunker::default();
        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), json!("unit-test"));

        let chunks = chunker.chunk_text("Some text here.", Some(&metadata)).unwrap();
        assert_eq!(chunks[0].metadata["source"], "unit-test");
    }

    #[test]
    fn test_clean_text() {
        let cleaned = clean_text("hello\t\tworld  again\x00\x07");
        assert_eq!(cleaned, "hello world again");

        let kept_paragraphs = clean_text("para one\n\n\n\n\npara two");
        assert_eq!(kept_paragraphs, "para one\n\npara two");
    }

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences("First one. Second one! Third? Trailing");
        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences[0], "First one.");
        assert_eq!(sentences[3], "Trailing");

        // Decimal points do not end sentences
        let sentences = split_sentences("Population is 2.1 million. Done.");
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn test_classify_code() {
        let code = "fn main() {\n    let x = 1;\n    return x;\n}\nfn helper() {\n    const y = 2;\n}";
        assert_eq!(classify_content(code), ContentType::Code);
    }

    #[test]
    fn test_classify_list() {
        let list = "- first item\n- second item\n- third item\n- fourth item";
        assert_eq!(classify_content(list), ContentType::List);
    }

    #[test]
    fn test_classify_prose() {
        let prose = "It was a quiet morning in the valley, and nothing much happened for hours on end while people went about their routines.";
        assert_eq!(classify_content(prose), ContentType::Prose);
    }

    #[test]
    fn test_smart_overlap_respects_bounds() {
        let config = IngestionConfig {
            chunk_size: 1000,
            chunk_overlap: 200,
            ..IngestionConfig::default()
        };
        let chunker = Chunker::new(config);

        let prose = "Plain sentences here. More of them follow. And a few more for good measure.";
        let overlap = chunker.smart_overlap(prose);
        assert!(overlap >= 20);
        assert!(overlap <= 500);

        let small = Chunker::new(IngestionConfig {
            chunk_size: 80,
            chunk_overlap: 200,
            ..IngestionConfig::default()
        });
        let overlap = small.smart_overlap(prose);
        assert!(overlap <= 40, "overlap may not exceed half the chunk size");
    }

    proptest! {
        #[test]
        fn prop_overlap_always_clamped(text in "[a-zA-Z ,.\n]{1,2000}", size in 60usize..4000) {
            let chunker = Chunker::new(IngestionConfig {
                chunk_size: size,
                chunk_overlap: 200,
                ..IngestionConfig::default()
            });
            let overlap = chunker.smart_overlap(&text);
            let upper = (size / 2).min(500);
            prop_assert!(overlap <= upper);
            prop_assert!(overlap >= 20.min(upper));
        }

        #[test]
        fn prop_chunks_never_empty(text in "[a-zA-Z ,.\n]{1,1500}") {
            let chunker = Chunker::new(IngestionConfig {
                chunk_size: 100,
                chunk_overlap: 20,
                ..IngestionConfig::default()
            });
            if let Ok(chunks) = chunker.chunk_text(&text, None) {
                for chunk in chunks {
                    prop_assert!(!chunk.text.trim().is_empty());
                }
            }
        }
    }
}
