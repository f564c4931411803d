//! Dynamic context assembly and poisoning defence
//!
//! Context segments are built from conversation history and search results,
//! scored for relevance, filtered for poisoning and redundancy, and packed
//! into a character budget ranked by relevance x quality weight. Content
//! that matches a poisoning pattern is quarantined by content ID and never
//! reaches a prompt on that thread.

use crate::config::MemoryConfig;
use crate::conversation::state::{ContextQuality, ConversationState, MessageRole};
use crate::types::content_hash;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Where a context segment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentSource {
    Conversation,
    Search,
    System,
}

/// One candidate block of prompt context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSegment {
    pub id: String,
    pub content: String,
    pub source: SegmentSource,
    pub relevance: f32,
    pub quality: ContextQuality,
    pub content_hash: String,
}

/// Patterns that mark content as context poisoning: role reassignment,
/// instruction override, or capability denial inconsistent with the system
fn poison_patterns() -> &'static [regex::Regex] {
    static PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)ignore\s+(all\s+)?previous\s+instructions",
            r"(?i)disregard\s+(all\s+)?(prior|previous)",
            r"(?i)forget\s+your\s+(training|instructions)",
            r"(?i)you\s+are\s+now\s+(a|an|the)?\s*\w+",
            r"(?i)new\s+role\s*:",
            r"(?i)system\s*:\s*you\s+are",
            r"(?i)i\s+(cannot|can't)\s+(access|help\s+with)\s+any",
            r"(?i)act\s+as\s+if\s+you\s+(are|were)",
        ]
        .iter()
        .map(|p| regex::Regex::new(p).expect("static poison pattern"))
        .collect()
    })
}

/// Builds and filters prompt context for a conversation thread
pub struct ContextManager {
    config: MemoryConfig,
}

impl ContextManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    /// Return the matching poisoning pattern, if any
    pub fn detect_poisoning(&self, content: &str) -> Option<String> {
        for pattern in poison_patterns() {
            if pattern.is_match(content) {
                warn!("Context poisoning detected: {}", pattern.as_str());
                return Some(pattern.as_str().to_string());
            }
        }
        None
    }

    /// Derive the thread's overall context quality
    pub fn assess_quality(&self, state: &ConversationState) -> ContextQuality {
        if !state.poisoned_content_ids.is_empty() {
            return ContextQuality::Poisoned;
        }
        if state.conflict_count > 2 {
            return ContextQuality::Conflicted;
        }

        let quality = state.average_message_quality();
        if quality >= 0.75 {
            ContextQuality::High
        } else if quality >= 0.5 {
            ContextQuality::Medium
        } else {
            ContextQuality::Low
        }
    }

    /// Build candidate segments from the state's messages and search results
    pub fn build_segments(&self, state: &ConversationState, query: &str) -> Vec<ContextSegment> {
        let query_words: HashSet<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|w| w.to_string())
            .collect();

        let mut segments = Vec::new();

        for message in state.recent_messages(self.config.max_relevant_history) {
            let quality = if state.poisoned_content_ids.contains(&message.id) {
                ContextQuality::Poisoned
            } else if message.quality_score >= 0.75 {
                ContextQuality::High
            } else if message.quality_score >= 0.5 {
                ContextQuality::Medium
            } else {
                ContextQuality::Low
            };

            let role = match message.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
                MessageRole::System => "System",
            };
            let content = format!("{}: {}", role, message.content);
            segments.push(ContextSegment {
                id: message.id.clone(),
                content_hash: content_hash(content.as_bytes()),
                relevance: word_overlap(&query_words, &message.content),
                quality,
                source: SegmentSource::Conversation,
                content,
            });
        }

        for result in &state.search_results {
            segments.push(ContextSegment {
                id: result.chunk_id.clone(),
                content_hash: content_hash(result.text.as_bytes()),
                relevance: word_overlap(&query_words, &result.text)
                    .max(result.similarity_score),
                quality: if result.similarity_score >= 0.7 {
                    ContextQuality::High
                } else if result.similarity_score >= 0.4 {
                    ContextQuality::Medium
                } else {
                    ContextQuality::Low
                },
                source: SegmentSource::Search,
                content: format!("[{}] {}", result.source_label, result.text),
            });
        }

        segments
    }

    /// Assemble prompt context within the configured character budget.
    ///
    /// Poisoned segments (pattern match or quarantined ID) and redundant
    /// segments (same content hash) never make it in.
    pub fn assemble(&self, state: &ConversationState, query: &str) -> String {
        let mut segments = self.build_segments(state, query);

        segments.retain(|segment| {
            if state.poisoned_content_ids.contains(&segment.id) {
                return false;
            }
            if segment.quality == ContextQuality::Poisoned {
                return false;
            }
            self.detect_poisoning(&segment.content).is_none()
        });

        let mut seen_hashes: HashSet<String> = HashSet::new();
        segments.retain(|segment| seen_hashes.insert(segment.content_hash.clone()));

        segments.sort_by(|a, b| {
            let score_a = a.relevance * a.quality.weight();
            let score_b = b.relevance * b.quality.weight();
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let budget = self.config.max_context_length;
        let mut assembled = String::new();
        for segment in segments {
            if assembled.len() + segment.content.len() + 1 > budget {
                break;
            }
            if !assembled.is_empty() {
                assembled.push('\n');
            }
            assembled.push_str(&segment.content);
        }

        debug!(
            "Assembled {} chars of context (budget {})",
            assembled.len(),
            budget
        );
        assembled
    }
}

fn word_overlap(query_words: &HashSet<String>, text: &str) -> f32 {
    if query_words.is_empty() {
        return 0.0;
    }
    let text_words: HashSet<String> = text
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.to_string())
        .collect();
    query_words.intersection(&text_words).count() as f32 / query_words.len() as f32
}
