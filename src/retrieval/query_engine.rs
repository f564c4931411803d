//! Query processing: variant expansion, retrieval, diversity selection,
//! and response synthesis

use crate::config::{ConversationConfig, RetrievalConfig};
use crate::embedder::Embedder;
use crate::error::{ErrorTracker, Result};
use crate::llm::LlmGateway;
use crate::retrieval::query_analyzer::{QueryAnalysis, QueryAnalyzer, QueryType};
use crate::retrieval::reranker::Reranker;
use crate::types::{
    ConfidenceLevel, DiversityMetrics, Metadata, QueryEnhancement, QueryResponse, RetrievedChunk,
};
use crate::vector_store::VectorStore;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Per-call options set by callers (the conversation layer sets the bypass)
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub filters: Option<Metadata>,
    pub top_k: Option<usize>,
    pub conversation_context: Option<String>,
    pub bypass_threshold: bool,
}

#[derive(Debug, Clone)]
struct QueryVariant {
    text: String,
    confidence: f32,
    label: String,
}

struct RetrievalOutcome {
    selected: Vec<RetrievedChunk>,
    enhancement: Option<QueryEnhancement>,
    llm_query: String,
}

/// Orchestrates the full retrieval pipeline over the vector store
pub struct QueryEngine {
    vector_store: Arc<RwLock<VectorStore>>,
    embedder: Arc<Embedder>,
    gateway: Option<Arc<LlmGateway>>,
    analyzer: Arc<QueryAnalyzer>,
    reranker: Arc<dyn Reranker>,
    retrieval: RetrievalConfig,
    conversation: ConversationConfig,
    error_tracker: Arc<ErrorTracker>,
}

impl QueryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vector_store: Arc<RwLock<VectorStore>>,
        embedder: Arc<Embedder>,
        gateway: Option<Arc<LlmGateway>>,
        analyzer: Arc<QueryAnalyzer>,
        reranker: Arc<dyn Reranker>,
        retrieval: RetrievalConfig,
        conversation: ConversationConfig,
        error_tracker: Arc<ErrorTracker>,
    ) -> Self {
        Self {
            vector_store,
            embedder,
            gateway,
            analyzer,
            reranker,
            retrieval,
            conversation,
            error_tracker,
        }
    }

    /// Process a query end to end into a response object
    pub async fn process_query(&self, query: &str, options: QueryOptions) -> Result<QueryResponse> {
        if query.trim().is_empty() {
            return Ok(QueryResponse::empty(query));
        }

        let analysis = self.analyzer.analyze(query).await;

        if analysis.query_type == QueryType::Aggregation
            && self.conversation.enable_aggregation_detection
        {
            return self.process_aggregation(query, &analysis).await;
        }

        if analysis.needs_decomposition && self.conversation.enable_query_decomposition {
            return self.process_decomposed(query, &analysis, &options).await;
        }

        let outcome = self.retrieve_internal(query, &analysis, &options).await?;
        if outcome.selected.is_empty() {
            return Ok(QueryResponse::empty(query));
        }

        let answer = self
            .synthesize(&outcome.llm_query, &outcome.selected, &options)
            .await;
        Ok(self.assemble_response(query, answer, outcome))
    }

    /// Run the retrieval pipeline (steps 1-7) without synthesis
    pub async fn retrieve(&self, query: &str, options: QueryOptions) -> Result<Vec<RetrievedChunk>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let analysis = self.analyzer.analyze(query).await;
        let outcome = self.retrieve_internal(query, &analysis, &options).await?;
        Ok(outcome.selected)
    }

    async fn retrieve_internal(
        &self,
        query: &str,
        analysis: &QueryAnalysis,
        options: &QueryOptions,
    ) -> Result<RetrievalOutcome> {
        let top_k = options.top_k.unwrap_or(self.retrieval.top_k);
        let fetch_k = if self.retrieval.enable_source_diversity {
            (3 * top_k).max(20)
        } else {
            top_k
        };

        let variants = self.build_variants(query, analysis);
        debug!(
            "Retrieving with {} variant(s), fetch_k={}",
            variants.len(),
            fetch_k
        );

        let mut merged: HashMap<String, RetrievedChunk> = HashMap::new();
        let mut variant_averages: HashMap<String, f32> = HashMap::new();

        let searches = variants
            .iter()
            .map(|variant| self.search_variant(variant, fetch_k, options));
        let search_outcomes = futures::future::join_all(searches).await;

        for (variant, outcome) in variants.iter().zip(search_outcomes) {
            let hits = match outcome {
                Ok(hits) => hits,
                Err(e) => {
                    // A failed variant narrows retrieval but does not abort it
                    warn!("Variant '{}' failed: {}", variant.label, e);
                    self.error_tracker.record("query_engine", "variant_search", &e);
                    continue;
                }
            };

            if !hits.is_empty() {
                let avg = hits.iter().map(|h| h.similarity_score).sum::<f32>() / hits.len() as f32;
                variant_averages.insert(variant.label.clone(), avg);
            }

            for hit in hits {
                let keep_new = merged
                    .get(&hit.chunk_id)
                    .map(|existing| existing.weighted_score < hit.weighted_score)
                    .unwrap_or(true);
                if keep_new {
                    merged.insert(hit.chunk_id.clone(), hit);
                }
            }
        }

        let (llm_query, enhancement) =
            self.select_llm_query(query, &variants, &variant_averages);

        let mut results: Vec<RetrievedChunk> = merged.into_values().collect();

        if !options.bypass_threshold {
            results.retain(|r| r.similarity_score >= self.retrieval.similarity_threshold);
        }

        results.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if self.retrieval.enable_reranking {
            results.truncate(self.retrieval.rerank_top_k);
            results = self.reranker.rerank(query, results, None).await;
        }

        let selected = if self.retrieval.enable_source_diversity {
            self.diverse_select(results, top_k)
        } else {
            results.truncate(top_k);
            results
        };

        Ok(RetrievalOutcome {
            selected,
            enhancement,
            llm_query,
        })
    }

    async fn search_variant(
        &self,
        variant: &QueryVariant,
        fetch_k: usize,
        options: &QueryOptions,
    ) -> Result<Vec<RetrievedChunk>> {
        let embedding = self.embedder.embed_text(&variant.text).await?;
        let store = self.vector_store.read().await;
        let hits = store.search_with_metadata(&embedding, fetch_k)?;
        drop(store);

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(filters) = &options.filters {
                let matches = filters.iter().all(|(key, expected)| {
                    hit.metadata.get(key).map(|actual| actual == expected).unwrap_or(false)
                });
                if !matches {
                    continue;
                }
            }

            let doc_id = hit
                .metadata
                .get("doc_id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let text = hit
                .metadata
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let source_label = hit
                .metadata
                .get("source_label")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();

            results.push(RetrievedChunk {
                chunk_id: hit.chunk_id,
                doc_id,
                text,
                source_label,
                metadata: hit.metadata,
                similarity_score: hit.similarity_score,
                weighted_score: hit.similarity_score * variant.confidence,
                rerank_score: None,
                original_score: None,
                diversity_score: 0.0,
                final_score: 0.0,
            });
        }
        Ok(results)
    }

    /// Up to three variants: the original plus the strongest expansions
    fn build_variants(&self, query: &str, analysis: &QueryAnalysis) -> Vec<QueryVariant> {
        let mut variants = vec![QueryVariant {
            text: query.to_string(),
            confidence: 1.0,
            label: "original".to_string(),
        }];

        if !analysis.keywords.is_empty() {
            let keyword_query = analysis.keywords.join(" ");
            if keyword_query != query.to_lowercase() {
                variants.push(QueryVariant {
                    text: keyword_query,
                    confidence: 0.8,
                    label: "keywords".to_string(),
                });
            }
        }

        if self.conversation.synonym_expansion_enabled && !analysis.synonyms.is_empty() {
            let mut expanded = query.to_lowercase();
            for replacements in analysis.synonyms.values() {
                if let Some(replacement) = replacements.first() {
                    expanded = format!("{} {}", expanded, replacement);
                }
            }
            variants.push(QueryVariant {
                text: expanded,
                confidence: 0.7,
                label: "synonyms".to_string(),
            });
        } else if let Some(entity_type) = &analysis.entity_type {
            variants.push(QueryVariant {
                text: format!("{} {}", query, entity_type),
                confidence: 0.6,
                label: "topic".to_string(),
            });
        }

        variants.truncate(3);
        variants
    }

    /// Substitute the best variant for the LLM only when it clearly wins:
    /// at least 20% above the original's average and at least 0.7 absolute
    fn select_llm_query(
        &self,
        query: &str,
        variants: &[QueryVariant],
        averages: &HashMap<String, f32>,
    ) -> (String, Option<QueryEnhancement>) {
        let overall_avg = if averages.is_empty() {
            0.0
        } else {
            averages.values().sum::<f32>() / averages.len() as f32
        };
        // The original may have produced no hits; estimate it as the overall
        // average in that case
        let original_avg = averages.get("original").copied().unwrap_or(overall_avg);

        let best = averages
            .iter()
            .filter(|(label, _)| label.as_str() != "original")
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((label, best_avg)) = best {
            if *best_avg >= original_avg * 1.2 && *best_avg >= 0.7 {
                if let Some(variant) = variants.iter().find(|v| &v.label == label) {
                    info!(
                        "Using variant '{}' for synthesis ({:.3} vs {:.3})",
                        label, best_avg, original_avg
                    );
                    return (
                        variant.text.clone(),
                        Some(QueryEnhancement {
                            original_query: query.to_string(),
                            enhanced_query: variant.text.clone(),
                            variant_label: label.clone(),
                            original_avg_score: original_avg,
                            enhanced_avg_score: *best_avg,
                        }),
                    );
                }
            }
        }

        (query.to_string(), None)
    }

    /// Score and select a diverse top-k
    fn diverse_select(&self, results: Vec<RetrievedChunk>, top_k: usize) -> Vec<RetrievedChunk> {
        if results.is_empty() {
            return results;
        }

        let weight = self.retrieval.diversity_weight;
        let mut scored = self.score_diversity(results);
        scored.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        debug!(
            "Diversity selection over {} candidates (weight={})",
            scored.len(),
            weight
        );

        let mut selected: Vec<RetrievedChunk> = Vec::with_capacity(top_k);
        let mut seen_docs: HashSet<String> = HashSet::new();
        let mut seen_types: HashSet<String> = HashSet::new();
        let mut seen_authors: HashSet<String> = HashSet::new();
        let mut per_doc: HashMap<String, usize> = HashMap::new();

        for result in scored {
            if selected.len() >= top_k {
                break;
            }

            let doc_new = !seen_docs.contains(&result.doc_id);
            let type_new = !seen_types.contains(&result.source_type());
            let author = result.author().unwrap_or_else(|| "unknown".to_string());
            let author_new = !seen_authors.contains(&author);
            let doc_count = per_doc.get(&result.doc_id).copied().unwrap_or(0);

            if doc_new || type_new || author_new || doc_count < self.retrieval.max_chunks_per_doc {
                if doc_count >= self.retrieval.max_chunks_per_doc {
                    continue;
                }
                seen_docs.insert(result.doc_id.clone());
                seen_types.insert(result.source_type());
                seen_authors.insert(author);
                *per_doc.entry(result.doc_id.clone()).or_insert(0) += 1;
                selected.push(result);
            }
        }

        selected.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        selected
    }

    /// Compute component diversity scores and the blended final score
    fn score_diversity(&self, mut results: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
        let total = results.len() as f32;
        let weight = self.retrieval.diversity_weight;

        let mut doc_counts: HashMap<String, usize> = HashMap::new();
        let mut type_counts: HashMap<String, usize> = HashMap::new();
        let mut author_counts: HashMap<String, usize> = HashMap::new();
        let mut date_counts: HashMap<String, usize> = HashMap::new();
        for result in &results {
            *doc_counts.entry(result.doc_id.clone()).or_insert(0) += 1;
            *type_counts.entry(result.source_type()).or_insert(0) += 1;
            *author_counts
                .entry(result.author().unwrap_or_else(|| "unknown".to_string()))
                .or_insert(0) += 1;
            *date_counts
                .entry(metadata_date(&result.metadata))
                .or_insert(0) += 1;
        }

        let word_sets: Vec<HashSet<String>> = results
            .iter()
            .map(|r| {
                r.text
                    .to_lowercase()
                    .split_whitespace()
                    .map(|w| w.to_string())
                    .collect()
            })
            .collect();

        for (i, result) in results.iter_mut().enumerate() {
            let doc_div = 1.0 - doc_counts[&result.doc_id] as f32 / total;
            let type_div = 1.0 - type_counts[&result.source_type()] as f32 / total;
            let author = result.author().unwrap_or_else(|| "unknown".to_string());
            let author_div = 1.0 - author_counts[&author] as f32 / total;
            let temporal_div = 1.0 - date_counts[&metadata_date(&result.metadata)] as f32 / total;

            let content_div = if word_sets.len() > 1 {
                let mut overlap_sum = 0.0;
                for (j, other) in word_sets.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    overlap_sum += jaccard(&word_sets[i], other);
                }
                1.0 - overlap_sum / (word_sets.len() - 1) as f32
            } else {
                1.0
            };

            result.diversity_score = 0.30 * doc_div
                + 0.20 * type_div
                + 0.15 * author_div
                + 0.10 * temporal_div
                + 0.25 * content_div;
            result.final_score =
                result.relevance() * (1.0 - weight) + result.diversity_score * weight;
        }

        results
    }

    async fn synthesize(
        &self,
        query: &str,
        selected: &[RetrievedChunk],
        options: &QueryOptions,
    ) -> String {
        let context_block = selected
            .iter()
            .take(5)
            .enumerate()
            .map(|(i, chunk)| format!("[Source {}: {}]\n{}", i + 1, chunk.source_label, chunk.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        if !self.conversation.enable_response_synthesis {
            return extractive_answer(selected);
        }

        let Some(gateway) = &self.gateway else {
            return extractive_answer(selected);
        };

        let history_block = options
            .conversation_context
            .as_deref()
            .map(|history| format!("Conversation so far:\n{}\n\n", history))
            .unwrap_or_default();

        let prompt = format!(
            "Answer the question using only the sources below. Cite nothing that is not in them.\n\n\
             {}Sources:\n{}\n\nQuestion: {}\n\nAnswer:",
            history_block, context_block, query
        );

        match gateway.generate(&prompt).await {
            Ok(answer) => answer.trim().to_string(),
            Err(e) => {
                warn!("Response synthesis failed, using extractive answer: {}", e);
                self.error_tracker.record("query_engine", "synthesis", &e);
                extractive_answer(selected)
            }
        }
    }

    fn assemble_response(
        &self,
        query: &str,
        answer: String,
        outcome: RetrievalOutcome,
    ) -> QueryResponse {
        let selected = outcome.selected;
        let confidence = self.confidence_score(&selected);
        let diversity_metrics = diversity_metrics(&selected);

        QueryResponse {
            query: query.to_string(),
            response: answer,
            confidence_score: confidence,
            confidence_level: ConfidenceLevel::from_score(confidence),
            total_sources: selected.len(),
            sources: selected,
            diversity_metrics,
            timestamp: Utc::now(),
            query_enhancement: outcome.enhancement,
        }
    }

    /// Weighted confidence over similarity, diversity, and score consistency
    fn confidence_score(&self, selected: &[RetrievedChunk]) -> f32 {
        if selected.is_empty() {
            return 0.0;
        }
        let n = selected.len() as f32;

        let avg_similarity = selected.iter().map(|r| r.similarity_score).sum::<f32>() / n;
        let avg_diversity = selected.iter().map(|r| r.diversity_score).sum::<f32>() / n;

        let variance = selected
            .iter()
            .map(|r| (r.similarity_score - avg_similarity).powi(2))
            .sum::<f32>()
            / n;
        let consistency = (1.0 - variance).max(0.0);

        let unique_docs: HashSet<&str> = selected.iter().map(|r| r.doc_id.as_str()).collect();
        let diversity_bonus = if unique_docs.len() > 1 { 1.0 } else { 0.0 };

        let high_quality = selected.iter().filter(|r| r.similarity_score >= 0.75).count();

        let mut confidence = 0.50 * avg_similarity
            + 0.30 * avg_diversity
            + 0.15 * consistency
            + 0.05 * diversity_bonus
            + 0.01 * high_quality as f32;

        if unique_docs.len() == 1 && selected.len() > 2 {
            confidence -= 0.10;
        }

        debug!(
            "Confidence {:.3} (similarity={:.3}, diversity={:.3}, consistency={:.3})",
            confidence, avg_similarity, avg_diversity, consistency
        );
        confidence.clamp(0.0, 1.0)
    }

    /// Execute each sub-query, then synthesise once over all of them
    async fn process_decomposed(
        &self,
        query: &str,
        analysis: &QueryAnalysis,
        options: &QueryOptions,
    ) -> Result<QueryResponse> {
        let sub_queries: Vec<&String> = analysis
            .decomposed_queries
            .iter()
            .take(self.conversation.max_decomposed_queries)
            .collect();
        info!("Decomposed query into {} sub-queries", sub_queries.len());

        let mut sections = Vec::new();
        let mut all_sources: Vec<RetrievedChunk> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for sub_query in &sub_queries {
            let sub_analysis = QueryAnalysis {
                needs_decomposition: false,
                decomposed_queries: Vec::new(),
                ..self.analyzer.heuristic_analyze(sub_query)
            };
            match self.retrieve_internal(sub_query, &sub_analysis, options).await {
                Ok(outcome) => {
                    let block = outcome
                        .selected
                        .iter()
                        .take(3)
                        .map(|c| format!("- ({}) {}", c.source_label, c.text))
                        .collect::<Vec<_>>()
                        .join("\n");
                    sections.push(format!("Sub-question: {}\n{}", sub_query, block));
                    for chunk in outcome.selected {
                        if seen.insert(chunk.chunk_id.clone()) {
                            all_sources.push(chunk);
                        }
                    }
                }
                Err(e) => {
                    warn!("Sub-query '{}' failed: {}", sub_query, e);
                    self.error_tracker.record("query_engine", "sub_query", &e);
                }
            }
        }

        if all_sources.is_empty() {
            return Ok(QueryResponse::empty(query));
        }

        let answer = match &self.gateway {
            Some(gateway) if self.conversation.enable_response_synthesis => {
                let prompt = format!(
                    "Combine the findings below into one complete answer to the question.\n\n\
                     {}\n\nQuestion: {}\n\nAnswer:",
                    sections.join("\n\n"),
                    query
                );
                match gateway.generate(&prompt).await {
                    Ok(answer) => answer.trim().to_string(),
                    Err(e) => {
                        warn!("Decomposed synthesis failed: {}", e);
                        extractive_answer(&all_sources)
                    }
                }
            }
            _ => extractive_answer(&all_sources),
        };

        let confidence = self.confidence_score(&all_sources);
        let diversity_metrics = diversity_metrics(&all_sources);
        Ok(QueryResponse {
            query: query.to_string(),
            response: answer,
            confidence_score: confidence,
            confidence_level: ConfidenceLevel::from_score(confidence),
            total_sources: all_sources.len(),
            sources: all_sources,
            diversity_metrics,
            timestamp: Utc::now(),
            query_enhancement: None,
        })
    }

    /// Count matching documents instead of retrieving passages
    async fn process_aggregation(
        &self,
        query: &str,
        analysis: &QueryAnalysis,
    ) -> Result<QueryResponse> {
        let terms = self.derive_search_terms(analysis).await;
        let store = self.vector_store.read().await;

        let mut total = 0usize;
        for term in &terms {
            let mut filters = analysis.filters.clone();
            filters.insert("text_contains".to_string(), json!(term));
            let count = store.count_documents(&filters);
            debug!("Aggregation term '{}' matched {} documents", term, count);
            total += count;
        }

        // Without usable terms (or when none matched), the structured
        // filters alone decide the count
        if total == 0 {
            total = store.count_documents(&analysis.filters);
        }
        drop(store);

        info!("Aggregation query answered with count {}", total);

        let filters_desc = if analysis.filters.is_empty() {
            String::new()
        } else {
            let parts: Vec<String> = analysis
                .filters
                .iter()
                .map(|(k, v)| format!("{}~{}", k, v.as_str().unwrap_or("?")))
                .collect();
            format!(" (filters: {})", parts.join(", "))
        };

        Ok(QueryResponse {
            query: query.to_string(),
            response: format!("{}{}", total, filters_desc),
            confidence_score: if total > 0 { 0.8 } else { 0.3 },
            confidence_level: if total > 0 {
                ConfidenceLevel::High
            } else {
                ConfidenceLevel::Low
            },
            sources: Vec::new(),
            total_sources: 0,
            diversity_metrics: DiversityMetrics::default(),
            timestamp: Utc::now(),
            query_enhancement: None,
        })
    }

    async fn derive_search_terms(&self, analysis: &QueryAnalysis) -> Vec<String> {
        if let (Some(gateway), Some(entity_type)) = (&self.gateway, &analysis.entity_type) {
            let prompt = format!(
                "List search terms for counting records of type '{}'. \
                 Answer with a JSON array of strings only.",
                entity_type
            );
            if let Ok(answer) = gateway.generate(&prompt).await {
                if let Ok(terms) = serde_json::from_str::<Vec<String>>(answer.trim()) {
                    if !terms.is_empty() {
                        return terms;
                    }
                }
            }
        }

        analysis
            .entity_type
            .iter()
            .map(|e| e.to_string())
            .collect()
    }
}

fn metadata_date(metadata: &Metadata) -> String {
    metadata
        .get("created_date")
        .or_else(|| metadata.get("created_at"))
        .and_then(|v| v.as_str())
        .map(|d| d.chars().take(10).collect())
        .unwrap_or_else(|| "unknown".to_string())
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

fn extractive_answer(selected: &[RetrievedChunk]) -> String {
    selected
        .iter()
        .take(3)
        .map(|chunk| chunk.text.clone())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn diversity_metrics(selected: &[RetrievedChunk]) -> DiversityMetrics {
    if selected.is_empty() {
        return DiversityMetrics::default();
    }
    let unique_documents: HashSet<&str> = selected.iter().map(|r| r.doc_id.as_str()).collect();
    let unique_source_types: HashSet<String> = selected.iter().map(|r| r.source_type()).collect();
    let diversity_index =
        selected.iter().map(|r| r.diversity_score).sum::<f32>() / selected.len() as f32;

    DiversityMetrics {
        unique_documents: unique_documents.len(),
        unique_source_types: unique_source_types.len(),
        diversity_index,
        coverage_score: unique_documents.len() as f32 / selected.len() as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedder::EmbeddingProvider;
    use crate::retrieval::reranker::SimilarityReranker;
    use crate::vector_store::DistanceMetric;
    use async_trait::async_trait;

    struct WordProvider;

    #[async_trait]
    impl EmbeddingProvider for WordProvider {
        fn name(&self) -> &str {
            "word"
        }

        fn get_dimension(&self) -> usize {
            16
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; 16];
                    for word in text.to_lowercase().split_whitespace() {
                        let mut h = 0usize;
                        for b in word.bytes() {
                            h = h.wrapping_mul(31).wrapping_add(b as usize);
                        }
                        v[h % 16] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    async fn engine_with_corpus(
        corpus: Vec<(&str, &str, &str)>, // (chunk_id, doc_id, text)
        retrieval: RetrievalConfig,
    ) -> QueryEngine {
        let storage = crate::config::StorageConfig {
            vector_db_url: "sqlite::memory:".to_string(),
            metadata_db_url: "sqlite::memory:".to_string(),
            vector_capacity: 1000,
        };
        let embedder = Arc::new(Embedder::new(
            Arc::new(WordProvider),
            EmbeddingConfig {
                dimension: 16,
                ..EmbeddingConfig::default()
            },
        ));
        let mut store = VectorStore::open(&storage, 16, DistanceMetric::Cosine)
            .await
            .unwrap();

        let texts: Vec<String> = corpus.iter().map(|(_, _, t)| t.to_string()).collect();
        let embeddings = embedder.embed_texts(&texts).await.unwrap();
        let projections = corpus
            .iter()
            .map(|(chunk_id, doc_id, text)| {
                let mut m = Metadata::new();
                m.insert("chunk_id".to_string(), json!(chunk_id));
                m.insert("doc_id".to_string(), json!(doc_id));
                m.insert("text".to_string(), json!(text));
                m.insert("source_type".to_string(), json!("text"));
                m.insert("source_label".to_string(), json!(format!("{}.txt", doc_id)));
                m
            })
            .collect();
        store.add_vectors(embeddings, projections).await.unwrap();

        let conversation = ConversationConfig {
            enable_llm_query_analysis: false,
            ..ConversationConfig::default()
        };
        QueryEngine::new(
            Arc::new(RwLock::new(store)),
            embedder,
            None,
            Arc::new(QueryAnalyzer::new(None, conversation.clone())),
            Arc::new(SimilarityReranker::new()),
            retrieval,
            conversation,
            Arc::new(ErrorTracker::new()),
        )
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty_response() {
        let engine = engine_with_corpus(vec![], RetrievalConfig::default()).await;
        let response = engine
            .process_query("", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(response.confidence_score, 0.0);
        assert!(response.sources.is_empty());
    }

    #[tokio::test]
    async fn test_basic_retrieval_finds_relevant_chunk() {
        let engine = engine_with_corpus(
            vec![
                ("c1", "d1", "the capital of france is paris"),
                ("c2", "d2", "bananas are yellow fruit"),
            ],
            RetrievalConfig {
                similarity_threshold: 0.1,
                ..RetrievalConfig::default()
            },
        )
        .await;

        let response = engine
            .process_query("what is the capital of france", QueryOptions::default())
            .await
            .unwrap();
        assert!(response.total_sources >= 1);
        assert_eq!(response.sources[0].chunk_id, "c1");
        assert!(response.response.contains("paris"));
    }

    #[tokio::test]
    async fn test_threshold_filters_weak_results() {
        let engine = engine_with_corpus(
            vec![("c1", "d1", "completely unrelated content about gardening")],
            RetrievalConfig {
                similarity_threshold: 0.99,
                ..RetrievalConfig::default()
            },
        )
        .await;

        let response = engine
            .process_query("quantum networking protocols", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(response.total_sources, 0);
        assert_eq!(response.confidence_score, 0.0);

        // The conversation layer can bypass the threshold
        let bypassed = engine
            .retrieve(
                "quantum networking protocols",
                QueryOptions {
                    bypass_threshold: true,
                    ..QueryOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(bypassed.len(), 1);
    }

    #[tokio::test]
    async fn test_diversity_selection_caps_dominant_document() {
        let mut corpus: Vec<(String, String, String)> = Vec::new();
        for i in 0..10 {
            corpus.push((
                format!("dom{}", i),
                "dominant".to_string(),
                format!("network switch port configuration item {}", i),
            ));
        }
        for i in 0..4 {
            corpus.push((
                format!("other{}", i),
                format!("doc{}", i),
                format!("network switch port configuration variant {}", i + 100),
            ));
        }
        let corpus_refs: Vec<(&str, &str, &str)> = corpus
            .iter()
            .map(|(a, b, c)| (a.as_str(), b.as_str(), c.as_str()))
            .collect();

        let engine = engine_with_corpus(
            corpus_refs,
            RetrievalConfig {
                similarity_threshold: 0.0,
                top_k: 5,
                max_chunks_per_doc: 3,
                enable_source_diversity: true,
                ..RetrievalConfig::default()
            },
        )
        .await;

        let selected = engine
            .retrieve(
                "network switch port configuration",
                QueryOptions {
                    bypass_threshold: true,
                    ..QueryOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(selected.len(), 5);
        let dominant_count = selected.iter().filter(|c| c.doc_id == "dominant").count();
        assert!(
            dominant_count <= 3,
            "dominant doc exceeded max_chunks_per_doc: {}",
            dominant_count
        );
        let unique_docs: HashSet<&str> = selected.iter().map(|c| c.doc_id.as_str()).collect();
        assert!(unique_docs.len() >= 3);
    }

    #[tokio::test]
    async fn test_aggregation_counts_documents() {
        let engine = engine_with_corpus(vec![], RetrievalConfig::default()).await;
        {
            // Seed ticket documents with created_date metadata
            let mut store = engine.vector_store.write().await;
            let texts = [
                ("t1", "doc1", "2025-12-01"),
                ("t2", "doc2", "2025-12-15"),
                ("t3", "doc3", "2025-11-30"),
            ];
            let embedder = &engine.embedder;
            for (chunk_id, doc_id, date) in texts {
                let text = format!("incident record for {}", doc_id);
                let embedding = embedder.embed_text(&text).await.unwrap();
                let mut m = Metadata::new();
                m.insert("chunk_id".to_string(), json!(chunk_id));
                m.insert("doc_id".to_string(), json!(doc_id));
                m.insert("text".to_string(), json!(text));
                m.insert("source_type".to_string(), json!("ticket"));
                m.insert("created_date".to_string(), json!(date));
                store.add_vectors(vec![embedding], vec![m]).await.unwrap();
            }
        }

        let response = engine
            .process_query(
                "How many incidents were created in December?",
                QueryOptions::default(),
            )
            .await
            .unwrap();
        assert!(response.response.starts_with('2'));
    }

    #[tokio::test]
    async fn test_decomposed_query_covers_all_targets() {
        let engine = engine_with_corpus(
            vec![
                ("a1", "da", "Building A has AP models M1 and M2 installed"),
                ("b1", "db", "Building B has AP model M3 installed"),
            ],
            RetrievalConfig {
                similarity_threshold: 0.0,
                ..RetrievalConfig::default()
            },
        )
        .await;

        let response = engine
            .process_query(
                "List all AP models in Building A and Building B",
                QueryOptions {
                    bypass_threshold: true,
                    ..QueryOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(response.total_sources >= 2);
        let combined = response.response.to_lowercase();
        assert!(combined.contains("m1"));
        assert!(combined.contains("m3"));
    }
}
