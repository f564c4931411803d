//! Retrieval core: analysis, search, reranking, and response composition

pub mod query_analyzer;
pub mod query_engine;
pub mod reranker;

pub use query_analyzer::{
    ActionType, Complexity, Intent, QueryAnalysis, QueryAnalyzer, QueryType, Scope,
};
pub use query_engine::{QueryEngine, QueryOptions};
pub use reranker::{CrossEncoderProvider, CrossEncoderReranker, Reranker, SimilarityReranker};
