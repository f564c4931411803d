//! Conversation graph nodes
//!
//! Each node consumes the conversation state by value and returns a new
//! state, optionally with a user-visible response. Failures inside nodes
//! never surface raw errors to the user; the respond node substitutes a
//! safe fallback instead.

use crate::config::MemoryConfig;
use crate::conversation::context::ContextManager;
use crate::conversation::state::{
    ContextQuality, ConversationMessage, ConversationPhase, ConversationState, MessageRole,
};
use crate::conversation::validator::ResponseValidator;
use crate::error::Result;
use crate::llm::LlmGateway;
use crate::retrieval::{Intent, QueryAnalyzer, QueryEngine, QueryOptions};
use crate::types::RetrievedChunk;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

const SAFE_NO_RESULTS: &str =
    "I couldn't find relevant information to answer that confidently. Could you rephrase or add detail?";
const SAFE_PROBLEM: &str =
    "I encountered a problem while preparing that answer, so I'd rather not guess. Please try again.";

const PERSON_KEYWORDS: &[&str] = &[
    "employee", "role", "department", "manager", "team", "contact", "email", "phone", "office",
    "title", "position",
];

/// Shared dependencies for all nodes
pub struct ConversationNodes {
    query_engine: Arc<QueryEngine>,
    analyzer: Arc<QueryAnalyzer>,
    gateway: Option<Arc<LlmGateway>>,
    context: ContextManager,
    validator: ResponseValidator,
    memory: MemoryConfig,
}

impl ConversationNodes {
    pub fn new(
        query_engine: Arc<QueryEngine>,
        analyzer: Arc<QueryAnalyzer>,
        gateway: Option<Arc<LlmGateway>>,
        memory: MemoryConfig,
    ) -> Self {
        Self {
            query_engine,
            analyzer,
            gateway,
            context: ContextManager::new(memory.clone()),
            validator: ResponseValidator::new(),
            memory,
        }
    }

    pub fn context_manager(&self) -> &ContextManager {
        &self.context
    }

    /// initialize: a fresh state in the greeting phase
    pub fn initialize(&self) -> ConversationState {
        ConversationState::new().with_phase(ConversationPhase::Greeting)
    }

    /// greet: the opening assistant message
    pub fn greet(&self, state: ConversationState) -> (ConversationState, String) {
        let greeting =
            "Hello! I can answer questions about your ingested documents and tickets. What would you like to know?";
        let mut state = state.add_message(
            ConversationMessage::new(MessageRole::Assistant, greeting).validated(),
            self.memory.max_conversation_history,
        );
        state.suggestions = vec![
            "What documents do you have?".to_string(),
            "Summarize recent incidents".to_string(),
        ];
        (state.with_phase(ConversationPhase::Greeting), greeting.to_string())
    }

    /// understand: record the user message, quarantine poisoned content,
    /// analyse the query, and resolve contextual references
    pub async fn understand(
        &self,
        state: ConversationState,
        user_text: &str,
    ) -> ConversationState {
        let message = ConversationMessage::new(MessageRole::User, user_text);
        let message_id = message.id.clone();

        let poisoned = self.context.detect_poisoning(user_text).is_some();
        let message = if poisoned {
            message.with_quality(0.0).with_confidence(0.0)
        } else {
            message
        };

        let mut state = state.add_message(message, self.memory.max_conversation_history);
        if poisoned {
            warn!("Quarantining poisoned user content {}", message_id);
            state.poisoned_content_ids.insert(message_id);
        }

        let analysis = self.analyzer.analyze(user_text).await;
        state.original_query = user_text.to_string();
        state.processed_query = user_text.to_string();

        if analysis.is_contextual && !poisoned {
            if let Some(enhanced) = self.enhance_contextual_query(&state, user_text).await {
                debug!("Enhanced contextual query: {}", enhanced);
                state.processed_query = enhanced;
            }
        }

        state.analysis = Some(analysis);
        state.with_phase(ConversationPhase::Understanding)
    }

    /// Resolve pronouns and references with the last few messages
    async fn enhance_contextual_query(
        &self,
        state: &ConversationState,
        query: &str,
    ) -> Option<String> {
        let gateway = self.gateway.as_ref()?;
        let history: Vec<String> = state
            .recent_messages(5)
            .iter()
            .filter(|m| !state.poisoned_content_ids.contains(&m.id))
            .map(|m| {
                let role = match m.role {
                    MessageRole::User => "User",
                    MessageRole::Assistant => "Assistant",
                    MessageRole::System => "System",
                };
                format!("{}: {}", role, m.content)
            })
            .collect();
        if history.is_empty() {
            return None;
        }

        let prompt = format!(
            "Rewrite the final user question so it stands alone, resolving any references \
             to the conversation. Answer with the rewritten question only.\n\n{}\n\nQuestion: {}",
            history.join("\n"),
            query
        );

        match gateway.generate(&prompt).await {
            Ok(enhanced) if !enhanced.trim().is_empty() => Some(enhanced.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                debug!("Contextual enhancement failed: {}", e);
                None
            }
        }
    }

    /// search: retrieve supporting chunks with the threshold bypassed
    pub async fn search(&self, state: ConversationState) -> ConversationState {
        let mut state = state.with_phase(ConversationPhase::Searching);
        let query = state.processed_query.clone();

        let person = state
            .analysis
            .as_ref()
            .and_then(|a| a.person_entities.first().cloned());

        let results = match person {
            Some(name) => self.person_search(&name, &query).await,
            None => {
                let options = QueryOptions {
                    bypass_threshold: true,
                    conversation_context: Some(self.context.assemble(&state, &query)),
                    ..QueryOptions::default()
                };
                self.query_engine.retrieve(&query, options).await
            }
        };

        match results {
            Ok(results) => {
                info!("Search produced {} results", results.len());
                state.search_results = results;
            }
            Err(e) => {
                warn!("Search failed: {}", e);
                state = state.record_error(format!("search: {}", e));
                state.search_results = Vec::new();
            }
        }

        state
    }

    /// Multi-strategy person search ranked by person relevance
    async fn person_search(&self, name: &str, query: &str) -> Result<Vec<RetrievedChunk>> {
        let strategies = [
            name.to_string(),
            format!("{} role department", name),
            format!("{} employee contact details", name),
            query.to_string(),
        ];

        let mut merged: Vec<RetrievedChunk> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for strategy in &strategies {
            let options = QueryOptions {
                bypass_threshold: true,
                ..QueryOptions::default()
            };
            match self.query_engine.retrieve(strategy, options).await {
                Ok(results) => {
                    for chunk in results {
                        if seen.insert(chunk.chunk_id.clone()) {
                            merged.push(chunk);
                        }
                    }
                }
                Err(e) => {
                    debug!("Person strategy '{}' failed: {}", strategy, e);
                }
            }
        }

        let avg: f32 = if merged.is_empty() {
            0.0
        } else {
            merged
                .iter()
                .map(|c| person_relevance_score(&c.text, name))
                .sum::<f32>()
                / merged.len() as f32
        };
        debug!("Person search for '{}': avg relevance {:.3}", name, avg);

        merged.sort_by(|a, b| {
            person_relevance_score(&b.text, name)
                .partial_cmp(&person_relevance_score(&a.text, name))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(merged)
    }

    /// respond: produce, validate, and record the assistant's answer
    pub async fn respond(&self, state: ConversationState) -> (ConversationState, String) {
        let mut state = state.with_phase(ConversationPhase::Responding);
        state.overall_quality = self.context.assess_quality(&state);

        // Direct replies for greeting/help intents skip retrieval entirely
        let intent = state.analysis.as_ref().map(|a| a.intent);
        match intent {
            Some(Intent::Greeting) => {
                return self.record_response(
                    state,
                    "Hello again! Ask me anything about your documents.".to_string(),
                    1.0,
                    true,
                );
            }
            Some(Intent::Help) => {
                let help = "I search your ingested documents and tickets, combine the most \
                            relevant passages, and answer with sources. Try asking about a \
                            document, a person, or incident counts.";
                return self.record_response(state, help.to_string(), 1.0, true);
            }
            _ => {}
        }

        // Degraded context never reaches the model
        if matches!(
            state.overall_quality,
            ContextQuality::Poisoned | ContextQuality::Conflicted
        ) {
            warn!(
                "Context quality {:?}, returning safe response",
                state.overall_quality
            );
            return self.record_response(state, SAFE_NO_RESULTS.to_string(), 0.2, false);
        }

        let query = state.processed_query.clone();
        let needs_decomposition = state
            .analysis
            .as_ref()
            .map(|a| a.needs_decomposition)
            .unwrap_or(false);
        let person = state
            .analysis
            .as_ref()
            .and_then(|a| a.person_entities.first().cloned());

        let candidate = if let Some(name) = person {
            self.person_response(&state, &name)
        } else {
            let options = QueryOptions {
                bypass_threshold: true,
                conversation_context: Some(self.context.assemble(&state, &query)),
                ..QueryOptions::default()
            };
            // Decomposition and aggregation are both delegated to the query
            // engine, which routes on the analysis flags
            match self.query_engine.process_query(&query, options).await {
                Ok(response) if !response.response.is_empty() => {
                    if needs_decomposition {
                        debug!("Structured synthesis over decomposed results");
                    }
                    Some(response.response)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("Response generation failed: {}", e);
                    state = state.record_error(format!("respond: {}", e));
                    return self.record_response(state, SAFE_PROBLEM.to_string(), 0.1, false);
                }
            }
        };

        let Some(candidate) = candidate else {
            return self.record_response(state, SAFE_NO_RESULTS.to_string(), 0.2, false);
        };

        state = state.with_phase(ConversationPhase::Validating);
        let report =
            self.validator
                .validate(&candidate, &query, &state.search_results, &state);

        if report.passed {
            self.record_response(state, candidate, report.confidence, true)
        } else {
            info!(
                "Validation failed (confidence {:.2}), substituting safe response",
                report.confidence
            );
            for check in report.checks.iter().filter(|c| !c.passed) {
                state = state.record_error(format!("validation/{}: {:?}", check.name, check.errors));
            }
            self.record_response(state, SAFE_NO_RESULTS.to_string(), report.confidence, false)
        }
    }

    fn record_response(
        &self,
        state: ConversationState,
        response: String,
        confidence: f32,
        validated: bool,
    ) -> (ConversationState, String) {
        let mut message = ConversationMessage::new(MessageRole::Assistant, response.clone())
            .with_confidence(confidence)
            .with_quality(confidence);
        if validated {
            message = message.validated();
        }

        let mut state = state
            .add_message(message, self.memory.max_conversation_history)
            .with_phase(ConversationPhase::Responding);
        state.suggestions = self.suggestions_for(&state);
        (state, response)
    }

    /// Structured person-information extraction from the search results
    fn person_response(&self, state: &ConversationState, name: &str) -> Option<String> {
        if state.search_results.is_empty() {
            return None;
        }

        let combined: String = state
            .search_results
            .iter()
            .take(5)
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let mut lines = vec![format!("Name: {}", name)];
        if let Some(role) = capture_first(&combined, person_field_regexes().role()) {
            lines.push(format!("Role: {}", role));
        }
        if let Some(department) = capture_first(&combined, person_field_regexes().department()) {
            lines.push(format!("Department: {}", department));
        }
        if let Some(email) = capture_first(&combined, person_field_regexes().email()) {
            lines.push(format!("Contact: {}", email));
        }
        if let Some(location) = capture_first(&combined, person_field_regexes().location()) {
            lines.push(format!("Location: {}", location));
        }

        if lines.len() == 1 {
            // Nothing structured found; quote the most relevant passage
            let best = &state.search_results[0];
            return Some(format!("Here's what I found about {}: {}", name, best.text));
        }
        Some(lines.join("\n"))
    }

    fn suggestions_for(&self, state: &ConversationState) -> Vec<String> {
        let entity = state
            .analysis
            .as_ref()
            .and_then(|a| a.entity_type.as_deref());
        match entity {
            Some("person") => vec![
                "What is their department?".to_string(),
                "How can I contact them?".to_string(),
            ],
            Some("incident") => vec![
                "How many incidents are open?".to_string(),
                "Show the most recent incident".to_string(),
            ],
            Some("network") => vec![
                "List devices in another building".to_string(),
                "Which models are deployed?".to_string(),
            ],
            _ => vec!["Ask a follow-up question".to_string()],
        }
    }

    /// clarify: ask the user to narrow an ambiguous query
    pub fn clarify(&self, state: ConversationState) -> (ConversationState, String) {
        let question =
            "I need a bit more detail to answer that. Which document, system, or time range do you mean?";
        let mut state = state.add_message(
            ConversationMessage::new(MessageRole::Assistant, question),
            self.memory.max_conversation_history,
        );
        state.suggestions = vec!["Rephrase with more detail".to_string()];
        (state.with_phase(ConversationPhase::Clarifying), question.to_string())
    }

    /// end: close the thread
    pub fn end_conversation(&self, state: ConversationState) -> (ConversationState, String) {
        let farewell = "Goodbye! Start a new conversation whenever you need me.";
        let state = state
            .add_message(
                ConversationMessage::new(MessageRole::Assistant, farewell).validated(),
                self.memory.max_conversation_history,
            )
            .with_phase(ConversationPhase::Ending);
        (state, farewell.to_string())
    }
}

/// Score how much a chunk is about the named person.
///
/// Full-name match adds 1.0, each name part 0.3, each person keyword 0.1,
/// and each same-sentence co-occurrence of a name part and a keyword 0.2,
/// capped at 2.0.
pub fn person_relevance_score(text: &str, full_name: &str) -> f32 {
    let lower = text.to_lowercase();
    let name_lower = full_name.to_lowercase();
    let mut score = 0.0f32;

    if lower.contains(&name_lower) {
        score += 1.0;
    }

    let parts: Vec<&str> = name_lower.split_whitespace().collect();
    for part in &parts {
        if lower.contains(part) {
            score += 0.3;
        }
    }

    for keyword in PERSON_KEYWORDS {
        if lower.contains(keyword) {
            score += 0.1;
        }
    }

    for sentence in lower.split(['.', '!', '?']) {
        let has_part = parts.iter().any(|p| sentence.contains(p));
        let has_keyword = PERSON_KEYWORDS.iter().any(|k| sentence.contains(k));
        if has_part && has_keyword {
            score += 0.2;
        }
    }

    score.min(2.0)
}

struct PersonFieldRegexes {
    role: regex::Regex,
    department: regex::Regex,
    email: regex::Regex,
    location: regex::Regex,
}

impl PersonFieldRegexes {
    fn role(&self) -> &regex::Regex {
        &self.role
    }
    fn department(&self) -> &regex::Regex {
        &self.department
    }
    fn email(&self) -> &regex::Regex {
        &self.email
    }
    fn location(&self) -> &regex::Regex {
        &self.location
    }
}

fn person_field_regexes() -> &'static PersonFieldRegexes {
    static REGEXES: OnceLock<PersonFieldRegexes> = OnceLock::new();
    REGEXES.get_or_init(|| PersonFieldRegexes {
        role: regex::Regex::new(
            r"(?i)(?:role|title|position)\s*[:\-]\s*([A-Za-z][A-Za-z ]{2,40})",
        )
        .expect("static role pattern"),
        department: regex::Regex::new(r"(?i)department\s*[:\-]?\s*(?:of\s+)?([A-Za-z][A-Za-z ]{2,40})")
            .expect("static department pattern"),
        email: regex::Regex::new(r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}")
            .expect("static email pattern"),
        location: regex::Regex::new(
            r"(?i)(?:located\s+in|office|building)\s*[:\-]?\s*([A-Za-z0-9][A-Za-z0-9 ]{0,30})",
        )
        .expect("static location pattern"),
    })
}

fn capture_first(text: &str, pattern: &regex::Regex) -> Option<String> {
    pattern.captures(text).map(|caps| {
        caps.get(1)
            .map(|m| m.as_str())
            .unwrap_or_else(|| caps.get(0).map(|m| m.as_str()).unwrap_or(""))
            .trim()
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_person_relevance_scoring() {
        let text = "Maria Garcia is an employee in the Networking department. Her role: Senior Engineer.";
        let score = person_relevance_score(text, "Maria Garcia");
        // Full name + both parts + several keywords + co-occurrences
        assert!(score > 1.5);
        assert!(score <= 2.0);

        let unrelated = "The switch in Building B was replaced.";
        assert!(person_relevance_score(unrelated, "Maria Garcia") < 0.5);
    }

    #[test]
    fn test_person_relevance_caps_at_two() {
        let text = "Maria Garcia employee role department manager team contact email phone office title position. ".repeat(5);
        assert_eq!(person_relevance_score(&text, "Maria Garcia"), 2.0);
    }

    #[test]
    fn test_person_field_extraction() {
        let text = "Role: Senior Engineer. Department of Networking. Reach her at maria.garcia@example.com, office: Building A.";
        assert_eq!(
            capture_first(text, person_field_regexes().role()).as_deref(),
            Some("Senior Engineer")
        );
        assert_eq!(
            capture_first(text, person_field_regexes().email()).as_deref(),
            Some("maria.garcia@example.com")
        );
    }
}
