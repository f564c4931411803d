//! Conversation state passed by value through the graph
//!
//! Nodes never share a mutable state object: each node consumes a state and
//! returns a new one, and the graph runner swaps the thread's state
//! atomically. Message history is bounded by configuration.

use crate::conversation::context::ContextSegment;
use crate::retrieval::QueryAnalysis;
use crate::types::RetrievedChunk;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Position of a thread in the conversation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationPhase {
    Greeting,
    Understanding,
    Searching,
    Responding,
    Validating,
    Clarifying,
    Ending,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Quality tag for messages and context segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContextQuality {
    High,
    Medium,
    Low,
    Conflicted,
    Poisoned,
}

impl ContextQuality {
    /// Weight applied when ranking segments for prompt assembly
    pub fn weight(&self) -> f32 {
        match self {
            ContextQuality::High => 1.0,
            ContextQuality::Medium => 0.7,
            ContextQuality::Low => 0.4,
            ContextQuality::Conflicted => 0.2,
            ContextQuality::Poisoned => 0.0,
        }
    }
}

/// A single message in a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub validated: bool,
    pub quality_score: f32,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            confidence: 1.0,
            validated: false,
            quality_score: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_quality(mut self, quality_score: f32) -> Self {
        self.quality_score = quality_score.clamp(0.0, 1.0);
        self
    }

    pub fn validated(mut self) -> Self {
        self.validated = true;
        self
    }
}

/// Full per-thread conversation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    pub messages: Vec<ConversationMessage>,
    pub turn_count: usize,
    pub phase: ConversationPhase,
    pub original_query: String,
    pub processed_query: String,
    pub analysis: Option<QueryAnalysis>,
    pub search_results: Vec<RetrievedChunk>,
    pub context_segments: Vec<ContextSegment>,
    pub errors: Vec<String>,
    /// Quarantined content IDs; never enters a prompt again on this thread
    pub poisoned_content_ids: HashSet<String>,
    pub conflict_count: usize,
    pub overall_quality: ContextQuality,
    pub suggestions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ConversationState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            thread_id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            turn_count: 0,
            phase: ConversationPhase::Greeting,
            original_query: String::new(),
            processed_query: String::new(),
            analysis: None,
            search_results: Vec::new(),
            context_segments: Vec::new(),
            errors: Vec::new(),
            poisoned_content_ids: HashSet::new(),
            conflict_count: 0,
            overall_quality: ContextQuality::High,
            suggestions: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Append a message, bounding history to `max_history` messages
    pub fn add_message(mut self, message: ConversationMessage, max_history: usize) -> Self {
        if message.role == MessageRole::User {
            self.turn_count += 1;
        }
        self.messages.push(message);
        if self.messages.len() > max_history {
            let excess = self.messages.len() - max_history;
            self.messages.drain(0..excess);
        }
        self.last_activity = Utc::now();
        self
    }

    pub fn with_phase(mut self, phase: ConversationPhase) -> Self {
        self.phase = phase;
        self
    }

    /// The most recent `count` messages, oldest first
    pub fn recent_messages(&self, count: usize) -> &[ConversationMessage] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }

    pub fn last_user_message(&self) -> Option<&ConversationMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
    }

    /// Validated assistant statements used for consistency checking
    pub fn validated_assistant_messages(&self) -> Vec<&ConversationMessage> {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant && m.validated)
            .collect()
    }

    pub fn record_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    /// Average quality of messages, degraded by the error rate
    pub fn average_message_quality(&self) -> f32 {
        if self.messages.is_empty() {
            return 1.0;
        }
        let avg = self.messages.iter().map(|m| m.quality_score).sum::<f32>()
            / self.messages.len() as f32;
        let error_rate =
            self.errors.len() as f32 / (self.messages.len() + self.errors.len()) as f32;
        avg * (1.0 - error_rate)
    }

    pub fn is_idle(&self, timeout_hours: i64) -> bool {
        Utc::now() - self.last_activity > Duration::hours(timeout_hours)
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_history_is_bounded() {
        let mut state = ConversationState::new();
        for i in 0..30 {
            state = state.add_message(
                ConversationMessage::new(MessageRole::User, format!("message {}", i)),
                20,
            );
        }
        assert_eq!(state.messages.len(), 20);
        assert_eq!(state.turn_count, 30);
        // Oldest messages were pruned
        assert_eq!(state.messages[0].content, "message 10");
    }

    #[test]
    fn test_last_user_message() {
        let state = ConversationState::new()
            .add_message(ConversationMessage::new(MessageRole::User, "question"), 20)
            .add_message(ConversationMessage::new(MessageRole::Assistant, "answer"), 20);
        assert_eq!(state.last_user_message().unwrap().content, "question");
    }

    #[test]
    fn test_average_quality_degrades_with_errors() {
        let clean = ConversationState::new()
            .add_message(ConversationMessage::new(MessageRole::User, "hi"), 20);
        assert!((clean.average_message_quality() - 1.0).abs() < 1e-6);

        let with_errors = clean.record_error("something failed");
        assert!(with_errors.average_message_quality() < 1.0);
    }

    #[test]
    fn test_quality_weights() {
        assert_eq!(ContextQuality::High.weight(), 1.0);
        assert_eq!(ContextQuality::Poisoned.weight(), 0.0);
        assert!(ContextQuality::Medium.weight() > ContextQuality::Low.weight());
    }
}
