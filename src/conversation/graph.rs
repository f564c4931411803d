//! Conversation graph runner
//!
//! Transitions: initialize -> greet -> wait_for_input; wait_for_input ->
//! understand; understand -> end (goodbye) | respond (greeting/help) |
//! search (everything else); search -> respond; respond -> wait_for_input.
//!
//! Each turn runs on a copy of the thread's state and the result replaces
//! it atomically under the per-thread lock; an aborted turn therefore
//! discards partial state and appends no user-visible message.

use crate::config::MemoryConfig;
use crate::conversation::nodes::ConversationNodes;
use crate::conversation::state::{ConversationPhase, ConversationState};
use crate::error::{RagError, Result};
use crate::retrieval::Intent;
use crate::types::RetrievedChunk;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// What a conversation API call returns for one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub thread_id: String,
    pub response: String,
    pub sources: Vec<RetrievedChunk>,
    pub suggestions: Vec<String>,
    pub turn_count: usize,
    pub phase: ConversationPhase,
}

/// Stateful multi-turn conversation engine over the node set
pub struct ConversationGraph {
    nodes: ConversationNodes,
    threads: Mutex<HashMap<String, Arc<Mutex<ConversationState>>>>,
    memory: MemoryConfig,
}

impl ConversationGraph {
    pub fn new(nodes: ConversationNodes, memory: MemoryConfig) -> Self {
        Self {
            nodes,
            threads: Mutex::new(HashMap::new()),
            memory,
        }
    }

    /// Start a new thread: initialize -> greet
    pub async fn start_conversation(&self) -> ConversationTurn {
        let state = self.nodes.initialize();
        let (state, response) = self.nodes.greet(state);

        let turn = ConversationTurn {
            thread_id: state.thread_id.clone(),
            response,
            sources: Vec::new(),
            suggestions: state.suggestions.clone(),
            turn_count: state.turn_count,
            phase: state.phase,
        };

        let mut threads = self.threads.lock().await;
        threads.insert(state.thread_id.clone(), Arc::new(Mutex::new(state)));
        info!("Started conversation {}", turn.thread_id);
        turn
    }

    /// Process one user message on an existing thread.
    ///
    /// Turns on the same thread are strictly sequential: the per-thread lock
    /// is held for the whole turn.
    pub async fn send_message(&self, thread_id: &str, text: &str) -> Result<ConversationTurn> {
        let thread = {
            let threads = self.threads.lock().await;
            threads
                .get(thread_id)
                .cloned()
                .ok_or_else(|| RagError::NotFound(format!("thread {}", thread_id)))?
        };

        let mut slot = thread.lock().await;
        let working = slot.clone();

        // wait_for_input -> understand
        let working = self.nodes.understand(working, text).await;

        let intent = working
            .analysis
            .as_ref()
            .map(|a| a.intent)
            .unwrap_or(Intent::Unknown);
        debug!("Turn intent: {:?}", intent);

        let (new_state, response) = match intent {
            Intent::Goodbye => {
                let (state, response) = self.nodes.end_conversation(working);
                (state, response)
            }
            Intent::Greeting | Intent::Help => self.nodes.respond(working).await,
            _ => {
                // understand -> search -> respond
                let working = self.nodes.search(working).await;
                self.nodes.respond(working).await
            }
        };

        let turn = ConversationTurn {
            thread_id: thread_id.to_string(),
            response,
            sources: new_state.search_results.clone(),
            suggestions: new_state.suggestions.clone(),
            turn_count: new_state.turn_count,
            phase: new_state.phase,
        };

        let ended = new_state.phase == ConversationPhase::Ending;
        *slot = new_state;
        drop(slot);

        if ended {
            let mut threads = self.threads.lock().await;
            threads.remove(thread_id);
            info!("Conversation {} ended", thread_id);
        }

        Ok(turn)
    }

    /// Drop threads idle beyond the configured timeout; returns the count
    pub async fn prune_idle_threads(&self) -> usize {
        let timeout = self.memory.conversation_timeout_hours;
        let mut threads = self.threads.lock().await;
        let before = threads.len();

        let mut keep = HashMap::new();
        for (id, thread) in threads.drain() {
            let idle = {
                let state = thread.lock().await;
                state.is_idle(timeout)
            };
            if idle {
                info!("Pruning idle conversation {}", id);
            } else {
                keep.insert(id, thread);
            }
        }
        *threads = keep;

        before - threads.len()
    }

    /// Number of live threads
    pub async fn active_threads(&self) -> usize {
        self.threads.lock().await.len()
    }

    /// Snapshot of a thread's state
    pub async fn thread_state(&self, thread_id: &str) -> Option<ConversationState> {
        let threads = self.threads.lock().await;
        match threads.get(thread_id) {
            Some(thread) => Some(thread.lock().await.clone()),
            None => None,
        }
    }
}
