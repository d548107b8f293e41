//! In-memory outbox store for tests and local runs.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use walbox_core::OutboxMessage;

use crate::error::{PgError, PgResult};
use crate::store::{OutboxStore, ReconcileWindow};

#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<i64, OutboxMessage>,
    mark_sent_calls: Vec<i64>,
    heartbeats: usize,
    failing: bool,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row.
    pub fn insert(&self, message: OutboxMessage) {
        let mut state = self.state.lock().unwrap();
        state.rows.insert(message.id, message);
    }

    pub fn is_sent(&self, id: i64) -> bool {
        let state = self.state.lock().unwrap();
        state.rows.get(&id).map(|m| m.sent).unwrap_or(false)
    }

    /// Ids passed to `mark_sent`, in call order.
    pub fn mark_sent_calls(&self) -> Vec<i64> {
        self.state.lock().unwrap().mark_sent_calls.clone()
    }

    pub fn heartbeats(&self) -> usize {
        self.state.lock().unwrap().heartbeats
    }

    /// Make every operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }
}

fn check(state: &MemoryState) -> PgResult<()> {
    if state.failing {
        return Err(PgError::Connection("memory store is failing".to_string()));
    }
    Ok(())
}

impl OutboxStore for MemoryOutboxStore {
    fn mark_sent(&self, id: i64) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = state.lock().unwrap();
            check(&state)?;
            state.mark_sent_calls.push(id);
            if let Some(row) = state.rows.get_mut(&id) {
                row.sent = true;
            }
            Ok(())
        }
    }

    fn fetch_unsent(
        &self,
        window: ReconcileWindow,
    ) -> impl Future<Output = PgResult<Vec<OutboxMessage>>> + Send {
        let state = self.state.clone();
        async move {
            let state = state.lock().unwrap();
            check(&state)?;
            let now = Utc::now();
            Ok(state
                .rows
                .values()
                .filter(|m| !m.sent)
                .filter(|m| m.created_at.is_some_and(|at| window.contains(at, now)))
                .cloned()
                .collect())
        }
    }

    fn heartbeat(&self) -> impl Future<Output = PgResult<()>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = state.lock().unwrap();
            check(&state)?;
            state.heartbeats += 1;
            Ok(())
        }
    }
}
