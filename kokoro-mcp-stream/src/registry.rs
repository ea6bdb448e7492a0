//! Process-wide table of streaming sessions.

use crate::session::{EventReceiver, SessionId, StreamSession};
use crate::worker::{SynthesisPool, VoiceSelection};
use kokoro_mcp_common::error::SessionError;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns every live and recently finished session.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<StreamSession>>>,
    pool: SynthesisPool,
}

impl SessionRegistry {
    /// Create an empty registry whose sessions synthesize through `pool`.
    pub fn new(pool: SynthesisPool) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pool,
        }
    }

    /// The shared synthesis pool.
    pub fn pool(&self) -> &SynthesisPool {
        &self.pool
    }

    /// Create an `Idle` session and start its pipeline.
    pub async fn create(&self, voice: VoiceSelection) -> (SessionId, EventReceiver) {
        let id = SessionId::new();
        let worker = self.pool.worker(id, voice.clone());
        let (session, events) = StreamSession::start(id, worker, voice);
        self.sessions.write().await.insert(id, session);
        info!(session_id = %id, "Session created");
        (id, events)
    }

    /// Look up a session.
    ///
    /// # Errors
    /// `SessionError::NotFound` if no session has this id.
    pub async fn get(&self, id: &SessionId) -> Result<Arc<StreamSession>, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::not_found(id.to_string()))
    }

    /// Cancel a session. Returns `false` if it was already terminal.
    ///
    /// # Errors
    /// `SessionError::NotFound` if no session has this id.
    pub async fn cancel(&self, id: &SessionId) -> Result<bool, SessionError> {
        let session = self.get(id).await?;
        Ok(session.cancel().await)
    }

    /// Remove a session, cancelling it first if it is still running, and
    /// release its stored payloads.
    ///
    /// # Errors
    /// `SessionError::NotFound` if no session has this id.
    pub async fn remove(&self, id: &SessionId) -> Result<(), SessionError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::not_found(id.to_string()))?;
        session.cancel().await;
        session.pipeline_stopped().await;
        self.release_payloads(id).await;
        info!(session_id = %id, "Session removed");
        Ok(())
    }

    /// Remove terminal sessions that finished more than `retention` ago.
    ///
    /// Returns the number of sessions removed.
    pub async fn sweep(&self, retention: Duration) -> usize {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for session in sessions {
            if let Some(finished_at) = session.finished_at().await {
                if finished_at.elapsed() >= retention {
                    expired.push(session);
                }
            }
        }

        if expired.is_empty() {
            return 0;
        }

        {
            let mut table = self.sessions.write().await;
            for session in &expired {
                table.remove(&session.id());
            }
        }
        for session in &expired {
            session.pipeline_stopped().await;
            self.release_payloads(&session.id()).await;
        }
        debug!(count = expired.len(), "Swept finished sessions");
        expired.len()
    }

    /// Run `sweep(retention)` every `interval` until the registry is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
    ) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.sweep(retention).await;
            }
        })
    }

    /// Cancel every live session. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut cancelled = 0;
        for session in sessions {
            if session.cancel().await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(count = cancelled, "Cancelled live sessions");
        }
        cancelled
    }

    /// Number of sessions held.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn release_payloads(&self, id: &SessionId) {
        match self.pool.store().release_session(&id.to_string()).await {
            Ok(0) => {}
            Ok(count) => debug!(session_id = %id, count, "Released audio payloads"),
            Err(e) => warn!(session_id = %id, error = %e, "Failed to release audio payloads"),
        }
    }
}
