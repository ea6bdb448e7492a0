//! Per-session synthesis worker.
//!
//! A [`SynthesisWorker`] turns committed segments into audio chunks one at a
//! time. All workers created from the same [`SynthesisPool`] share one engine,
//! one payload store and one semaphore, so the number of syntheses in flight
//! across the whole process is bounded.

use crate::engine::{RawAudio, SpeechEngine};
use crate::segmenter::Segment;
use crate::session::{AudioChunk, SessionId};
use crate::store::AudioStore;
use kokoro_mcp_common::config::Config;
use kokoro_mcp_common::error::{EngineError, SessionError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

/// Voice and speed used for every segment of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSelection {
    /// Engine voice id
    pub voice_id: String,
    /// Speed factor
    pub speed: f32,
}

impl VoiceSelection {
    /// Select a voice at the given speed.
    pub fn new(voice_id: impl Into<String>, speed: f32) -> Self {
        Self {
            voice_id: voice_id.into(),
            speed,
        }
    }
}

/// Engine, store and concurrency limit shared by all sessions.
#[derive(Clone)]
pub struct SynthesisPool {
    engine: Arc<dyn SpeechEngine>,
    store: Arc<dyn AudioStore>,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl SynthesisPool {
    /// Create a pool allowing `max_concurrent` simultaneous syntheses.
    ///
    /// A limit of 0 is treated as 1.
    pub fn new(
        engine: Arc<dyn SpeechEngine>,
        store: Arc<dyn AudioStore>,
        max_concurrent: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            engine,
            store,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    /// Create a pool using the limits from `config`.
    pub fn from_config(
        engine: Arc<dyn SpeechEngine>,
        store: Arc<dyn AudioStore>,
        config: &Config,
    ) -> Self {
        Self::new(
            engine,
            store,
            config.max_concurrent_syntheses,
            config.synthesis_timeout,
        )
    }

    /// The shared engine.
    pub fn engine(&self) -> &Arc<dyn SpeechEngine> {
        &self.engine
    }

    /// The shared payload store.
    pub fn store(&self) -> &Arc<dyn AudioStore> {
        &self.store
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Create the worker for one session.
    pub fn worker(&self, session_id: SessionId, voice: VoiceSelection) -> SynthesisWorker {
        SynthesisWorker {
            pool: self.clone(),
            session_id,
            voice,
            next_index: 0,
        }
    }
}

impl std::fmt::Debug for SynthesisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisPool")
            .field("available_permits", &self.permits.available_permits())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Synthesizes the segments of a single session, in order.
#[derive(Debug)]
pub struct SynthesisWorker {
    pool: SynthesisPool,
    session_id: SessionId,
    voice: VoiceSelection,
    next_index: u64,
}

impl SynthesisWorker {
    /// Index the next successful chunk will carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Synthesize `segment` and store its audio.
    ///
    /// The returned chunk is never final; the session decides that. The index
    /// only advances on success, so indices stay gapless.
    ///
    /// # Errors
    /// `SessionError::Synthesis` if the engine fails, times out, or the payload
    /// cannot be stored.
    pub async fn synthesize(&mut self, segment: Segment) -> Result<AudioChunk, SessionError> {
        let text = segment.into_text();
        let audio = self.render(&text).await?;
        self.store(text, audio).await
    }

    /// Run the engine on `text` under a pool permit and the call timeout.
    ///
    /// Dropping the future abandons the call and frees the permit.
    ///
    /// # Errors
    /// `SessionError::Synthesis` if the engine fails or times out.
    #[instrument(
        level = "debug",
        name = "synthesize_segment",
        skip(self, text),
        fields(session_id = %self.session_id, index = self.next_index)
    )]
    pub async fn render(&self, text: &str) -> Result<RawAudio, SessionError> {
        let _permit = self
            .pool
            .permits
            .acquire()
            .await
            .map_err(|e| SessionError::synthesis(text, e))?;

        let call = self
            .pool
            .engine
            .synthesize_raw(text, &self.voice.voice_id, self.voice.speed);
        match self.pool.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| SessionError::synthesis(text, EngineError::Timeout(limit)))?,
            None => call.await,
        }
        .map_err(|e| SessionError::synthesis(text, e))
    }

    /// Store `audio` as the next chunk of the session.
    ///
    /// Callers drive this to completion, so a `release_session` issued after
    /// the pipeline stops always sees the payload.
    ///
    /// # Errors
    /// `SessionError::Synthesis` if the payload cannot be stored.
    pub async fn store(&mut self, text: String, audio: RawAudio) -> Result<AudioChunk, SessionError> {
        let audio_ref = self
            .pool
            .store
            .put(&self.session_id.to_string(), self.next_index, audio)
            .await
            .map_err(|e| SessionError::synthesis(&text, e))?;

        let chunk = AudioChunk {
            sequence_index: self.next_index,
            text,
            audio: audio_ref,
            is_final: false,
        };
        self.next_index += 1;
        debug!(session_id = %self.session_id, audio = %chunk.audio, "Segment synthesized");
        Ok(chunk)
    }
}
