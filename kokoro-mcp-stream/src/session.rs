//! Streaming session: state machine and synthesis pipeline.
//!
//! A [`StreamSession`] owns a [`TextSegmenter`] and a background pipeline task
//! driving a [`SynthesisWorker`]. Text pushed by the caller is segmented under
//! the session lock and committed segments are queued to the pipeline, which
//! synthesizes them one at a time and emits [`SessionEvent`]s in order.
//!
//! Each chunk is emitted as soon as its payload is stored. It is final when
//! input is closed and no committed segment is left to synthesize. State
//! transitions and event emission happen under the same lock, so once a
//! session is terminal no further chunk can be emitted, even if a synthesis
//! that was in flight resolves afterwards.

use crate::segmenter::{Segment, TextSegmenter};
use crate::store::AudioRef;
use crate::worker::{SynthesisWorker, VoiceSelection};
use kokoro_mcp_common::error::SessionError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, no text yet
    Idle,
    /// Receiving text
    Active,
    /// Input closed, pending segments still being synthesized
    Draining,
    /// Every segment was synthesized
    Completed,
    /// Stopped by the caller
    Cancelled,
    /// Stopped by a synthesis failure
    Failed,
}

impl SessionState {
    /// Whether the session has finished for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    /// Ids that are not UUIDs cannot name a session, so they parse to
    /// `NotFound`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| SessionError::not_found(s))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

/// Audio output for one committed segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioChunk {
    /// Position in the session, starting at 0
    pub sequence_index: u64,
    /// Source segment text
    pub text: String,
    /// Where the payload can be fetched
    pub audio: AudioRef,
    /// Whether this is the last chunk of a completed session
    pub is_final: bool,
}

/// A chunk delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkEvent {
    pub session_id: SessionId,
    pub sequence_index: u64,
    pub text: String,
    pub audio_ref: AudioRef,
    pub is_final: bool,
}

/// The last event of every session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedEvent {
    pub session_id: SessionId,
    /// Terminal state reached
    pub outcome: SessionState,
    /// Failure that ended the session, for `Failed`
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_error")]
    pub error: Option<SessionError>,
    /// Index of the last emitted chunk, if any
    pub last_sequence_index: Option<u64>,
}

fn serialize_error<S: Serializer>(
    error: &Option<SessionError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.collect_str(e),
        None => serializer.serialize_none(),
    }
}

/// Events emitted by a session, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Chunk(ChunkEvent),
    Finished(FinishedEvent),
}

/// Receiving end of a session's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub voice: VoiceSelection,
    /// Concatenated text of every emitted chunk
    pub transcript: String,
    /// Emitted chunks with index at or after the requested one
    pub chunks: Vec<AudioChunk>,
    /// Total number of emitted chunks
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct SessionInner {
    state: SessionState,
    segmenter: TextSegmenter,
    /// Dropped on close so the pipeline sees the end of input.
    segments_tx: Option<mpsc::UnboundedSender<Segment>>,
    /// Committed segments not yet delivered.
    pending: usize,
    transcript: String,
    chunks: Vec<AudioChunk>,
    error: Option<SessionError>,
    finished_at: Option<Instant>,
    /// Dropped after the terminal event, closing the stream.
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

/// One streaming synthesis request.
pub struct StreamSession {
    id: SessionId,
    voice: VoiceSelection,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    pipeline_done: watch::Sender<bool>,
}

/// Marks the pipeline as stopped when dropped, however it exits.
struct PipelineExit<'a>(&'a watch::Sender<bool>);

impl Drop for PipelineExit<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("voice", &self.voice)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Create an `Idle` session and spawn its pipeline on the current runtime.
    pub fn start(
        id: SessionId,
        worker: SynthesisWorker,
        voice: VoiceSelection,
    ) -> (Arc<Self>, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (segments_tx, segments_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (pipeline_done, _) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            voice,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                segmenter: TextSegmenter::new(),
                segments_tx: Some(segments_tx),
                pending: 0,
                transcript: String::new(),
                chunks: Vec::new(),
                error: None,
                finished_at: None,
                events: Some(events_tx),
            }),
            state_tx,
            pipeline_done,
        });

        tokio::spawn(Arc::clone(&session).run_pipeline(worker, segments_rx));
        (session, events_rx)
    }

    /// The session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Voice used for every segment.
    pub fn voice(&self) -> &VoiceSelection {
        &self.voice
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// When the session reached its terminal state.
    pub async fn finished_at(&self) -> Option<Instant> {
        self.inner.lock().await.finished_at
    }

    /// Append text, queueing every segment it completes.
    ///
    /// Returns the number of segments committed by this call.
    ///
    /// # Errors
    /// `SessionError::InvalidState` unless the session is `Idle` or `Active`.
    pub async fn push_text(&self, text: &str) -> Result<usize, SessionError> {
        let mut inner = self.inner.lock().await;
        let state = inner.state;
        match state {
            SessionState::Idle => self.set_state(&mut inner, SessionState::Active),
            SessionState::Active => {}
            state => return Err(SessionError::invalid_state("push text", state)),
        }

        let SessionInner {
            segmenter,
            segments_tx,
            pending,
            ..
        } = &mut *inner;
        let Some(tx) = segments_tx.as_ref() else {
            return Err(SessionError::invalid_state("push text", "closed"));
        };

        let mut committed = 0;
        for segment in segmenter.push(text)? {
            if tx.send(segment).is_err() {
                break;
            }
            committed += 1;
        }
        *pending += committed;
        debug!(session_id = %self.id, committed, "Text pushed");
        Ok(committed)
    }

    /// Close the input and flush the unterminated tail.
    ///
    /// The session moves to `Draining` and completes once every queued segment
    /// has been synthesized. Closing an `Idle` session completes it with no
    /// chunks.
    ///
    /// # Errors
    /// `SessionError::InvalidState` unless the session is `Idle` or `Active`.
    pub async fn close_input(&self) -> Result<usize, SessionError> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, SessionState::Idle | SessionState::Active) {
            return Err(SessionError::invalid_state("close input", inner.state));
        }
        self.set_state(&mut inner, SessionState::Draining);

        let SessionInner {
            segmenter,
            segments_tx,
            pending,
            ..
        } = &mut *inner;
        let mut committed = 0;
        if let Some(tx) = segments_tx.take() {
            for segment in segmenter.close()? {
                if tx.send(segment).is_err() {
                    break;
                }
                committed += 1;
            }
        }
        *pending += committed;
        info!(session_id = %self.id, committed, "Input closed");
        Ok(committed)
    }

    /// Cancel the session.
    ///
    /// Returns `false` without changing anything if the session is already
    /// terminal.
    pub async fn cancel(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return false;
        }
        inner.segments_tx = None;
        self.finish(&mut inner, SessionState::Cancelled, None);
        info!(session_id = %self.id, chunks = inner.chunks.len(), "Session cancelled");
        true
    }

    /// Snapshot of the session, including chunks with index `>= after`.
    pub async fn snapshot(&self, after: u64) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            session_id: self.id,
            state: inner.state,
            voice: self.voice.clone(),
            transcript: inner.transcript.clone(),
            chunks: inner
                .chunks
                .iter()
                .filter(|c| c.sequence_index >= after)
                .cloned()
                .collect(),
            chunk_count: inner.chunks.len(),
            error: inner.error.as_ref().map(ToString::to_string),
        }
    }

    /// Wait until the pipeline task has stopped.
    ///
    /// The pipeline only stops once the session is terminal, and never in the
    /// middle of a payload write, so the session's stored payloads are final
    /// when this returns.
    pub async fn pipeline_stopped(&self) {
        let mut rx = self.pipeline_done.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Wait until the session reaches a terminal state and return it.
    pub async fn wait_until_terminal(&self) -> SessionState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Record a chunk and emit it, unless the session is already terminal.
    fn emit(&self, inner: &mut SessionInner, mut chunk: AudioChunk, is_final: bool) -> bool {
        if inner.state.is_terminal() {
            return false;
        }
        chunk.is_final = is_final;
        inner.transcript.push_str(&chunk.text);
        if let Some(events) = &inner.events {
            let _ = events.send(SessionEvent::Chunk(ChunkEvent {
                session_id: self.id,
                sequence_index: chunk.sequence_index,
                text: chunk.text.clone(),
                audio_ref: chunk.audio.clone(),
                is_final,
            }));
        }
        debug!(session_id = %self.id, index = chunk.sequence_index, is_final, "Chunk emitted");
        inner.chunks.push(chunk);
        true
    }

    fn finish(&self, inner: &mut SessionInner, outcome: SessionState, error: Option<SessionError>) {
        inner.finished_at = Some(Instant::now());
        inner.error = error.clone();
        if let Some(events) = inner.events.take() {
            let _ = events.send(SessionEvent::Finished(FinishedEvent {
                session_id: self.id,
                outcome,
                error,
                last_sequence_index: inner.chunks.last().map(|c| c.sequence_index),
            }));
        }
        self.set_state(inner, outcome);
    }

    /// Emit a stored chunk, final if input is closed and nothing is pending.
    async fn deliver(&self, chunk: AudioChunk) -> bool {
        let mut inner = self.inner.lock().await;
        inner.pending = inner.pending.saturating_sub(1);
        let is_final = inner.segments_tx.is_none() && inner.pending == 0;
        self.emit(&mut inner, chunk, is_final)
    }

    async fn complete(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return;
        }
        self.finish(&mut inner, SessionState::Completed, None);
        info!(session_id = %self.id, chunks = inner.chunks.len(), "Session completed");
    }

    async fn fail(&self, error: SessionError) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return;
        }
        inner.segments_tx = None;
        warn!(session_id = %self.id, error = %error, "Session failed");
        self.finish(&mut inner, SessionState::Failed, Some(error));
    }

    /// Single consumer loop: synthesize queued segments in commit order.
    ///
    /// Only the engine call is abandoned when the session turns terminal. A
    /// payload write that has started always finishes before the loop exits.
    async fn run_pipeline(
        self: Arc<Self>,
        mut worker: SynthesisWorker,
        mut segments: mpsc::UnboundedReceiver<Segment>,
    ) {
        let _exit = PipelineExit(&self.pipeline_done);
        let mut state_rx = self.state_tx.subscribe();

        loop {
            let next = tokio::select! {
                biased;
                _ = state_rx.wait_for(|s| s.is_terminal()) => return,
                next = segments.recv() => next,
            };

            let Some(segment) = next else {
                self.complete().await;
                return;
            };

            let text = segment.into_text();
            let rendered = tokio::select! {
                biased;
                _ = state_rx.wait_for(|s| s.is_terminal()) => {
                    debug!(session_id = %self.id, "Abandoning in-flight synthesis");
                    return;
                }
                rendered = worker.render(&text) => rendered,
            };

            let stored = match rendered {
                Ok(audio) => worker.store(text, audio).await,
                Err(error) => Err(error),
            };

            match stored {
                Ok(chunk) => {
                    if !self.deliver(chunk).await {
                        return;
                    }
                }
                Err(error) => {
                    self.fail(error).await;
                    return;
                }
            }
        }
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::engine::{RawAudio, SpeechEngine, VoiceInfo};
    use crate::store::MemoryAudioStore;
    use crate::worker::SynthesisPool;
    use async_trait::async_trait;
    use kokoro_mcp_common::error::EngineError;
    use proptest::prelude::*;

    struct EchoEngine;

    #[async_trait]
    impl SpeechEngine for EchoEngine {
        async fn synthesize_raw(
            &self,
            text: &str,
            _voice_id: &str,
            _speed: f32,
        ) -> Result<RawAudio, EngineError> {
            Ok(RawAudio::wav(text.as_bytes().to_vec()))
        }

        async fn list_voices(&self) -> Result<Vec<VoiceInfo>, EngineError> {
            Ok(vec![])
        }
    }

    fn run_session(increments: Vec<String>) -> (Vec<ChunkEvent>, String) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let pool = SynthesisPool::new(
                Arc::new(EchoEngine),
                Arc::new(MemoryAudioStore::new()),
                1,
                None,
            );
            let id = SessionId::new();
            let voice = VoiceSelection::new("af_heart", 1.0);
            let (session, mut events) =
                StreamSession::start(id, pool.worker(id, voice.clone()), voice);
            for inc in &increments {
                session.push_text(inc).await.unwrap();
            }
            session.close_input().await.unwrap();

            let mut chunks = Vec::new();
            while let Some(event) = events.recv().await {
                if let SessionEvent::Chunk(c) = event {
                    chunks.push(c);
                }
            }
            (chunks, session.snapshot(0).await.transcript)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Indices are exactly 0..n, only the last chunk is final, and the
        /// transcript reconstructs the pushed text.
        #[test]
        fn chunks_are_gapless_and_lossless(
            increments in prop::collection::vec("[a-z ]{0,12}", 0..8),
        ) {
            let pushed = increments.concat();
            let (chunks, transcript) = run_session(increments);

            let indices: Vec<u64> = chunks.iter().map(|c| c.sequence_index).collect();
            let expected: Vec<u64> = (0..chunks.len() as u64).collect();
            prop_assert_eq!(indices, expected);

            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.is_final, i + 1 == chunks.len());
            }

            let texts: String = chunks.iter().map(|c| c.text.as_str()).collect();
            prop_assert_eq!(&texts, &transcript);
            if pushed.trim().is_empty() {
                prop_assert!(chunks.is_empty());
            } else {
                prop_assert_eq!(transcript, pushed);
            }
        }
    }
}
