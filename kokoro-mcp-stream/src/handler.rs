//! Request handling for the Kokoro streaming MCP server.
//!
//! This module provides the `SpeechHandler` struct and parameter types. The
//! handler owns the session registry and turns tool requests into session
//! operations, rendering chunks for the configured delivery mode.

use crate::engine::{HttpSpeechEngine, SpeechEngine, VoiceInfo};
use crate::registry::SessionRegistry;
use crate::session::{AudioChunk, SessionEvent, SessionId, SessionSnapshot, SessionState};
use crate::store::{AudioStore, FileAudioStore, store_from_config};
use crate::worker::{SynthesisPool, VoiceSelection};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use kokoro_mcp_common::config::{AudioDelivery, Config};
use kokoro_mcp_common::error::{EngineError, Error};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Default speed factor.
pub const DEFAULT_SPEED: f32 = 1.0;

/// Minimum speed factor.
pub const MIN_SPEED: f32 = 0.25;

/// Maximum speed factor.
pub const MAX_SPEED: f32 = 4.0;

/// Container format of every chunk.
pub const AUDIO_FORMAT: &str = "wav";

fn default_speed() -> f32 {
    DEFAULT_SPEED
}

/// Validation error details for request parameters.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field that failed validation.
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn validate_voice_and_speed(
    voice: Option<&str>,
    speed: f32,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(voice) = voice {
        if voice.trim().is_empty() {
            errors.push(ValidationError {
                field: "voice".to_string(),
                message: "Voice cannot be empty".to_string(),
            });
        }
    }

    if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
        errors.push(ValidationError {
            field: "speed".to_string(),
            message: format!(
                "speed must be between {} and {}, got {}",
                MIN_SPEED, MAX_SPEED, speed
            ),
        });
    }
}

fn parse_session_id(session_id: &str) -> Result<SessionId, Error> {
    Ok(session_id.parse::<SessionId>()?)
}

fn into_validation_error(errors: Vec<ValidationError>) -> Error {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    Error::validation(messages.join("; "))
}

/// One-shot speech generation parameters.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct GenerateSpeechParams {
    /// Text to synthesize into speech.
    pub text: String,

    /// Voice id (e.g. "af_heart"). Defaults to the configured voice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Speed factor (0.25-4.0, default 1.0).
    #[serde(default = "default_speed")]
    pub speed: f32,
}

impl GenerateSpeechParams {
    /// Validate the parameters.
    ///
    /// # Returns
    /// - `Ok(())` if all parameters are valid
    /// - `Err(Vec<ValidationError>)` with all validation errors
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.text.trim().is_empty() {
            errors.push(ValidationError {
                field: "text".to_string(),
                message: "Text cannot be empty".to_string(),
            });
        }
        validate_voice_and_speed(self.voice.as_deref(), self.speed, &mut errors);

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Parameters for opening a streaming session.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StreamStartParams {
    /// Voice id. Defaults to the configured voice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Speed factor (0.25-4.0, default 1.0).
    #[serde(default = "default_speed")]
    pub speed: f32,
}

impl StreamStartParams {
    /// Validate the parameters.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        validate_voice_and_speed(self.voice.as_deref(), self.speed, &mut errors);
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// One synthesized chunk as returned to MCP clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkOutput {
    /// Position in the session
    pub sequence_index: u64,
    /// Source text
    pub text: String,
    /// HTTP URL (file delivery) or `data:` URI (memory delivery)
    pub audio_uri: String,
    /// Audio container format
    pub format: &'static str,
    /// Whether this is the last chunk
    pub is_final: bool,
}

/// Result of a one-shot generation.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedSpeech {
    pub session_id: SessionId,
    pub voice: String,
    pub chunks: Vec<ChunkOutput>,
}

/// Session state as returned by `stream_poll`.
#[derive(Debug, Clone, Serialize)]
pub struct PolledSession {
    pub session_id: SessionId,
    pub state: SessionState,
    pub voice: VoiceSelection,
    pub transcript: String,
    pub chunk_count: usize,
    pub chunks: Vec<ChunkOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handles MCP tool requests against the session registry.
pub struct SpeechHandler {
    /// Application configuration.
    pub config: Config,
    registry: Arc<SessionRegistry>,
    files: FileAudioStore,
}

impl SpeechHandler {
    /// Create a handler talking to the Kokoro service named in `config`.
    #[instrument(level = "debug", name = "speech_handler_new", skip_all)]
    pub fn new(config: Config) -> Self {
        debug!(engine_url = %config.engine_url, "Initializing SpeechHandler");
        let engine = Arc::new(HttpSpeechEngine::new(config.engine_url.clone()));
        let store = store_from_config(&config);
        Self::with_engine(config, engine, store)
    }

    /// Create a handler with provided dependencies.
    pub fn with_engine(
        config: Config,
        engine: Arc<dyn SpeechEngine>,
        store: Arc<dyn AudioStore>,
    ) -> Self {
        let pool = SynthesisPool::from_config(engine, store, &config);
        let files = FileAudioStore::new(config.temp_audio_dir.clone(), config.audio_base_url());
        Self {
            registry: Arc::new(SessionRegistry::new(pool)),
            files,
            config,
        }
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// List the voices offered by the engine.
    #[instrument(level = "info", name = "list_voices", skip(self))]
    pub async fn list_voices(&self) -> Result<Vec<VoiceInfo>, Error> {
        let voices = self.registry.pool().engine().list_voices().await?;
        info!(count = voices.len(), "Listed voices");
        Ok(voices)
    }

    /// Synthesize `params.text` in one go and return every chunk.
    #[instrument(level = "info", name = "generate_speech", skip(self, params), fields(text_len = params.text.len()))]
    pub async fn generate(&self, params: GenerateSpeechParams) -> Result<GeneratedSpeech, Error> {
        params.validate().map_err(into_validation_error)?;
        let voice = self.select_voice(params.voice.as_deref(), params.speed).await?;
        info!(voice = %voice.voice_id, "Generating speech");

        let (id, mut events) = self.registry.create(voice.clone()).await;
        let session = self.registry.get(&id).await?;
        session.push_text(&params.text).await?;
        session.close_input().await?;

        let mut error = None;
        while let Some(event) = events.recv().await {
            if let SessionEvent::Finished(finished) = event {
                error = finished.error;
                break;
            }
        }

        if let Some(error) = error {
            self.registry.remove(&id).await?;
            return Err(error.into());
        }

        let snapshot = session.snapshot(0).await;
        let chunks = self.render_chunks(&snapshot.chunks).await?;
        if self.registry.pool().store().delivery() == AudioDelivery::Memory {
            // Payloads are inlined, nothing left to fetch.
            self.registry.remove(&id).await?;
        }

        info!(session_id = %id, chunks = chunks.len(), "Speech generated");
        Ok(GeneratedSpeech {
            session_id: id,
            voice: voice.voice_id,
            chunks,
        })
    }

    /// Open a streaming session.
    #[instrument(level = "info", name = "stream_start", skip(self, params))]
    pub async fn stream_start(&self, params: StreamStartParams) -> Result<SessionId, Error> {
        params.validate().map_err(into_validation_error)?;
        let voice = self.select_voice(params.voice.as_deref(), params.speed).await?;
        let (id, _events) = self.registry.create(voice).await;
        Ok(id)
    }

    /// Push text into a session. Returns the number of committed segments.
    pub async fn stream_push(&self, session_id: &str, text: &str) -> Result<usize, Error> {
        let session = self.registry.get(&parse_session_id(session_id)?).await?;
        Ok(session.push_text(text).await?)
    }

    /// Close a session's input.
    pub async fn stream_close(&self, session_id: &str) -> Result<usize, Error> {
        let session = self.registry.get(&parse_session_id(session_id)?).await?;
        Ok(session.close_input().await?)
    }

    /// Cancel a session. Returns `false` if it had already finished.
    pub async fn stream_cancel(&self, session_id: &str) -> Result<bool, Error> {
        Ok(self.registry.cancel(&parse_session_id(session_id)?).await?)
    }

    /// State and chunks with index at or after `after`.
    pub async fn stream_poll(&self, session_id: &str, after: u64) -> Result<PolledSession, Error> {
        let session = self.registry.get(&parse_session_id(session_id)?).await?;
        let SessionSnapshot {
            session_id,
            state,
            voice,
            transcript,
            chunks,
            chunk_count,
            error,
        } = session.snapshot(after).await;
        Ok(PolledSession {
            session_id,
            state,
            voice,
            transcript,
            chunk_count,
            chunks: self.render_chunks(&chunks).await?,
            error,
        })
    }

    /// Remove a session and release its payloads.
    pub async fn stream_remove(&self, session_id: &str) -> Result<(), Error> {
        Ok(self.registry.remove(&parse_session_id(session_id)?).await?)
    }

    /// Delete a generated audio file by its URL. Returns whether it existed.
    #[instrument(level = "info", name = "cleanup_audio", skip(self))]
    pub async fn cleanup_audio(&self, uri: &str) -> Result<bool, Error> {
        Ok(self.files.cleanup(uri).await?)
    }

    async fn select_voice(&self, voice: Option<&str>, speed: f32) -> Result<VoiceSelection, Error> {
        let voice_id = voice.map(str::trim).unwrap_or(&self.config.default_voice);

        match self.registry.pool().engine().list_voices().await {
            Ok(voices) if !voices.is_empty() && !voices.iter().any(|v| v.id == voice_id) => {
                return Err(EngineError::InvalidVoice(voice_id.to_string()).into());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not list voices, leaving voice check to the engine"),
        }

        Ok(VoiceSelection::new(voice_id, speed))
    }

    async fn render_chunks(&self, chunks: &[AudioChunk]) -> Result<Vec<ChunkOutput>, Error> {
        let store = self.registry.pool().store();
        let mut rendered = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let audio_uri = match store.delivery() {
                AudioDelivery::File => chunk.audio.to_string(),
                AudioDelivery::Memory => {
                    let audio = store.resolve(&chunk.audio).await?;
                    format!("data:{};base64,{}", audio.mime_type, BASE64.encode(&audio.data))
                }
            };
            rendered.push(ChunkOutput {
                sequence_index: chunk.sequence_index,
                text: chunk.text.clone(),
                audio_uri,
                format: AUDIO_FORMAT,
                is_final: chunk.is_final,
            });
        }
        Ok(rendered)
    }
}
