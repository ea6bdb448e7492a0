//! Speech engine capability.
//!
//! The streaming core never talks to a model directly. It calls a
//! [`SpeechEngine`], which is injected as `Arc<dyn SpeechEngine>` so tests can
//! substitute a scripted engine. [`HttpSpeechEngine`] talks to a Kokoro
//! service exposing the OpenAI-compatible `/v1/audio/*` endpoints.

use async_trait::async_trait;
use kokoro_mcp_common::error::EngineError;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// MIME type assumed when the engine does not say otherwise.
pub const DEFAULT_MIME_TYPE: &str = "audio/wav";

/// Model name sent to the Kokoro service.
pub const KOKORO_MODEL: &str = "kokoro";

/// Raw audio returned by the engine for one piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAudio {
    /// Encoded audio bytes
    pub data: Vec<u8>,
    /// MIME type of `data`
    pub mime_type: String,
}

impl RawAudio {
    /// WAV audio.
    pub fn wav(data: Vec<u8>) -> Self {
        Self {
            data,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
        }
    }
}

/// A voice offered by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceInfo {
    /// Voice identifier passed back to `synthesize_raw`
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Language tag, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// "female" or "male", when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

impl VoiceInfo {
    /// Derive voice metadata from a Kokoro voice id such as `af_heart`.
    ///
    /// The first letter encodes the language, the second the gender, and the
    /// part after the underscore is the voice name.
    pub fn from_kokoro_id(id: &str) -> Self {
        let mut prefix = id.chars();
        let language = prefix.next().and_then(language_for_code).map(str::to_string);
        let gender = match prefix.next() {
            Some('f') => Some("female".to_string()),
            Some('m') => Some("male".to_string()),
            _ => None,
        };

        let name = id.split_once('_').map(|(_, name)| name).unwrap_or(id);
        let display_name = name
            .split('_')
            .filter(|part| !part.is_empty())
            .map(capitalize)
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            id: id.to_string(),
            display_name: if display_name.is_empty() {
                id.to_string()
            } else {
                display_name
            },
            language,
            gender,
        }
    }
}

fn language_for_code(code: char) -> Option<&'static str> {
    match code {
        'a' => Some("en-US"),
        'b' => Some("en-GB"),
        'e' => Some("es"),
        'f' => Some("fr-FR"),
        'h' => Some("hi"),
        'i' => Some("it"),
        'j' => Some("ja"),
        'p' => Some("pt-BR"),
        'z' => Some("zh"),
        _ => None,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// External text-to-speech capability.
///
/// Implementations need not be safe to call concurrently; callers serialize
/// access (see `SynthesisWorker`).
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Synthesize `text` with the given voice and speed factor.
    async fn synthesize_raw(
        &self,
        text: &str,
        voice_id: &str,
        speed: f32,
    ) -> Result<RawAudio, EngineError>;

    /// List the voices the engine offers, in engine order.
    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, EngineError>;
}

// =============================================================================
// HTTP engine
// =============================================================================

/// Request body for `POST /v1/audio/speech`.
#[derive(Debug, Serialize)]
pub struct SpeechRequest<'a> {
    /// Model name
    pub model: &'a str,
    /// Text to speak
    pub input: &'a str,
    /// Voice id
    pub voice: &'a str,
    /// Output container
    pub response_format: &'a str,
    /// Speed factor
    pub speed: f32,
}

/// Response body for `GET /v1/audio/voices`.
#[derive(Debug, Deserialize)]
pub struct VoicesResponse {
    /// Voice ids
    pub voices: Vec<String>,
}

/// Engine backed by a Kokoro HTTP service.
#[derive(Debug, Clone)]
pub struct HttpSpeechEngine {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSpeechEngine {
    /// Create an engine for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Create an engine that reuses an existing HTTP client.
    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    /// Speech synthesis endpoint.
    pub fn speech_endpoint(&self) -> String {
        format!("{}/v1/audio/speech", self.base_url)
    }

    /// Voice listing endpoint.
    pub fn voices_endpoint(&self) -> String {
        format!("{}/v1/audio/voices", self.base_url)
    }
}

#[async_trait]
impl SpeechEngine for HttpSpeechEngine {
    #[instrument(level = "debug", name = "engine_synthesize", skip(self, text), fields(text_len = text.len()))]
    async fn synthesize_raw(
        &self,
        text: &str,
        voice_id: &str,
        speed: f32,
    ) -> Result<RawAudio, EngineError> {
        let endpoint = self.speech_endpoint();
        let request = SpeechRequest {
            model: KOKORO_MODEL,
            input: text,
            voice: voice_id,
            response_format: "wav",
            speed,
        };

        let response = self
            .http
            .post(&endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::api(&endpoint, 0, format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 && body.to_lowercase().contains("voice") {
                return Err(EngineError::InvalidVoice(voice_id.to_string()));
            }
            return Err(EngineError::api(&endpoint, status.as_u16(), body));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("audio/"))
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();

        let data = response
            .bytes()
            .await
            .map_err(|e| {
                EngineError::api(
                    &endpoint,
                    status.as_u16(),
                    format!("Failed to read audio body: {}", e),
                )
            })?
            .to_vec();

        if data.is_empty() {
            return Err(EngineError::EmptyAudio);
        }

        debug!(bytes = data.len(), mime_type = %mime_type, "Received audio from engine");
        Ok(RawAudio { data, mime_type })
    }

    #[instrument(level = "debug", name = "engine_list_voices", skip(self))]
    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, EngineError> {
        let endpoint = self.voices_endpoint();

        let response = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| EngineError::api(&endpoint, 0, format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::api(&endpoint, status.as_u16(), body));
        }

        let parsed: VoicesResponse = response.json().await.map_err(|e| {
            EngineError::api(
                &endpoint,
                status.as_u16(),
                format!("Failed to parse response: {}", e),
            )
        })?;

        Ok(parsed
            .voices
            .iter()
            .map(|id| VoiceInfo::from_kokoro_id(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_voice_info_from_kokoro_id() {
        let voice = VoiceInfo::from_kokoro_id("af_heart");
        assert_eq!(voice.id, "af_heart");
        assert_eq!(voice.display_name, "Heart");
        assert_eq!(voice.language.as_deref(), Some("en-US"));
        assert_eq!(voice.gender.as_deref(), Some("female"));

        let voice = VoiceInfo::from_kokoro_id("bm_george");
        assert_eq!(voice.language.as_deref(), Some("en-GB"));
        assert_eq!(voice.gender.as_deref(), Some("male"));
    }

    #[test]
    fn test_voice_info_unknown_prefix() {
        let voice = VoiceInfo::from_kokoro_id("custom");
        assert_eq!(voice.display_name, "Custom");
        assert!(voice.language.is_none());
        assert!(voice.gender.is_none());
    }

    #[test]
    fn test_endpoints_strip_trailing_slash() {
        let engine = HttpSpeechEngine::new("http://localhost:8880/");
        assert_eq!(engine.speech_endpoint(), "http://localhost:8880/v1/audio/speech");
        assert_eq!(engine.voices_endpoint(), "http://localhost:8880/v1/audio/voices");
    }

    #[tokio::test]
    async fn test_synthesize_posts_request_and_returns_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(serde_json::json!({
                "model": "kokoro",
                "input": "Hello ",
                "voice": "af_heart",
                "response_format": "wav",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/wav")
                    .set_body_bytes(b"RIFF0000WAVE".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let engine = HttpSpeechEngine::new(server.uri());
        let audio = engine.synthesize_raw("Hello ", "af_heart", 1.0).await.unwrap();
        assert_eq!(audio.data, b"RIFF0000WAVE");
        assert_eq!(audio.mime_type, "audio/wav");
    }

    #[tokio::test]
    async fn test_synthesize_maps_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;

        let engine = HttpSpeechEngine::new(server.uri());
        let err = engine.synthesize_raw("Hi", "af_heart", 1.0).await.unwrap_err();
        match err {
            EngineError::Api {
                status_code,
                message,
                endpoint,
            } => {
                assert_eq!(status_code, 500);
                assert!(message.contains("model crashed"));
                assert!(endpoint.ends_with("/v1/audio/speech"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_synthesize_maps_unknown_voice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Voice 'zz_none' not found"))
            .mount(&server)
            .await;

        let engine = HttpSpeechEngine::new(server.uri());
        let err = engine.synthesize_raw("Hi", "zz_none", 1.0).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidVoice(ref v) if v == "zz_none"));
    }

    #[tokio::test]
    async fn test_synthesize_rejects_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let engine = HttpSpeechEngine::new(server.uri());
        let err = engine.synthesize_raw("Hi", "af_heart", 1.0).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyAudio));
    }

    #[tokio::test]
    async fn test_list_voices_parses_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/audio/voices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "voices": ["af_heart", "am_adam", "jf_alpha"]
            })))
            .mount(&server)
            .await;

        let engine = HttpSpeechEngine::new(server.uri());
        let voices = engine.list_voices().await.unwrap();
        let ids: Vec<&str> = voices.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["af_heart", "am_adam", "jf_alpha"]);
        assert_eq!(voices[2].language.as_deref(), Some("ja"));
    }

    #[tokio::test]
    async fn test_unreachable_engine_reports_status_zero() {
        // Nothing listens on port 9 (discard) in the test environment.
        let engine = HttpSpeechEngine::new("http://127.0.0.1:9");
        let err = engine.list_voices().await.unwrap_err();
        assert!(matches!(err, EngineError::Api { status_code: 0, .. }));
    }
}
