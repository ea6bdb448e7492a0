//! MCP Server implementation for the Kokoro streaming server.
//!
//! This module provides the MCP server handler that exposes:
//! - `list_voices` for listing engine voices
//! - `generate_speech` for one-shot synthesis
//! - `stream_start`, `stream_push`, `stream_close`, `stream_cancel`,
//!   `stream_poll` and `stream_remove` for incremental sessions
//! - `cleanup_audio` for deleting generated files

use crate::handler::{DEFAULT_SPEED, GenerateSpeechParams, SpeechHandler, StreamStartParams};
use crate::registry::SessionRegistry;
use kokoro_mcp_common::config::Config;
use kokoro_mcp_common::error::Error;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::{CallToolResult, Content, JsonObject, ServerCapabilities, ServerInfo, Tool},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info};

/// MCP Server for streaming speech synthesis.
#[derive(Clone)]
pub struct StreamServer {
    handler: Arc<SpeechHandler>,
}

/// Tool parameters for generate_speech.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateSpeechToolParams {
    /// Text to synthesize into speech
    pub text: String,
    /// Voice id (e.g. "af_heart"); see list_voices
    #[serde(default)]
    pub voice: Option<String>,
    /// Speed factor (0.25-4.0, default 1.0)
    #[serde(default)]
    pub speed: Option<f32>,
}

impl From<GenerateSpeechToolParams> for GenerateSpeechParams {
    fn from(params: GenerateSpeechToolParams) -> Self {
        Self {
            text: params.text,
            voice: params.voice,
            speed: params.speed.unwrap_or(DEFAULT_SPEED),
        }
    }
}

/// Tool parameters for stream_start.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct StreamStartToolParams {
    /// Voice id (e.g. "af_heart"); see list_voices
    #[serde(default)]
    pub voice: Option<String>,
    /// Speed factor (0.25-4.0, default 1.0)
    #[serde(default)]
    pub speed: Option<f32>,
}

impl From<StreamStartToolParams> for StreamStartParams {
    fn from(params: StreamStartToolParams) -> Self {
        Self {
            voice: params.voice,
            speed: params.speed.unwrap_or(DEFAULT_SPEED),
        }
    }
}

/// Tool parameters for stream_push.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct StreamPushToolParams {
    /// Session id returned by stream_start
    pub session_id: String,
    /// Next piece of text; may end mid-word
    pub text: String,
}

/// Tool parameters for tools that only name a session.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionToolParams {
    /// Session id returned by stream_start
    pub session_id: String,
}

/// Tool parameters for stream_poll.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct StreamPollToolParams {
    /// Session id returned by stream_start
    pub session_id: String,
    /// Only return chunks with sequence_index >= after (default 0)
    #[serde(default)]
    pub after: u64,
}

/// Tool parameters for cleanup_audio.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CleanupAudioToolParams {
    /// Audio URL returned by generate_speech or stream_poll
    pub uri: String,
}

#[derive(Serialize)]
struct StartedReply {
    session_id: String,
}

#[derive(Serialize)]
struct PushedReply {
    session_id: String,
    committed_segments: usize,
}

#[derive(Serialize)]
struct CancelledReply {
    session_id: String,
    cancelled: bool,
}

#[derive(Serialize)]
struct CleanupReply {
    uri: String,
    deleted: bool,
}

/// Map a handler error onto the MCP error space.
fn to_mcp_error(context: &str, error: Error) -> McpError {
    if error.is_caller_error() {
        McpError::invalid_params(format!("{}: {}", context, error), None)
    } else {
        McpError::internal_error(format!("{}: {}", context, error), None)
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        McpError::internal_error(format!("Failed to serialize result: {}", e), None)
    })?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn parse_args<T: DeserializeOwned>(arguments: Option<JsonObject>) -> Result<T, McpError> {
    let args = arguments.unwrap_or_default();
    serde_json::from_value(serde_json::Value::Object(args))
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e), None))
}

fn schema_of<T: JsonSchema>() -> Arc<JsonObject> {
    let schema = schemars::schema_for!(T);
    match serde_json::to_value(&schema).unwrap_or_default() {
        serde_json::Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

fn tool(name: &'static str, description: &'static str, input_schema: Arc<JsonObject>) -> Tool {
    Tool {
        name: Cow::Borrowed(name),
        description: Some(Cow::Borrowed(description)),
        input_schema,
        annotations: None,
        icons: None,
        meta: None,
        output_schema: None,
        title: None,
    }
}

impl StreamServer {
    /// Create a server backed by the Kokoro service named in `config`.
    pub fn new(config: Config) -> Self {
        Self::with_handler(SpeechHandler::new(config))
    }

    /// Create a server around an existing handler.
    pub fn with_handler(handler: SpeechHandler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// The session registry, for shutdown and background sweeping.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(self.handler.registry())
    }

    /// List available voices.
    pub async fn list_voices(&self) -> Result<CallToolResult, McpError> {
        info!("Listing available voices");
        let voices = self
            .handler
            .list_voices()
            .await
            .map_err(|e| to_mcp_error("Failed to list voices", e))?;
        json_result(&voices)
    }

    /// Synthesize a complete text.
    pub async fn generate_speech(
        &self,
        params: GenerateSpeechToolParams,
    ) -> Result<CallToolResult, McpError> {
        info!(text_len = params.text.len(), "Generating speech");
        let result = self
            .handler
            .generate(params.into())
            .await
            .map_err(|e| to_mcp_error("Speech generation failed", e))?;
        json_result(&result)
    }

    /// Open a streaming session.
    pub async fn stream_start(
        &self,
        params: StreamStartToolParams,
    ) -> Result<CallToolResult, McpError> {
        let id = self
            .handler
            .stream_start(params.into())
            .await
            .map_err(|e| to_mcp_error("Failed to start session", e))?;
        json_result(&StartedReply {
            session_id: id.to_string(),
        })
    }

    /// Push text into a session.
    pub async fn stream_push(
        &self,
        params: StreamPushToolParams,
    ) -> Result<CallToolResult, McpError> {
        let committed = self
            .handler
            .stream_push(&params.session_id, &params.text)
            .await
            .map_err(|e| to_mcp_error("Failed to push text", e))?;
        json_result(&PushedReply {
            session_id: params.session_id,
            committed_segments: committed,
        })
    }

    /// Close a session's input.
    pub async fn stream_close(&self, params: SessionToolParams) -> Result<CallToolResult, McpError> {
        let committed = self
            .handler
            .stream_close(&params.session_id)
            .await
            .map_err(|e| to_mcp_error("Failed to close input", e))?;
        json_result(&PushedReply {
            session_id: params.session_id,
            committed_segments: committed,
        })
    }

    /// Cancel a session.
    pub async fn stream_cancel(&self, params: SessionToolParams) -> Result<CallToolResult, McpError> {
        let cancelled = self
            .handler
            .stream_cancel(&params.session_id)
            .await
            .map_err(|e| to_mcp_error("Failed to cancel session", e))?;
        json_result(&CancelledReply {
            session_id: params.session_id,
            cancelled,
        })
    }

    /// Report a session's state and new chunks.
    pub async fn stream_poll(&self, params: StreamPollToolParams) -> Result<CallToolResult, McpError> {
        let polled = self
            .handler
            .stream_poll(&params.session_id, params.after)
            .await
            .map_err(|e| to_mcp_error("Failed to poll session", e))?;
        json_result(&polled)
    }

    /// Remove a session.
    pub async fn stream_remove(&self, params: SessionToolParams) -> Result<CallToolResult, McpError> {
        self.handler
            .stream_remove(&params.session_id)
            .await
            .map_err(|e| to_mcp_error("Failed to remove session", e))?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Session {} removed",
            params.session_id
        ))]))
    }

    /// Delete a generated audio file.
    pub async fn cleanup_audio(
        &self,
        params: CleanupAudioToolParams,
    ) -> Result<CallToolResult, McpError> {
        let deleted = self
            .handler
            .cleanup_audio(&params.uri)
            .await
            .map_err(|e| to_mcp_error("Failed to clean up audio", e))?;
        json_result(&CleanupReply {
            uri: params.uri,
            deleted,
        })
    }
}

impl ServerHandler for StreamServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Streaming text-to-speech server backed by a Kokoro engine. \
                 Use generate_speech for complete texts, or stream_start, stream_push \
                 and stream_close to feed text incrementally and stream_poll to collect \
                 audio chunks in order. list_voices shows available voices."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    fn list_tools(
        &self,
        _params: Option<rmcp::model::PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<rmcp::model::ListToolsResult, McpError>> + Send + '_
    {
        async move {
            use rmcp::model::ListToolsResult;

            let session_schema = schema_of::<SessionToolParams>();

            Ok(ListToolsResult {
                tools: vec![
                    tool(
                        "list_voices",
                        "List the voices offered by the Kokoro engine with language and gender.",
                        Arc::new(JsonObject::new()),
                    ),
                    tool(
                        "generate_speech",
                        "Convert a complete text to speech. Returns one WAV chunk per word \
                         (URL or base64 data URI depending on the delivery mode).",
                        schema_of::<GenerateSpeechToolParams>(),
                    ),
                    tool(
                        "stream_start",
                        "Open a streaming synthesis session and return its session_id.",
                        schema_of::<StreamStartToolParams>(),
                    ),
                    tool(
                        "stream_push",
                        "Push the next piece of text into a session. Words are synthesized \
                         as soon as the following word starts.",
                        schema_of::<StreamPushToolParams>(),
                    ),
                    tool(
                        "stream_close",
                        "Close a session's input. The remaining text is synthesized and the \
                         last chunk is marked final.",
                        session_schema.clone(),
                    ),
                    tool(
                        "stream_cancel",
                        "Cancel a session. No further chunks are produced. Idempotent.",
                        session_schema.clone(),
                    ),
                    tool(
                        "stream_poll",
                        "Return a session's state, transcript, error and the chunks with \
                         sequence_index >= after.",
                        schema_of::<StreamPollToolParams>(),
                    ),
                    tool(
                        "stream_remove",
                        "Remove a session and release its audio, cancelling it if still running.",
                        session_schema,
                    ),
                    tool(
                        "cleanup_audio",
                        "Delete a generated audio file by the URL it was returned under.",
                        schema_of::<CleanupAudioToolParams>(),
                    ),
                ],
                next_cursor: None,
                meta: None,
            })
        }
    }

    fn call_tool(
        &self,
        params: rmcp::model::CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move { self.dispatch(&params.name, params.arguments).await }
    }
}

impl StreamServer {
    /// Route a tool call by name.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, McpError> {
        debug!(tool = %name, "Calling tool");
        match name {
            "list_voices" => self.list_voices().await,
            "generate_speech" => self.generate_speech(parse_args(arguments)?).await,
            "stream_start" => self.stream_start(parse_args(arguments)?).await,
            "stream_push" => self.stream_push(parse_args(arguments)?).await,
            "stream_close" => self.stream_close(parse_args(arguments)?).await,
            "stream_cancel" => self.stream_cancel(parse_args(arguments)?).await,
            "stream_poll" => self.stream_poll(parse_args(arguments)?).await,
            "stream_remove" => self.stream_remove(parse_args(arguments)?).await,
            "cleanup_audio" => self.cleanup_audio(parse_args(arguments)?).await,
            _ => Err(McpError::invalid_params(
                format!("Unknown tool: {}", name),
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kokoro_mcp_common::error::{EngineError, SessionError};
    use rmcp::model::ErrorCode;

    #[test]
    fn test_server_info() {
        let server = StreamServer::new(Config::default());
        let info = server.get_info();
        assert!(info.instructions.is_some());
        assert!(info.capabilities.tools.is_some());
    }

    #[test]
    fn test_tool_params_conversion() {
        let tool_params = GenerateSpeechToolParams {
            text: "Hello world".to_string(),
            voice: Some("bf_emma".to_string()),
            speed: Some(1.5),
        };

        let params: GenerateSpeechParams = tool_params.into();
        assert_eq!(params.text, "Hello world");
        assert_eq!(params.voice.as_deref(), Some("bf_emma"));
        assert_eq!(params.speed, 1.5);
    }

    #[test]
    fn test_tool_params_defaults() {
        let params: StreamStartParams = StreamStartToolParams::default().into();
        assert!(params.voice.is_none());
        assert_eq!(params.speed, DEFAULT_SPEED);
    }

    #[test]
    fn test_parse_args_rejects_missing_fields() {
        let err = parse_args::<StreamPushToolParams>(None).unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }

    #[test]
    fn test_poll_after_defaults_to_zero() {
        let mut args = JsonObject::new();
        args.insert("session_id".into(), serde_json::json!("abc"));
        let params: StreamPollToolParams = parse_args(Some(args)).unwrap();
        assert_eq!(params.after, 0);
    }

    #[test]
    fn test_error_mapping() {
        let caller = to_mcp_error("x", SessionError::not_found("abc").into());
        assert_eq!(caller.code, ErrorCode::INVALID_PARAMS);

        let caller = to_mcp_error("x", Error::validation("speed out of range"));
        assert_eq!(caller.code, ErrorCode::INVALID_PARAMS);

        let internal = to_mcp_error("x", EngineError::EmptyAudio.into());
        assert_eq!(internal.code, ErrorCode::INTERNAL_ERROR);
    }

    #[test]
    fn test_schema_lists_properties() {
        let schema = schema_of::<StreamPollToolParams>();
        let properties = schema.get("properties").and_then(|p| p.as_object()).unwrap();
        assert!(properties.contains_key("session_id"));
        assert!(properties.contains_key("after"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let server = StreamServer::new(Config::default());
        let err = server.dispatch("speech_synthesize", None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }
}
