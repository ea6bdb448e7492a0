//! Kokoro MCP Streaming Speech Server Library
//!
//! This library turns incrementally arriving text into an ordered stream of
//! audio chunks synthesized by a Kokoro engine:
//!
//! - [`segmenter`]: splits pushed text into word segments
//! - [`worker`]: synthesizes segments one at a time per session
//! - [`session`]: state machine and ordered event stream of one request
//! - [`registry`]: process-wide session table with retention sweeping
//! - [`engine`] and [`store`]: the speech engine and payload storage seams
//! - [`handler`] and [`server`]: the MCP tool surface

pub mod engine;
pub mod handler;
pub mod registry;
pub mod segmenter;
pub mod server;
pub mod session;
pub mod store;
pub mod worker;

pub use engine::{HttpSpeechEngine, RawAudio, SpeechEngine, VoiceInfo};
pub use handler::{GenerateSpeechParams, GeneratedSpeech, SpeechHandler, StreamStartParams};
pub use registry::SessionRegistry;
pub use segmenter::{Segment, TextSegmenter};
pub use server::StreamServer;
pub use session::{
    AudioChunk, ChunkEvent, EventReceiver, FinishedEvent, SessionEvent, SessionId, SessionState,
    StreamSession,
};
pub use store::{AudioRef, AudioStore, FileAudioStore, MemoryAudioStore};
pub use worker::{SynthesisPool, SynthesisWorker, VoiceSelection};
