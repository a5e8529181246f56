//! Streaming Protocol Constants

/// Default transcription server URL
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:9090";

/// End-of-stream marker, sent as a binary message after the last audio chunk
pub const END_OF_AUDIO: &[u8] = b"END_OF_AUDIO";

/// Readiness token some servers send after the handshake
pub const SERVER_READY: &str = "SERVER_READY";

/// Default session configuration
pub const DEFAULT_UID_PREFIX: &str = "test";
pub const DEFAULT_MODEL: &str = "small";
pub const DEFAULT_LANGUAGE: &str = "tl";

/// Transfer pacing
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_PACING_MS: u64 = 10;
