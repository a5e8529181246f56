//! Streaming client for WhisperLive-style transcription servers.
//!
//! A [`StreamingSession`] sends a JSON handshake, streams raw audio in paced binary
//! chunks, marks the end with `END_OF_AUDIO`, then yields server messages until the
//! server closes the connection.

pub mod asr;
pub mod audio;
pub mod data;

pub use asr::{
    Connection, Phase, ResponseMessage, SessionConfig, SessionError, SessionState,
    StreamingSession, Task,
};
pub use audio::{AudioSource, FileAudioSource};
pub use data::AppConfig;
