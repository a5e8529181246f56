//! ASR (Automatic Speech Recognition) module
//!
//! This module implements the client side of the streaming transcription protocol:
//! handshake, paced audio transfer, end-of-audio marker, then draining results.

mod connection;
mod constants;
mod error;
mod protocol;
mod session;

pub use connection::{Connection, WsConnection};
pub use constants::*;
pub use error::{Phase, SessionError};
pub use protocol::{extract_transcript, is_server_ready, ResponseMessage, SessionConfig, Task};
pub use session::{SessionState, StreamingSession};
