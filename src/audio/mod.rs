//! Audio input module

mod source;

pub use source::{AudioSource, FileAudioSource};
