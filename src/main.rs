use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use whisper_stream::asr::{extract_transcript, is_server_ready};
use whisper_stream::{AppConfig, AudioSource, FileAudioSource, StreamingSession, Task};

/// Stream a raw audio file to a transcription server and print its replies
#[derive(Debug, Parser)]
#[command(name = "whisper-stream", version)]
struct Args {
    /// Raw audio file to send (bytes are sent as-is)
    audio: PathBuf,

    /// Config file (written with defaults if missing)
    #[arg(short, long, default_value = "whisper-stream.toml")]
    config: PathBuf,

    /// Server URL, e.g. ws://127.0.0.1:9090
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    language: Option<String>,

    /// Translate instead of transcribe
    #[arg(long)]
    translate: bool,

    /// Enable voice activity detection on the server
    #[arg(long)]
    vad: bool,

    /// Bytes per audio message
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Delay between audio messages in milliseconds
    #[arg(long)]
    pacing_ms: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(endpoint) = &self.endpoint {
            config.server.endpoint = endpoint.clone();
        }
        if let Some(model) = &self.model {
            config.session.model = model.clone();
        }
        if let Some(language) = &self.language {
            config.session.language = language.clone();
        }
        if self.translate {
            config.session.task = Task::Translate;
        }
        if self.vad {
            config.session.use_vad = true;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.transfer.chunk_size = chunk_size;
        }
        if let Some(pacing_ms) = self.pacing_ms {
            config.transfer.pacing_ms = pacing_ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load_or_default(&args.config)?;
    args.apply(&mut config);

    let audio = FileAudioSource::open(&args.audio)?;
    let session_config = config.session_config();

    let mut session = StreamingSession::open(&config.server.endpoint, session_config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server.endpoint))?;

    info!("Session uid: {}", session.config().uid);

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, closing session");
            token.cancel();
        }
    });

    session
        .run(audio.as_bytes(), config.transfer.chunk_size, config.transfer.pacing())
        .await?;

    let responses = session.drain();
    tokio::pin!(responses);
    let mut count = 0usize;
    while let Some(response) = responses.next().await {
        let response = response?;
        count += 1;
        println!("RX: {}", response);

        if let Some(text) = response.as_text() {
            if is_server_ready(text) {
                info!("Server ready");
            } else if let Some(transcript) = extract_transcript(text) {
                println!("   {}", transcript);
            }
        }
    }

    info!("done: received {} messages", count);
    Ok(())
}
