//! WebSocket voice server.
//!
//! Usage: `cadence-server [CONFIG_PATH]`. Without a path the default config
//! file is loaded when it exists. Logs go to stderr; set `RUST_LOG` to
//! change verbosity.

use anyhow::Context;
use cadence::config::SpeechConfig;
use cadence::llm::ApiCompletionEngine;
use cadence::stt::{HttpTranscriptionEngine, TranscriptionEngine};
use cadence::transport::{AppState, SessionEngines, TranscriberFactory, serve};
use cadence::tts::HttpSynthesisEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (writer, _log_guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cadence=info,cadence_server=info")),
        )
        .init();

    let config = load_config()?;
    let engines = build_engines(&config)?;

    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, shutting down");
                signal.cancel();
            }
            Err(e) => tracing::warn!("cannot listen for ctrl-c: {e}"),
        }
    });

    serve(listener, AppState::new(config, engines), shutdown)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "cadence-server exited with error");
            anyhow::anyhow!("cadence-server failed: {e}")
        })?;
    Ok(())
}

fn load_config() -> anyhow::Result<SpeechConfig> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = match explicit {
        Some(path) => SpeechConfig::from_file(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let path = SpeechConfig::default_config_path();
            if path.exists() {
                tracing::info!("loading config from {}", path.display());
                SpeechConfig::from_file(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?
            } else {
                SpeechConfig::default()
            }
        }
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn build_engines(config: &SpeechConfig) -> anyhow::Result<SessionEngines> {
    let llm = Arc::new(ApiCompletionEngine::new(&config.llm)?);
    let tts = Arc::new(HttpSynthesisEngine::new(&config.tts)?);

    let transcriber = if config.stt.enabled {
        let stt = config.stt.clone();
        let sample_rate = config.audio_input.sample_rate;
        HttpTranscriptionEngine::new(&stt, sample_rate)?;
        let factory: TranscriberFactory = Arc::new(move || {
            let engine = HttpTranscriptionEngine::new(&stt, sample_rate)?;
            Ok(Box::new(engine) as Box<dyn TranscriptionEngine>)
        });
        Some(factory)
    } else {
        tracing::info!("transcription disabled, accepting typed input only");
        None
    };

    Ok(SessionEngines { llm, tts, transcriber })
}
