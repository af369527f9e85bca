//! Command-line demo for the live transcription session
//!
//! Connects to the configured backend, records from the default microphone
//! until Ctrl-C, then saves the session as a recording.

use livescribe::{HttpPersistenceClient, SessionConfig, SessionController, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    info!("Backend: {}", config.backend_url);

    let persistence_url = std::env::var("LIVESCRIBE_PERSISTENCE_URL")
        .unwrap_or_else(|_| "http://localhost:9090/api".to_string());
    let persistence = Arc::new(HttpPersistenceClient::new(&persistence_url)?);

    let controller = SessionController::new(config, persistence);

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(state)) => info!("State: {}", state),
                Ok(SessionEvent::SegmentsUpdated) => {}
                Ok(SessionEvent::SessionAssigned(id)) => info!("Session id: {}", id),
                Ok(SessionEvent::ErrorChanged(Some(e))) => error!("Session error: {}", e),
                Ok(SessionEvent::ErrorChanged(None)) => {}
                Ok(SessionEvent::AutosaveCompleted(at)) => info!("Autosaved at {}", at),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    controller.connect();
    // Give the transport a moment to finish the handshake
    tokio::time::sleep(Duration::from_secs(1)).await;

    controller.start_recording("en")?;
    info!("Recording. Press Ctrl-C to stop and save.");

    tokio::signal::ctrl_c().await?;

    controller.stop_recording();
    let snapshot = controller.snapshot();
    info!(
        "Recorded {}s, {} words",
        snapshot.duration_secs, snapshot.word_count
    );
    println!("{}", snapshot.full_text);

    match controller.save("Live session", true).await {
        Ok(recording_id) => info!("Saved as recording {}", recording_id),
        Err(e) => error!("Could not save session: {}", e),
    }

    controller.disconnect();
    Ok(())
}

fn load_config() -> anyhow::Result<SessionConfig> {
    if let Ok(contents) = std::fs::read_to_string("config.toml") {
        info!("Loading configuration from config.toml");
        return Ok(SessionConfig::from_toml_str(&contents)?);
    }

    let mut config = SessionConfig::default();
    if let Ok(url) = std::env::var("LIVESCRIBE_BACKEND_URL") {
        config.backend_url = url;
    }
    if let Ok(token) = std::env::var("LIVESCRIBE_AUTH_TOKEN") {
        config.auth_token = Some(token);
    }
    Ok(config)
}
