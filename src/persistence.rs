//! Persistence boundary for autosave snapshots and finalized recordings
//!
//! The session controller does not own storage; it talks to an external
//! collaborator through `PersistenceClient`. The default implementation is
//! an HTTP client, but tests substitute an in-memory mock.

use crate::transcript::TranscriptSegment;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the persistence collaborator
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

/// External storage interface consumed by the session controller
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Persist an in-progress snapshot of the full segment sequence
    async fn save_progress(
        &self,
        session_id: &str,
        segments: &[TranscriptSegment],
    ) -> Result<(), PersistenceError>;

    /// Convert the ended session into a durable recording
    ///
    /// `save_audio` asks the backend to retain its streamed copy of the
    /// session audio; no audio payload is re-uploaded from the client.
    /// Returns the new recording's identifier.
    async fn save_session(
        &self,
        session_id: &str,
        title: &str,
        segments: &[TranscriptSegment],
        save_audio: bool,
    ) -> Result<String, PersistenceError>;
}

#[derive(Serialize)]
struct ProgressRequest<'a> {
    segments: &'a [TranscriptSegment],
}

#[derive(Serialize)]
struct FinalizeRequest<'a> {
    session_id: &'a str,
    title: &'a str,
    save_audio: bool,
    segments: &'a [TranscriptSegment],
}

#[derive(Deserialize)]
struct FinalizeResponse {
    recording_id: String,
}

/// HTTP persistence client for the recording service
pub struct HttpPersistenceClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPersistenceClient {
    /// Create a client for the recording service at `base_url`
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client for persistence")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn progress_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/progress", self.base_url, session_id)
    }

    fn recordings_url(&self) -> String {
        format!("{}/recordings", self.base_url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PersistenceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(PersistenceError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PersistenceClient for HttpPersistenceClient {
    async fn save_progress(
        &self,
        session_id: &str,
        segments: &[TranscriptSegment],
    ) -> Result<(), PersistenceError> {
        let response = self
            .client
            .post(self.progress_url(session_id))
            .json(&ProgressRequest { segments })
            .send()
            .await?;
        Self::check_status(response).await?;
        debug!(
            session_id = %session_id,
            segments = segments.len(),
            "Autosave snapshot persisted"
        );
        Ok(())
    }

    async fn save_session(
        &self,
        session_id: &str,
        title: &str,
        segments: &[TranscriptSegment],
        save_audio: bool,
    ) -> Result<String, PersistenceError> {
        let response = self
            .client
            .post(self.recordings_url())
            .json(&FinalizeRequest {
                session_id,
                title,
                save_audio,
                segments,
            })
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body: FinalizeResponse = response
            .json()
            .await
            .map_err(|e| PersistenceError::InvalidResponse(e.to_string()))?;
        info!(
            session_id = %session_id,
            recording_id = %body.recording_id,
            "Session finalized as recording"
        );
        Ok(body.recording_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = HttpPersistenceClient::new("http://localhost:9090/api/").unwrap();
        assert_eq!(
            client.progress_url("sess-1"),
            "http://localhost:9090/api/sessions/sess-1/progress"
        );
        assert_eq!(
            client.recordings_url(),
            "http://localhost:9090/api/recordings"
        );
    }
}
