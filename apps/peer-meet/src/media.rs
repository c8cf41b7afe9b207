//! Local media capture.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::peer::{LocalTrack, RemoteTrack, TrackKind};

/// Handle to a captured local stream and its tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

/// Tracks received from the remote participant, grouped by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    pub fn add(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|known| known.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media capture unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn capture(&self) -> Result<LocalMedia, MediaError>;
}

/// Produces one audio and one video track descriptor per capture without
/// touching any device.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMediaSource;

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn capture(&self) -> Result<LocalMedia, MediaError> {
        let stream_id = Uuid::new_v4().to_string();
        let tracks = [TrackKind::Audio, TrackKind::Video]
            .into_iter()
            .map(|kind| LocalTrack {
                id: format!("{kind}-{}", Uuid::new_v4()),
                kind,
            })
            .collect();
        tracing::debug!(target = "session", %stream_id, "synthetic media captured");
        Ok(LocalMedia { stream_id, tracks })
    }
}
