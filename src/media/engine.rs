//! Media-Engine Trait und Media-Handles

use crate::config::DeviceSelector;
use crate::signaling::SignalingSession;
use futures::future::BoxFuture;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Capture device not available: {0}")]
    DeviceUnavailable(String),

    #[error("Capture permission denied")]
    PermissionDenied,

    #[error("Failed to attach remote media: {0}")]
    AttachFailed(String),
}

// ============================================================================
// MEDIA HANDLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Einzelner Track, die eigentliche Ressource verwaltet die Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Lokale Aufnahme (Mikrofon), dient als Offer bzw. Answer
#[derive(Debug, PartialEq, Eq)]
pub struct LocalMedia {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

/// An eine Session gebundene Remote-Tracks
#[derive(Debug, PartialEq, Eq)]
pub struct RemoteMedia {
    pub session_id: String,
    pub tracks: Vec<MediaTrack>,
}

/// Alles was an `MediaEngine::release` zurückgegeben werden kann
///
/// `release` nimmt das Handle by value, ein Handle kann also nur einmal
/// freigegeben werden.
#[derive(Debug, PartialEq, Eq)]
pub enum Media {
    Local(LocalMedia),
    Remote(RemoteMedia),
}

// ============================================================================
// MEDIA ENGINE
// ============================================================================

/// Externe Media-Engine
pub trait MediaEngine: Send + Sync {
    /// Fordert die lokale Aufnahme an (kann auf eine Benutzerfreigabe warten)
    fn acquire_local_capture(
        &self,
        device: &DeviceSelector,
    ) -> BoxFuture<'static, Result<LocalMedia, MediaError>>;

    fn attach_remote_tracks(
        &self,
        session: &dyn SignalingSession,
    ) -> Result<RemoteMedia, MediaError>;

    /// Stoppt und entfernt alle Tracks des Handles
    fn release(&self, media: Media);
}
