//! Dialog - Zustandsmaschine eines einzelnen Anrufs
//!
//! `Created → Connected → Terminated`, `Terminated` ist endgültig.
//! Doppelte Events (accepted + confirmed, failed + ended) sind erlaubt und
//! lösen jeweils nur einen Übergang und einen Callback aus.

use super::delegate::{Callbacks, Notification};
use super::latch::Latch;
use crate::media::{LocalMedia, Media, MediaEngine, MediaError, RemoteMedia};
use crate::signaling::{EndRequest, SessionDirection, SessionId, SignalingError, SignalingSession};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Not registered")]
    NotReady,

    #[error("Call already in progress")]
    CallInProgress,

    #[error("Action not allowed in current call state")]
    InvalidState,

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Transfer not acknowledged in time")]
    TransferTimeout,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

// ============================================================================
// DIALOG TYPES
// ============================================================================

/// Global eindeutige Call-ID
pub type CallId = String;

pub type CallDirection = SessionDirection;

/// Status eines Dialogs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogStatus {
    Created,
    Connected,
    Terminated,
}

/// Informationen für `call_created`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub id: CallId,
    pub direction: CallDirection,
    pub caller: String,
    pub callee: String,
}

pub(crate) type TransferResult = Result<(), CallError>;

// ============================================================================
// DIALOG
// ============================================================================

pub(crate) struct Dialog {
    info: CallInfo,
    status: DialogStatus,
    session: Arc<dyn SignalingSession>,
    callbacks: Callbacks,
    local_media: Option<LocalMedia>,
    /// Gesetzt sobald Remote-Tracks angehängt sind
    remote_media: Option<RemoteMedia>,
    connected_notified: bool,
    terminated_notified: bool,
    answering: bool,
    /// Reject, cancel oder bye wurde an die Session gesendet
    end_requested: bool,
    pending_transfer: Option<Latch<TransferResult>>,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl Dialog {
    pub(crate) fn new(
        info: CallInfo,
        session: Arc<dyn SignalingSession>,
        local_media: Option<LocalMedia>,
        callbacks: Callbacks,
    ) -> Self {
        tracing::info!(
            "Dialog {} created ({:?}, session {})",
            info.id,
            info.direction,
            session.id()
        );

        Self {
            info,
            status: DialogStatus::Created,
            session,
            callbacks,
            local_media,
            remote_media: None,
            connected_notified: false,
            terminated_notified: false,
            answering: false,
            end_requested: false,
            pending_transfer: None,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.info.id
    }

    pub(crate) fn info(&self) -> &CallInfo {
        &self.info
    }

    pub(crate) fn status(&self) -> DialogStatus {
        self.status
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.status == DialogStatus::Terminated
    }

    pub(crate) fn created_notification(&self) -> Notification {
        Notification::CallCreated {
            callbacks: self.callbacks.clone(),
            info: self.info.clone(),
        }
    }

    // ========================================================================
    // SIGNALING TRANSITIONS
    // ========================================================================

    /// `Created → Connected` (session accepted oder confirmed)
    pub(crate) fn mark_connected(&mut self, media: &dyn MediaEngine) -> Option<Notification> {
        if self.status == DialogStatus::Terminated {
            tracing::debug!("Dialog {} already terminated, ignoring connect event", self.info.id);
            return None;
        }

        if self.status == DialogStatus::Created {
            self.status = DialogStatus::Connected;
            self.connected_at = Some(Utc::now());
            self.attach_remote_media(media);
        }

        if self.connected_notified {
            tracing::debug!("Dialog {} already connected, ignoring duplicate", self.info.id);
            return None;
        }
        self.connected_notified = true;

        tracing::info!("Dialog {} connected", self.info.id);
        Some(Notification::CallConnected {
            callbacks: self.callbacks.clone(),
            call_id: self.info.id.clone(),
        })
    }

    /// `Created|Connected → Terminated` (session failed oder ended)
    pub(crate) fn mark_terminated(
        &mut self,
        code: Option<u16>,
        cause: &str,
        media: &dyn MediaEngine,
    ) -> Option<Notification> {
        if self.status != DialogStatus::Terminated {
            self.status = DialogStatus::Terminated;
            self.answering = false;
            self.release_media(media);

            if let Some(latch) = self.pending_transfer.take() {
                latch.fire(Err(CallError::TransferFailed("call terminated".to_string())));
            }
        }

        if self.terminated_notified {
            tracing::debug!(
                "Dialog {} already terminated, ignoring '{}'",
                self.info.id,
                cause
            );
            return None;
        }
        self.terminated_notified = true;

        let talk_time = self
            .connected_at
            .map(|at| (Utc::now() - at).num_seconds())
            .unwrap_or_default();
        tracing::info!(
            "Dialog {} terminated after {}s (code {:?}, cause '{}')",
            self.info.id,
            talk_time,
            code,
            cause
        );
        Some(Notification::CallTerminated {
            callbacks: self.callbacks.clone(),
            call_id: self.info.id.clone(),
            code,
            cause: cause.to_string(),
        })
    }

    pub(crate) fn progress_notification(&self, code: Option<u16>) -> Option<Notification> {
        if self.is_terminated() {
            return None;
        }
        tracing::debug!("Dialog {} progress {:?}", self.info.id, code);
        Some(Notification::CallProgress {
            call_id: self.info.id.clone(),
            code,
        })
    }

    // ========================================================================
    // ACTIONS
    // ========================================================================

    /// Beendet den Anruf abhängig von Status und Richtung
    ///
    /// Der Übergang nach `Terminated` passiert erst mit dem Event der Engine.
    /// Ein laufendes `answer()` wird dabei verworfen.
    pub(crate) fn terminate(&mut self, reason: Option<String>) -> Result<(), CallError> {
        let request = match (self.status, self.info.direction) {
            (DialogStatus::Terminated, _) => return Ok(()),
            (DialogStatus::Created, SessionDirection::Inbound) => EndRequest::reject(),
            (DialogStatus::Created, SessionDirection::Outbound) => EndRequest::cancel(),
            (DialogStatus::Connected, _) => EndRequest::bye(reason),
        };

        tracing::info!(
            "Terminating dialog {} ({:?} {})",
            self.info.id,
            request.cause,
            request.status_code
        );
        self.end_requested = true;
        self.answering = false;
        self.session.end(request)?;
        Ok(())
    }

    /// Prüft ob ein Annehmen erlaubt ist und markiert es als laufend
    pub(crate) fn begin_answer(&mut self) -> bool {
        if self.info.direction != SessionDirection::Inbound
            || self.status != DialogStatus::Created
            || self.answering
            || self.end_requested
        {
            return false;
        }
        self.answering = true;
        true
    }

    /// Nimmt die Session mit der lokalen Aufnahme an
    ///
    /// Ist der Anruf inzwischen beendet, wird die Aufnahme wieder freigegeben.
    pub(crate) fn complete_answer(
        &mut self,
        local: Result<LocalMedia, MediaError>,
        media: &dyn MediaEngine,
    ) -> Result<(), CallError> {
        let local = match local {
            Ok(local) => local,
            Err(e) => {
                self.answering = false;
                return Err(e.into());
            }
        };

        if !self.answering || self.end_requested || self.status != DialogStatus::Created {
            tracing::debug!("Dialog {} no longer answerable", self.info.id);
            media.release(Media::Local(local));
            return Ok(());
        }

        self.answering = false;
        if let Err(e) = self.session.accept(&local) {
            media.release(Media::Local(local));
            return Err(e.into());
        }

        tracing::info!("Dialog {} answered", self.info.id);
        self.local_media = Some(local);
        Ok(())
    }

    /// Stößt einen Transfer an, nur im Status `Connected`
    pub(crate) fn begin_transfer(
        &mut self,
        target: &str,
    ) -> Result<(u64, oneshot::Receiver<TransferResult>), CallError> {
        if self.status != DialogStatus::Connected {
            return Err(CallError::InvalidState);
        }

        if let Some(latch) = self.pending_transfer.as_mut() {
            return Ok((latch.ticket(), latch.join()));
        }

        self.session.transfer(target)?;
        tracing::info!("Dialog {} transfer to {} requested", self.info.id, target);

        let mut latch = Latch::new();
        let rx = latch.join();
        let ticket = latch.ticket();
        self.pending_transfer = Some(latch);
        Ok((ticket, rx))
    }

    pub(crate) fn resolve_transfer(&mut self, result: TransferResult) {
        match self.pending_transfer.take() {
            Some(latch) => latch.fire(result),
            None => tracing::debug!("Dialog {} has no pending transfer", self.info.id),
        }
    }

    pub(crate) fn expire_transfer(&mut self, ticket: u64) {
        if self.pending_transfer.as_ref().map(|l| l.ticket()) == Some(ticket) {
            if let Some(latch) = self.pending_transfer.take() {
                tracing::warn!("Dialog {} transfer timed out", self.info.id);
                latch.fire(Err(CallError::TransferTimeout));
            }
        }
    }

    // ========================================================================
    // MEDIA
    // ========================================================================

    /// Hängt Remote-Tracks an, höchstens einmal pro Dialog
    fn attach_remote_media(&mut self, media: &dyn MediaEngine) {
        if self.remote_media.is_some() {
            return;
        }

        match media.attach_remote_tracks(self.session.as_ref()) {
            Ok(remote) => {
                tracing::debug!(
                    "Dialog {} attached {} remote track(s)",
                    self.info.id,
                    remote.tracks.len()
                );
                self.remote_media = Some(remote);
            }
            Err(e) => tracing::error!("Dialog {} failed to attach media: {}", self.info.id, e),
        }
    }

    fn release_media(&mut self, media: &dyn MediaEngine) {
        if let Some(remote) = self.remote_media.take() {
            media.release(Media::Remote(remote));
        }
        if let Some(local) = self.local_media.take() {
            media.release(Media::Local(local));
        }
    }
}

impl std::fmt::Debug for Dialog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialog")
            .field("info", &self.info)
            .field("status", &self.status)
            .field("session", &self.session.id())
            .field("media_attached", &self.remote_media.is_some())
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
