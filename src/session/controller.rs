//! Call Session Controller
//!
//! Verwaltet den einzigen Slot für einen aktiven Anruf. Ausgehende Anrufe
//! reservieren den Slot bevor die Session angefordert wird; die nächste
//! ausgehende `SessionCreated` wird dieser Reservierung zugeordnet. Eingehende
//! Sessions bei belegtem Slot werden mit Busy abgewiesen.

use super::delegate::{Callbacks, Notification};
use super::dialog::{CallError, CallId, CallInfo, Dialog, DialogStatus, TransferResult};
use super::connection::ConnectionState;
use crate::media::{LocalMedia, Media, MediaEngine, MediaError};
use crate::signaling::{
    render_call_headers, CallVariables, EndRequest, SessionDirection, SessionHeaders,
    SignalingEngine, SignalingEvent, SignalingSession, CALL_ID_HEADER,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Optionen für `make_call()`
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Zusätzliche Variablen, werden als `X-<key>` Header gesendet
    pub variables: CallVariables,
    /// Anrufspezifische Callbacks, überschreiben die der Verbindung
    pub callbacks: Callbacks,
}

/// Reservierter Slot für einen ausgehenden Anruf
struct Reservation {
    call_id: CallId,
    target: String,
    callbacks: Callbacks,
    local_media: Option<LocalMedia>,
    /// `terminate()` kam bevor die Session gemeldet wurde
    cancel_requested: bool,
}

// ============================================================================
// CALL SESSION CONTROLLER
// ============================================================================

#[derive(Default)]
pub(crate) struct CallSessionController {
    dialog: Option<Dialog>,
    reservation: Option<Reservation>,
}

impl CallSessionController {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Slot belegt durch einen laufenden Anruf oder eine Reservierung
    pub(crate) fn is_busy(&self) -> bool {
        self.reservation.is_some() || self.dialog.as_ref().is_some_and(|d| !d.is_terminated())
    }

    pub(crate) fn dialog(&self) -> Option<&Dialog> {
        self.dialog.as_ref()
    }

    fn dialog_mut(&mut self, call_id: &str) -> Option<&mut Dialog> {
        self.dialog.as_mut().filter(|d| d.id() == call_id)
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Prüft Bereitschaft und reserviert den Slot in einem Schritt
    pub(crate) fn reserve(
        &mut self,
        state: ConnectionState,
        target: String,
        callbacks: Callbacks,
    ) -> Result<CallId, CallError> {
        if state != ConnectionState::Registered {
            return Err(CallError::NotReady);
        }
        if self.is_busy() {
            return Err(CallError::CallInProgress);
        }

        let call_id = Uuid::new_v4().to_string();
        tracing::info!("Reserved call {} to {}", call_id, target);

        self.reservation = Some(Reservation {
            call_id: call_id.clone(),
            target,
            callbacks,
            local_media: None,
            cancel_requested: false,
        });
        Ok(call_id)
    }

    /// Fordert die ausgehende Session an
    pub(crate) fn originate(
        &mut self,
        call_id: &str,
        local: Result<LocalMedia, MediaError>,
        variables: &CallVariables,
        engine: &dyn SignalingEngine,
        media: &dyn MediaEngine,
    ) -> Result<(), CallError> {
        let reserved = self
            .reservation
            .as_ref()
            .is_some_and(|r| r.call_id == call_id);

        let local = match local {
            Ok(local) if reserved => local,
            Ok(local) => {
                // Reservierung wurde durch disconnect() verworfen
                media.release(Media::Local(local));
                return Err(CallError::NotReady);
            }
            Err(e) => {
                tracing::warn!("Local capture for call {} failed: {}", call_id, e);
                if reserved {
                    self.reservation = None;
                }
                return Err(e.into());
            }
        };

        let Some(reservation) = self.reservation.as_mut() else {
            media.release(Media::Local(local));
            return Err(CallError::NotReady);
        };

        let headers = render_call_headers(call_id, variables);
        if let Err(e) = engine.originate_session(&reservation.target, &headers, &local) {
            tracing::error!("Failed to originate call {}: {}", call_id, e);
            self.reservation = None;
            media.release(Media::Local(local));
            return Err(e.into());
        }

        reservation.local_media = Some(local);
        Ok(())
    }

    // ========================================================================
    // ACTIONS
    // ========================================================================

    pub(crate) fn terminate(&mut self, call_id: &str, reason: Option<String>) -> Result<(), CallError> {
        if let Some(reservation) = self.reservation.as_mut().filter(|r| r.call_id == call_id) {
            tracing::info!("Call {} canceled before session was created", call_id);
            reservation.cancel_requested = true;
            return Ok(());
        }

        match self.dialog_mut(call_id) {
            Some(dialog) => dialog.terminate(reason),
            None => Ok(()),
        }
    }

    pub(crate) fn begin_answer(&mut self, call_id: &str) -> bool {
        self.dialog_mut(call_id)
            .is_some_and(|dialog| dialog.begin_answer())
    }

    pub(crate) fn complete_answer(
        &mut self,
        call_id: &str,
        local: Result<LocalMedia, MediaError>,
        media: &dyn MediaEngine,
    ) -> Result<(), CallError> {
        match self.dialog_mut(call_id) {
            Some(dialog) => dialog.complete_answer(local, media),
            None => {
                if let Ok(local) = local {
                    media.release(Media::Local(local));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn begin_transfer(
        &mut self,
        call_id: &str,
        target: &str,
    ) -> Result<(u64, oneshot::Receiver<TransferResult>), CallError> {
        self.dialog_mut(call_id)
            .ok_or(CallError::InvalidState)?
            .begin_transfer(target)
    }

    pub(crate) fn expire_transfer(&mut self, call_id: &str, ticket: u64) {
        if let Some(dialog) = self.dialog_mut(call_id) {
            dialog.expire_transfer(ticket);
        }
    }

    /// Beendet den aktiven Anruf beim Trennen der Verbindung
    ///
    /// Nach `stop()` kommen keine Session-Events mehr, der Dialog wird daher
    /// lokal beendet.
    pub(crate) fn abort(&mut self, cause: &str, media: &dyn MediaEngine) -> Vec<Notification> {
        let mut notifications = Vec::new();

        if let Some(mut reservation) = self.reservation.take() {
            tracing::info!("Dropping reservation for call {}", reservation.call_id);
            if let Some(local) = reservation.local_media.take() {
                media.release(Media::Local(local));
            }
        }

        if let Some(dialog) = self.dialog.as_mut().filter(|d| !d.is_terminated()) {
            if let Err(e) = dialog.terminate(None) {
                tracing::warn!("Failed to terminate call {}: {}", dialog.id(), e);
            }
            notifications.extend(dialog.mark_terminated(None, cause, media));
        }

        notifications
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    pub(crate) fn handle_event(
        &mut self,
        event: SignalingEvent,
        identity: &str,
        defaults: &Callbacks,
        media: &dyn MediaEngine,
    ) -> Vec<Notification> {
        let mut notifications = Vec::new();

        match event {
            SignalingEvent::SessionCreated {
                session,
                direction,
                headers,
            } => match direction {
                SessionDirection::Inbound => {
                    notifications.extend(self.on_inbound(session, headers, identity, defaults));
                }
                SessionDirection::Outbound => {
                    notifications.extend(self.on_outbound(session, headers, identity));
                }
            },

            SignalingEvent::SessionAccepted { session_id }
            | SignalingEvent::SessionConfirmed { session_id } => {
                if let Some(dialog) = self.dialog_for_session(&session_id) {
                    notifications.extend(dialog.mark_connected(media));
                }
            }

            SignalingEvent::SessionProgress { session_id, code } => {
                if let Some(dialog) = self.dialog_for_session(&session_id) {
                    notifications.extend(dialog.progress_notification(code));
                }
            }

            SignalingEvent::SessionFailed {
                session_id,
                code,
                cause,
            }
            | SignalingEvent::SessionEnded {
                session_id,
                code,
                cause,
            } => {
                if let Some(dialog) = self.dialog_for_session(&session_id) {
                    notifications.extend(dialog.mark_terminated(code, &cause, media));
                }
            }

            SignalingEvent::TransferAccepted { session_id } => {
                if let Some(dialog) = self.dialog_for_session(&session_id) {
                    dialog.resolve_transfer(Ok(()));
                }
            }

            SignalingEvent::TransferFailed { session_id, cause } => {
                if let Some(dialog) = self.dialog_for_session(&session_id) {
                    dialog.resolve_transfer(Err(CallError::TransferFailed(cause)));
                }
            }

            _ => {}
        }

        notifications
    }

    fn dialog_for_session(&mut self, session_id: &str) -> Option<&mut Dialog> {
        let dialog = self.dialog.as_mut().filter(|d| d.session_id() == session_id);
        if dialog.is_none() {
            tracing::debug!("Ignoring event for unknown session {}", session_id);
        }
        dialog
    }

    fn on_inbound(
        &mut self,
        session: Arc<dyn SignalingSession>,
        headers: SessionHeaders,
        identity: &str,
        defaults: &Callbacks,
    ) -> Option<Notification> {
        if self.is_busy() {
            tracing::info!(
                "Rejecting inbound session {} from {}: busy",
                session.id(),
                session.remote_identity()
            );
            if let Err(e) = session.end(EndRequest::busy()) {
                tracing::warn!("Failed to reject inbound session: {}", e);
            }
            return None;
        }

        let call_id = headers
            .get(CALL_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let info = CallInfo {
            id: call_id,
            direction: SessionDirection::Inbound,
            caller: session.remote_identity(),
            callee: identity.to_string(),
        };

        let dialog = Dialog::new(info, session, None, defaults.clone());
        let notification = dialog.created_notification();
        self.dialog = Some(dialog);
        Some(notification)
    }

    fn on_outbound(
        &mut self,
        session: Arc<dyn SignalingSession>,
        headers: SessionHeaders,
        identity: &str,
    ) -> Option<Notification> {
        let Some(mut reservation) = self.reservation.take() else {
            tracing::warn!(
                "Outbound session {} without pending call, canceling",
                session.id()
            );
            if let Err(e) = session.end(EndRequest::cancel()) {
                tracing::warn!("Failed to cancel stray session: {}", e);
            }
            return None;
        };

        if let Some(tagged) = headers.get(CALL_ID_HEADER) {
            if tagged != reservation.call_id {
                tracing::warn!(
                    "Session {} tagged {} but call {} is pending",
                    session.id(),
                    tagged,
                    reservation.call_id
                );
            }
        }

        let info = CallInfo {
            id: reservation.call_id.clone(),
            direction: SessionDirection::Outbound,
            caller: identity.to_string(),
            callee: reservation.target.clone(),
        };

        let mut dialog = Dialog::new(
            info,
            session,
            reservation.local_media.take(),
            reservation.callbacks.clone(),
        );
        let notification = dialog.created_notification();

        if reservation.cancel_requested {
            if let Err(e) = dialog.terminate(None) {
                tracing::warn!("Failed to cancel call {}: {}", dialog.id(), e);
            }
        }

        self.dialog = Some(dialog);
        Some(notification)
    }

    /// Status des aktuellen Dialogs, falls vorhanden
    pub(crate) fn status(&self, call_id: &str) -> Option<DialogStatus> {
        self.dialog
            .as_ref()
            .filter(|d| d.id() == call_id)
            .map(|d| d.status())
    }
}

// ============================================================================
// TESTS
// ============================================================================
