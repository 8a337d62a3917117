//! Signaling-Engine Trait und Events
//!
//! Die Engine selbst (SIP-Grammatik, Transaktionen, Transport-Framing) ist
//! nicht Teil dieses Crates. Alle Operationen sind nicht-blockierend: sie
//! stoßen einen Vorgang an, das Ergebnis kommt als `SignalingEvent` zurück.

use crate::media::LocalMedia;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Transport not available: {0}")]
    Transport(String),

    #[error("Not connected to gateway")]
    NotConnected,

    #[error("Failed to send request: {0}")]
    SendFailed(String),

    #[error("Session is gone: {0}")]
    SessionGone(String),
}

// ============================================================================
// SESSION TYPES
// ============================================================================

/// Von der Engine vergebene Session-Kennung
pub type SessionId = String;

/// Richtung einer Session aus Sicht dieses Clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionDirection {
    Inbound,
    Outbound,
}

/// Grund für das Beenden einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    /// Eingehender Anruf abgelehnt
    Rejected,
    /// Ausgehender Anruf abgebrochen bevor er angenommen wurde
    Canceled,
    /// Normales Auflegen einer bestehenden Verbindung
    Bye,
    /// Eingehender Anruf während eines anderen Anrufs
    Busy,
}

/// Parameter für `SignalingSession::end`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndRequest {
    pub cause: EndCause,
    pub status_code: u16,
    pub reason: Option<String>,
}

impl EndRequest {
    pub fn reject() -> Self {
        Self {
            cause: EndCause::Rejected,
            status_code: 486,
            reason: Some("Decline".to_string()),
        }
    }

    pub fn cancel() -> Self {
        Self {
            cause: EndCause::Canceled,
            status_code: 487,
            reason: Some("Request Terminated".to_string()),
        }
    }

    pub fn bye(reason: Option<String>) -> Self {
        Self {
            cause: EndCause::Bye,
            status_code: 200,
            reason,
        }
    }

    pub fn busy() -> Self {
        Self {
            cause: EndCause::Busy,
            status_code: 486,
            reason: Some("Busy Here".to_string()),
        }
    }
}

/// Header einer Session (Name, Wert), Namen case-insensitive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHeaders(pub Vec<(String, String)>);

impl SessionHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl From<Vec<(String, String)>> for SessionHeaders {
    fn from(headers: Vec<(String, String)>) -> Self {
        Self(headers)
    }
}

/// Handle auf eine Session, gehört der Engine
///
/// Ein Dialog borgt sich das Handle für die Dauer des Anrufs.
pub trait SignalingSession: Send + Sync + fmt::Debug {
    fn id(&self) -> SessionId;

    /// Identität der Gegenseite (Anrufer bei eingehenden Sessions)
    fn remote_identity(&self) -> String;

    fn accept(&self, answer: &LocalMedia) -> Result<(), SignalingError>;

    fn end(&self, request: EndRequest) -> Result<(), SignalingError>;

    /// Stößt einen Transfer an, Ergebnis kommt als `TransferAccepted`/`TransferFailed`
    fn transfer(&self, target: &str) -> Result<(), SignalingError>;
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die von der Signaling-Engine ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Transport wird aufgebaut
    Connecting,

    /// Transport steht
    Connected,

    /// Transport getrennt (oder Verbindungsversuch gescheitert)
    Disconnected {
        error: bool,
        code: Option<u16>,
        reason: Option<String>,
    },

    /// Registrierung erfolgreich
    Registered,

    /// Registrierung aufgehoben
    Unregistered,

    /// Registrierung abgelehnt
    RegistrationFailed { cause: String },

    /// Neue Session (eingehend oder ausgehend)
    SessionCreated {
        session: Arc<dyn SignalingSession>,
        direction: SessionDirection,
        headers: SessionHeaders,
    },

    SessionAccepted { session_id: SessionId },

    SessionConfirmed { session_id: SessionId },

    SessionProgress {
        session_id: SessionId,
        code: Option<u16>,
    },

    SessionFailed {
        session_id: SessionId,
        code: Option<u16>,
        cause: String,
    },

    SessionEnded {
        session_id: SessionId,
        code: Option<u16>,
        cause: String,
    },

    TransferAccepted { session_id: SessionId },

    TransferFailed { session_id: SessionId, cause: String },
}

// ============================================================================
// SIGNALING ENGINE
// ============================================================================

/// Externe Signaling-Engine
pub trait SignalingEngine: Send + Sync {
    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    /// Baut den Transport zu den Gateways auf
    fn create_transport(&self, endpoints: &[Url]) -> Result<(), SignalingError>;

    fn register(&self, identity: &str, secret: &str, expires: u32) -> Result<(), SignalingError>;

    fn unregister(&self) -> Result<(), SignalingError>;

    /// Stoppt den Transport
    fn stop(&self);

    /// Startet eine ausgehende Session, gemeldet wird sie per `SessionCreated`
    fn originate_session(
        &self,
        target: &str,
        headers: &[String],
        offer: &LocalMedia,
    ) -> Result<(), SignalingError>;
}
