//! Connection Manager - Transport und Registrierung
//!
//! Hält den Verbindungsstatus und die wartenden Operationen für
//! Verbindungsaufbau und Registrierung. Der Status ändert sich nur durch
//! Events der Signaling-Engine, einen abgelaufenen Timer oder `disconnect()`.

use super::delegate::{Callbacks, Notification};
use super::latch::Latch;
use crate::config::{ConfigError, Credentials};
use crate::signaling::{SignalingEngine, SignalingError, SignalingEvent};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Registration timeout")]
    RegistrationTimeout,

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Operation superseded by disconnect")]
    Superseded,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registering,
    Registered,
}

impl ConnectionState {
    /// Transport steht (unabhängig von der Registrierung)
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Registering | ConnectionState::Registered
        )
    }
}

/// Optionen für `connect()`
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Werden über die bisherigen Callbacks gelegt
    pub callbacks: Callbacks,
}

pub(crate) type ConnectionResult = Result<ConnectionState, ConnectionError>;

/// Ergebnis beim Starten einer Operation
pub(crate) enum Begin {
    /// Nichts zu tun, aktueller Status
    Ready(ConnectionState),
    /// Operation läuft, auf den Latch warten
    Pending {
        ticket: u64,
        rx: oneshot::Receiver<ConnectionResult>,
    },
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

pub(crate) struct ConnectionManager {
    state: ConnectionState,
    callbacks: Callbacks,
    identity: Option<String>,
    /// Transport wurde gestartet und nicht gestoppt
    transport_active: bool,
    /// Verbindung war aufgebaut, `on_disconnect` steht noch aus
    episode_open: bool,
    pending_connect: Option<Latch<ConnectionResult>>,
    pending_register: Option<Latch<ConnectionResult>>,
}

impl ConnectionManager {
    pub(crate) fn new(callbacks: Callbacks) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            callbacks,
            identity: None,
            transport_active: false,
            episode_open: false,
            pending_connect: None,
            pending_register: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Eigene Identität, sobald ein Verbindungsversuch gestartet wurde
    pub(crate) fn identity(&self) -> &str {
        self.identity.as_deref().unwrap_or_default()
    }

    /// Startet den Verbindungsaufbau
    pub(crate) fn begin_connect(
        &mut self,
        endpoints: Result<Vec<Url>, ConfigError>,
        credentials: &Credentials,
        options: ConnectOptions,
        engine: &dyn SignalingEngine,
    ) -> Result<Begin, ConnectionError> {
        self.callbacks = self.callbacks.merged_with(&options.callbacks);

        if self.state.is_connected() {
            tracing::debug!("Already connected ({:?})", self.state);
            return Ok(Begin::Ready(self.state));
        }

        if self.state == ConnectionState::Connecting {
            if let Some(latch) = self.pending_connect.as_mut() {
                return Ok(Begin::Pending {
                    ticket: latch.ticket(),
                    rx: latch.join(),
                });
            }
        }

        let endpoints = endpoints?;
        credentials.validate()?;

        tracing::info!(
            "Connecting as '{}' to {} gateway(s)",
            credentials.identity,
            endpoints.len()
        );

        self.identity = Some(credentials.identity.clone());
        self.state = ConnectionState::Connecting;
        self.transport_active = true;

        if let Err(e) = engine.create_transport(&endpoints) {
            tracing::error!("Failed to create transport: {}", e);
            self.state = ConnectionState::Disconnected;
            self.transport_active = false;
            return Err(e.into());
        }

        let mut latch = Latch::new();
        let rx = latch.join();
        let ticket = latch.ticket();
        self.pending_connect = Some(latch);

        Ok(Begin::Pending { ticket, rx })
    }

    /// Timer für den Verbindungsaufbau ist abgelaufen
    pub(crate) fn expire_connect(&mut self, ticket: u64, engine: &dyn SignalingEngine) {
        if self.pending_connect.as_ref().map(|l| l.ticket()) != Some(ticket) {
            return;
        }

        if let Some(latch) = self.pending_connect.take() {
            tracing::warn!("Connection attempt timed out");
            self.state = ConnectionState::Disconnected;
            self.transport_active = false;
            engine.stop();
            latch.fire(Err(ConnectionError::ConnectionTimeout));
        }
    }

    /// Startet die Registrierung, Transport muss stehen
    pub(crate) fn begin_register(
        &mut self,
        credentials: &Credentials,
        expires: u32,
        engine: &dyn SignalingEngine,
    ) -> Result<Begin, ConnectionError> {
        match self.state {
            ConnectionState::Registered => return Ok(Begin::Ready(self.state)),
            ConnectionState::Registering => {
                if let Some(latch) = self.pending_register.as_mut() {
                    return Ok(Begin::Pending {
                        ticket: latch.ticket(),
                        rx: latch.join(),
                    });
                }
            }
            ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(ConnectionError::Superseded);
            }
        }

        credentials.validate()?;

        tracing::info!("Registering '{}' (expires {}s)", credentials.identity, expires);
        engine.register(&credentials.identity, &credentials.secret, expires)?;

        self.identity = Some(credentials.identity.clone());
        self.state = ConnectionState::Registering;

        let mut latch = Latch::new();
        let rx = latch.join();
        let ticket = latch.ticket();
        self.pending_register = Some(latch);

        Ok(Begin::Pending { ticket, rx })
    }

    /// Timer für die Registrierung ist abgelaufen
    pub(crate) fn expire_register(&mut self, ticket: u64) {
        if self.pending_register.as_ref().map(|l| l.ticket()) != Some(ticket) {
            return;
        }

        if let Some(latch) = self.pending_register.take() {
            tracing::warn!("Registration timed out");
            if self.state == ConnectionState::Registering {
                self.state = ConnectionState::Connected;
            }
            latch.fire(Err(ConnectionError::RegistrationTimeout));
        }
    }

    /// Meldet ab und stoppt den Transport, idempotent
    pub(crate) fn disconnect(&mut self, engine: &dyn SignalingEngine) -> Vec<Notification> {
        let mut notifications = Vec::new();

        if self.state == ConnectionState::Disconnected && !self.transport_active {
            tracing::debug!("Already disconnected");
            return notifications;
        }

        tracing::info!("Disconnecting ({:?})", self.state);

        if matches!(
            self.state,
            ConnectionState::Registered | ConnectionState::Registering
        ) {
            if let Err(e) = engine.unregister() {
                tracing::warn!("Failed to unregister: {}", e);
            }
        }

        engine.stop();
        self.transport_active = false;
        self.state = ConnectionState::Disconnected;
        self.fail_pending(ConnectionError::Superseded);

        if self.episode_open {
            self.episode_open = false;
            notifications.push(Notification::Disconnected {
                callbacks: self.callbacks.clone(),
                error: false,
                code: None,
                reason: Some("Disconnected by client".to_string()),
            });
        }

        notifications
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    pub(crate) fn handle_event(&mut self, event: &SignalingEvent) -> Vec<Notification> {
        let mut notifications = Vec::new();

        match event {
            SignalingEvent::Connecting => {
                tracing::debug!("Transport connecting");
            }

            SignalingEvent::Connected => {
                let reconnect =
                    self.state == ConnectionState::Disconnected && self.transport_active;
                if self.state != ConnectionState::Connecting && !reconnect {
                    tracing::debug!("Ignoring connected event in state {:?}", self.state);
                    return notifications;
                }

                tracing::info!("Transport connected");
                self.state = ConnectionState::Connected;
                self.episode_open = true;
                if let Some(latch) = self.pending_connect.take() {
                    latch.fire(Ok(ConnectionState::Connected));
                }
                notifications.push(Notification::Connected {
                    callbacks: self.callbacks.clone(),
                });
            }

            SignalingEvent::Disconnected {
                error,
                code,
                reason,
            } => match self.state {
                ConnectionState::Disconnected => {
                    tracing::debug!("Ignoring disconnected event, already disconnected");
                }
                ConnectionState::Connecting => {
                    // Engine versucht es weiter, bis der Timer greift
                    tracing::debug!("Connection attempt failed: {:?} {:?}", code, reason);
                }
                _ => {
                    tracing::info!("Transport disconnected: {:?} {:?}", code, reason);
                    self.state = ConnectionState::Disconnected;
                    self.fail_pending(ConnectionError::Superseded);

                    if self.episode_open {
                        self.episode_open = false;
                        notifications.push(Notification::Disconnected {
                            callbacks: self.callbacks.clone(),
                            error: *error,
                            code: *code,
                            reason: reason.clone(),
                        });
                    }
                }
            },

            SignalingEvent::Registered => match self.state {
                ConnectionState::Registering => {
                    tracing::info!("Registered");
                    self.state = ConnectionState::Registered;
                    if let Some(latch) = self.pending_register.take() {
                        latch.fire(Ok(ConnectionState::Registered));
                    }
                    notifications.push(Notification::Registered);
                }
                ConnectionState::Registered => tracing::debug!("Registration refreshed"),
                other => tracing::debug!("Ignoring registered event in state {:?}", other),
            },

            SignalingEvent::Unregistered => {
                if self.state == ConnectionState::Registered {
                    tracing::info!("Unregistered");
                    self.state = ConnectionState::Connected;
                }
            }

            SignalingEvent::RegistrationFailed { cause } => match self.state {
                ConnectionState::Registering => {
                    tracing::warn!("Registration failed: {}", cause);
                    self.state = ConnectionState::Connected;
                    if let Some(latch) = self.pending_register.take() {
                        latch.fire(Err(ConnectionError::RegistrationFailed(cause.clone())));
                    }
                    notifications.push(Notification::RegistrationFailed {
                        cause: cause.clone(),
                    });
                }
                ConnectionState::Registered => {
                    tracing::warn!("Registration refresh failed: {}", cause);
                    self.state = ConnectionState::Connected;
                    notifications.push(Notification::RegistrationFailed {
                        cause: cause.clone(),
                    });
                }
                other => tracing::debug!("Ignoring registration failure in state {:?}", other),
            },

            _ => {}
        }

        notifications
    }

    fn fail_pending(&mut self, error: ConnectionError) {
        if let Some(latch) = self.pending_connect.take() {
            latch.fire(Err(error.clone()));
        }
        if let Some(latch) = self.pending_register.take() {
            latch.fire(Err(error));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineOp, MockEngine};

    fn urls() -> Result<Vec<Url>, ConfigError> {
        Ok(vec![Url::parse("wss://gw.example.com").unwrap()])
    }

    fn credentials() -> Credentials {
        Credentials::new("1000", "secret")
    }

    fn pending(begin: Begin) -> (u64, oneshot::Receiver<ConnectionResult>) {
        match begin {
            Begin::Pending { ticket, rx } => (ticket, rx),
            Begin::Ready(state) => panic!("expected pending, got {:?}", state),
        }
    }

    fn connected(manager: &mut ConnectionManager, engine: &MockEngine) {
        let begin = manager
            .begin_connect(urls(), &credentials(), ConnectOptions::default(), engine)
            .unwrap();
        let (_, _rx) = pending(begin);
        manager.handle_event(&SignalingEvent::Connected);
    }

    #[test]
    fn test_connect_requires_endpoint() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());

        let result = manager.begin_connect(
            Err(ConfigError::NoEndpoints),
            &credentials(),
            ConnectOptions::default(),
            &engine,
        );
        assert!(matches!(
            result,
            Err(ConnectionError::Config(ConfigError::NoEndpoints))
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(engine.ops().is_empty());
    }

    #[test]
    fn test_connected_event_resolves_connect() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());

        let begin = manager
            .begin_connect(urls(), &credentials(), ConnectOptions::default(), &engine)
            .unwrap();
        let (_, mut rx) = pending(begin);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(engine.ops(), vec![EngineOp::CreateTransport(1)]);

        let notifications = manager.handle_event(&SignalingEvent::Connected);
        assert_eq!(notifications.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), Ok(ConnectionState::Connected));
        assert_eq!(manager.identity(), "1000");
    }

    #[test]
    fn test_connect_when_connected_is_noop() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());
        connected(&mut manager, &engine);

        let begin = manager
            .begin_connect(urls(), &credentials(), ConnectOptions::default(), &engine)
            .unwrap();
        assert!(matches!(begin, Begin::Ready(ConnectionState::Connected)));
        assert_eq!(engine.ops().len(), 1);
    }

    #[test]
    fn test_second_connect_joins_pending_attempt() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());

        let (t1, mut rx1) = pending(
            manager
                .begin_connect(urls(), &credentials(), ConnectOptions::default(), &engine)
                .unwrap(),
        );
        let (t2, mut rx2) = pending(
            manager
                .begin_connect(urls(), &credentials(), ConnectOptions::default(), &engine)
                .unwrap(),
        );
        assert_eq!(t1, t2);
        assert_eq!(engine.ops().len(), 1);

        manager.handle_event(&SignalingEvent::Connected);
        assert!(rx1.try_recv().unwrap().is_ok());
        assert!(rx2.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_connect_timeout_ignores_late_connected() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());

        let (ticket, mut rx) = pending(
            manager
                .begin_connect(urls(), &credentials(), ConnectOptions::default(), &engine)
                .unwrap(),
        );
        manager.expire_connect(ticket, &engine);
        assert_eq!(rx.try_recv().unwrap(), Err(ConnectionError::ConnectionTimeout));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(engine.ops().contains(&EngineOp::Stop));

        let notifications = manager.handle_event(&SignalingEvent::Connected);
        assert!(notifications.is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_expire_after_connected_is_noop() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());

        let (ticket, _rx) = pending(
            manager
                .begin_connect(urls(), &credentials(), ConnectOptions::default(), &engine)
                .unwrap(),
        );
        manager.handle_event(&SignalingEvent::Connected);
        manager.expire_connect(ticket, &engine);

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!engine.ops().contains(&EngineOp::Stop));
    }

    #[test]
    fn test_failed_attempt_while_connecting_keeps_waiting() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());
        let (_, mut rx) = pending(
            manager
                .begin_connect(urls(), &credentials(), ConnectOptions::default(), &engine)
                .unwrap(),
        );

        let notifications = manager.handle_event(&SignalingEvent::Disconnected {
            error: true,
            code: Some(1006),
            reason: None,
        });
        assert!(notifications.is_empty());
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_registration_outcomes() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());
        connected(&mut manager, &engine);

        // Abgelehnt
        let (_, mut rx) = pending(manager.begin_register(&credentials(), 600, &engine).unwrap());
        assert_eq!(manager.state(), ConnectionState::Registering);
        manager.handle_event(&SignalingEvent::RegistrationFailed {
            cause: "Forbidden".to_string(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ConnectionError::RegistrationFailed("Forbidden".to_string()))
        );
        assert_eq!(manager.state(), ConnectionState::Connected);

        // Timeout, späteres registered ändert nichts mehr
        let (ticket, mut rx) =
            pending(manager.begin_register(&credentials(), 600, &engine).unwrap());
        manager.expire_register(ticket);
        assert_eq!(rx.try_recv().unwrap(), Err(ConnectionError::RegistrationTimeout));
        manager.handle_event(&SignalingEvent::Registered);
        assert_eq!(manager.state(), ConnectionState::Connected);

        // Erfolg
        let (ticket, mut rx) =
            pending(manager.begin_register(&credentials(), 600, &engine).unwrap());
        manager.handle_event(&SignalingEvent::Registered);
        manager.expire_register(ticket);
        assert_eq!(rx.try_recv().unwrap(), Ok(ConnectionState::Registered));
        assert_eq!(manager.state(), ConnectionState::Registered);

        let registers = engine
            .ops()
            .into_iter()
            .filter(|op| matches!(op, EngineOp::Register { .. }))
            .count();
        assert_eq!(registers, 3);
    }

    #[test]
    fn test_transport_drop_notifies_once() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());
        connected(&mut manager, &engine);

        let drop_event = SignalingEvent::Disconnected {
            error: true,
            code: Some(1006),
            reason: Some("abnormal".to_string()),
        };
        assert_eq!(manager.handle_event(&drop_event).len(), 1);
        assert!(manager.handle_event(&drop_event).is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());
        connected(&mut manager, &engine);
        let (_, _rx) = pending(manager.begin_register(&credentials(), 600, &engine).unwrap());
        manager.handle_event(&SignalingEvent::Registered);

        assert_eq!(manager.disconnect(&engine).len(), 1);
        assert!(manager.disconnect(&engine).is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let ops = engine.ops();
        assert!(ops.contains(&EngineOp::Unregister));
        assert_eq!(ops.iter().filter(|op| **op == EngineOp::Stop).count(), 1);

        // Das Transport-Event nach dem lokalen Trennen meldet nichts mehr
        let notifications = manager.handle_event(&SignalingEvent::Disconnected {
            error: false,
            code: None,
            reason: None,
        });
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_disconnect_supersedes_pending_connect() {
        let engine = MockEngine::new();
        let mut manager = ConnectionManager::new(Callbacks::new());
        let (_, mut rx) = pending(
            manager
                .begin_connect(urls(), &credentials(), ConnectOptions::default(), &engine)
                .unwrap(),
        );

        assert!(manager.disconnect(&engine).is_empty());
        assert_eq!(rx.try_recv().unwrap(), Err(ConnectionError::Superseded));
    }
}
