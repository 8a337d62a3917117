//! Delegate Router - Callbacks und Event-Broadcast
//!
//! Jede Zustandsänderung im Core wird als `Notification` gesammelt und erst
//! nach dem Freigeben des Core-Locks ausgeliefert. Callbacks dürfen daher
//! wieder in den Client aufrufen. Ein panischer Callback wird gefangen und
//! geloggt, der Core läuft weiter.

use super::dialog::{CallId, CallInfo};
use crate::client::CallActions;
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// CALLBACKS
// ============================================================================

pub type ConnectFn = Arc<dyn Fn() + Send + Sync>;
pub type DisconnectFn = Arc<dyn Fn(bool, Option<u16>, Option<String>) + Send + Sync>;
pub type CallCreatedFn = Arc<dyn Fn(CallActions, &CallInfo) + Send + Sync>;
pub type CallConnectedFn = Arc<dyn Fn() + Send + Sync>;
pub type CallTerminatedFn = Arc<dyn Fn(Option<u16>, &str) + Send + Sync>;

/// Callback-Set, alle Einträge optional
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_connect: Option<ConnectFn>,
    pub on_disconnect: Option<DisconnectFn>,
    pub call_created: Option<CallCreatedFn>,
    pub call_connected: Option<CallConnectedFn>,
    pub call_terminated: Option<CallTerminatedFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(
        mut self,
        f: impl Fn(bool, Option<u16>, Option<String>) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    pub fn call_created(mut self, f: impl Fn(CallActions, &CallInfo) + Send + Sync + 'static) -> Self {
        self.call_created = Some(Arc::new(f));
        self
    }

    pub fn call_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.call_connected = Some(Arc::new(f));
        self
    }

    pub fn call_terminated(mut self, f: impl Fn(Option<u16>, &str) + Send + Sync + 'static) -> Self {
        self.call_terminated = Some(Arc::new(f));
        self
    }

    /// Legt `overrides` über dieses Set
    ///
    /// Pro Event gewinnt der später gesetzte Callback, es feuert nie beides.
    pub fn merged_with(&self, overrides: &Callbacks) -> Callbacks {
        Callbacks {
            on_connect: overrides.on_connect.clone().or_else(|| self.on_connect.clone()),
            on_disconnect: overrides
                .on_disconnect
                .clone()
                .or_else(|| self.on_disconnect.clone()),
            call_created: overrides
                .call_created
                .clone()
                .or_else(|| self.call_created.clone()),
            call_connected: overrides
                .call_connected
                .clone()
                .or_else(|| self.call_connected.clone()),
            call_terminated: overrides
                .call_terminated
                .clone()
                .or_else(|| self.call_terminated.clone()),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("call_created", &self.call_created.is_some())
            .field("call_connected", &self.call_connected.is_some())
            .field("call_terminated", &self.call_terminated.is_some())
            .finish()
    }
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Events die vom SessionClient ausgelöst werden
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected,
    Disconnected {
        error: bool,
        code: Option<u16>,
        reason: Option<String>,
    },
    Registered,
    RegistrationFailed {
        cause: String,
    },
    CallCreated(CallInfo),
    CallConnected {
        call_id: CallId,
    },
    CallProgress {
        call_id: CallId,
        code: Option<u16>,
    },
    CallTerminated {
        call_id: CallId,
        code: Option<u16>,
        cause: String,
    },
}

/// Vom Core erzeugte, noch nicht ausgelieferte Benachrichtigung
pub(crate) enum Notification {
    Connected {
        callbacks: Callbacks,
    },
    Disconnected {
        callbacks: Callbacks,
        error: bool,
        code: Option<u16>,
        reason: Option<String>,
    },
    Registered,
    RegistrationFailed {
        cause: String,
    },
    CallCreated {
        callbacks: Callbacks,
        info: CallInfo,
    },
    CallConnected {
        callbacks: Callbacks,
        call_id: CallId,
    },
    CallProgress {
        call_id: CallId,
        code: Option<u16>,
    },
    CallTerminated {
        callbacks: Callbacks,
        call_id: CallId,
        code: Option<u16>,
        cause: String,
    },
}

// ============================================================================
// DELEGATE ROUTER
// ============================================================================

pub(crate) struct DelegateRouter {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl DelegateRouter {
    pub(crate) fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self { event_tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Liefert Benachrichtigungen an Callbacks und Broadcast-Kanal aus
    pub(crate) fn deliver<A>(&self, notifications: Vec<Notification>, actions_for: A)
    where
        A: Fn(&CallId) -> CallActions,
    {
        for notification in notifications {
            match notification {
                Notification::Connected { callbacks } => {
                    if let Some(cb) = callbacks.on_connect {
                        guarded("on_connect", || cb());
                    }
                    self.broadcast(SessionEvent::Connected);
                }
                Notification::Disconnected {
                    callbacks,
                    error,
                    code,
                    reason,
                } => {
                    if let Some(cb) = callbacks.on_disconnect {
                        let r = reason.clone();
                        guarded("on_disconnect", || cb(error, code, r));
                    }
                    self.broadcast(SessionEvent::Disconnected {
                        error,
                        code,
                        reason,
                    });
                }
                Notification::Registered => self.broadcast(SessionEvent::Registered),
                Notification::RegistrationFailed { cause } => {
                    self.broadcast(SessionEvent::RegistrationFailed { cause })
                }
                Notification::CallCreated { callbacks, info } => {
                    if let Some(cb) = callbacks.call_created {
                        let actions = actions_for(&info.id);
                        guarded("call_created", || cb(actions, &info));
                    }
                    self.broadcast(SessionEvent::CallCreated(info));
                }
                Notification::CallConnected { callbacks, call_id } => {
                    if let Some(cb) = callbacks.call_connected {
                        guarded("call_connected", || cb());
                    }
                    self.broadcast(SessionEvent::CallConnected { call_id });
                }
                Notification::CallProgress { call_id, code } => {
                    self.broadcast(SessionEvent::CallProgress { call_id, code });
                }
                Notification::CallTerminated {
                    callbacks,
                    call_id,
                    code,
                    cause,
                } => {
                    if let Some(cb) = callbacks.call_terminated {
                        guarded("call_terminated", || cb(code, &cause));
                    }
                    self.broadcast(SessionEvent::CallTerminated {
                        call_id,
                        code,
                        cause,
                    });
                }
            }
        }
    }

    fn broadcast(&self, event: SessionEvent) {
        // Ohne Subscriber schlägt send fehl, das ist kein Fehler
        let _ = self.event_tx.send(event);
    }
}

/// Führt einen Callback aus und schluckt Panics
fn guarded<F: FnOnce()>(name: &str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!("Callback '{}' panicked: {}", name, message);
    }
}

// ============================================================================
// TESTS
// ============================================================================
