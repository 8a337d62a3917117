//! Session Client - öffentliche Schnittstelle
//!
//! Der Client besitzt den Core (ConnectionManager + CallSessionController)
//! hinter einem Mutex. Events der Signaling-Engine kommen über einen
//! Broadcast-Kanal und werden von einem eigenen Task in den Core gepumpt.
//! Benachrichtigungen werden unter dem Lock gesammelt und danach
//! ausgeliefert. Die Auslieferung ist über einen eigenen, reentranten Lock
//! serialisiert, der vor dem Core-Lock genommen wird: Callbacks und
//! Broadcast-Events kommen in derselben Reihenfolge an, in der der Core
//! sie erzeugt hat, auch wenn Pumpe und API auf verschiedenen Threads laufen.

use crate::config::{Config, Credentials};
use crate::media::MediaEngine;
use crate::session::latch;
use crate::session::{
    Begin, CallError, CallId, CallInfo, CallOptions, CallSessionController, ConnectOptions,
    ConnectionError, ConnectionManager, ConnectionState, DelegateRouter, DialogStatus,
    Notification, SessionEvent,
};
use crate::signaling::{SignalingEngine, SignalingEvent};
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// CORE
// ============================================================================

/// Veränderlicher Zustand, nur unter dem Lock zugänglich
struct Core {
    connection: ConnectionManager,
    calls: CallSessionController,
}

impl Core {
    fn handle_event(&mut self, event: SignalingEvent, media: &dyn MediaEngine) -> Vec<Notification> {
        match event {
            SignalingEvent::Connecting
            | SignalingEvent::Connected
            | SignalingEvent::Disconnected { .. }
            | SignalingEvent::Registered
            | SignalingEvent::Unregistered
            | SignalingEvent::RegistrationFailed { .. } => self.connection.handle_event(&event),
            session_event => self.calls.handle_event(
                session_event,
                self.connection.identity(),
                self.connection.callbacks(),
                media,
            ),
        }
    }
}

struct Shared {
    config: Config,
    engine: Arc<dyn SignalingEngine>,
    media: Arc<dyn MediaEngine>,
    core: Mutex<Core>,
    /// Immer vor `core` nehmen. Reentrant, damit Callbacks wieder in den
    /// Client aufrufen dürfen.
    delivery: ReentrantMutex<()>,
    router: DelegateRouter,
}

impl Shared {
    fn handle_event(self: &Arc<Self>, event: SignalingEvent) {
        self.apply(|core| core.handle_event(event, self.media.as_ref()));
    }

    /// Ändert den Core und liefert die entstandenen Benachrichtigungen aus
    ///
    /// Der Delivery-Lock bleibt bis nach der Auslieferung gehalten, der
    /// Core-Lock nur für die Änderung selbst.
    fn apply<F>(self: &Arc<Self>, change: F)
    where
        F: FnOnce(&mut Core) -> Vec<Notification>,
    {
        let _ordered = self.delivery.lock();
        let notifications = {
            let mut core = self.core.lock();
            change(&mut core)
        };

        if notifications.is_empty() {
            return;
        }
        self.router.deliver(notifications, |call_id| {
            CallActions::new(call_id.clone(), Arc::downgrade(self))
        });
    }
}

/// Pumpt Engine-Events in den Core bis der Client freigegeben wird
async fn pump_events(shared: Weak<Shared>, mut rx: broadcast::Receiver<SignalingEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle_event(event);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::error!(
                    "Event pump lagged, {} signaling events lost (call state may be stale)",
                    n
                );
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("Signaling engine closed its event channel");
                break;
            }
        }
    }
}

// ============================================================================
// SESSION CLIENT
// ============================================================================

/// Ergebnis von `make_call()`
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub id: CallId,
    pub actions: CallActions,
}

pub struct SessionClient {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl SessionClient {
    /// Erstellt den Client und startet die Event-Pumpe
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn start(
        config: Config,
        engine: Arc<dyn SignalingEngine>,
        media: Arc<dyn MediaEngine>,
    ) -> Self {
        let rx = engine.subscribe();
        let core = Core {
            connection: ConnectionManager::new(config.callbacks.clone()),
            calls: CallSessionController::new(),
        };

        let shared = Arc::new(Shared {
            config,
            engine,
            media,
            core: Mutex::new(core),
            delivery: ReentrantMutex::new(()),
            router: DelegateRouter::new(),
        });
        let pump = tokio::spawn(pump_events(Arc::downgrade(&shared), rx));

        tracing::info!("Session client started");
        Self { shared, pump }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.router.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().connection.state()
    }

    /// Der aktuell laufende Anruf, falls vorhanden
    pub fn active_call(&self) -> Option<CallInfo> {
        let core = self.shared.core.lock();
        core.calls
            .dialog()
            .filter(|d| !d.is_terminated())
            .map(|d| d.info().clone())
    }

    pub fn call_status(&self, call_id: &str) -> Option<DialogStatus> {
        self.shared.core.lock().calls.status(call_id)
    }

    /// Baut den Transport auf
    ///
    /// Wartet auf `connected` oder den Timeout, je nachdem was zuerst kommt.
    /// Ist bereits eine Verbindung da, wird sofort der Status geliefert.
    pub async fn connect(
        &self,
        credentials: Credentials,
        options: ConnectOptions,
    ) -> Result<ConnectionState, ConnectionError> {
        let shared = &self.shared;
        let begin = {
            let mut core = shared.core.lock();
            core.connection.begin_connect(
                shared.config.gateway_urls(),
                &credentials,
                options,
                shared.engine.as_ref(),
            )?
        };

        match begin {
            Begin::Ready(state) => Ok(state),
            Begin::Pending { ticket, rx } => {
                let expire = {
                    let shared = Arc::clone(shared);
                    move || {
                        let engine = shared.engine.as_ref();
                        shared.core.lock().connection.expire_connect(ticket, engine);
                    }
                };
                latch::await_latch(rx, shared.config.connect_timeout(), expire)
                    .await
                    .unwrap_or(Err(ConnectionError::Superseded))
            }
        }
    }

    /// Verbindet falls nötig und registriert die Identität
    pub async fn login(&self, credentials: Credentials) -> Result<ConnectionState, ConnectionError> {
        if !self.state().is_connected() {
            self.connect(credentials.clone(), ConnectOptions::default())
                .await?;
        }

        let shared = &self.shared;
        let begin = {
            let mut core = shared.core.lock();
            core.connection.begin_register(
                &credentials,
                shared.config.register_expires,
                shared.engine.as_ref(),
            )?
        };

        match begin {
            Begin::Ready(state) => Ok(state),
            Begin::Pending { ticket, rx } => {
                let expire = {
                    let shared = Arc::clone(shared);
                    move || {
                        shared.core.lock().connection.expire_register(ticket);
                    }
                };
                latch::await_latch(rx, shared.config.connect_timeout(), expire)
                    .await
                    .unwrap_or(Err(ConnectionError::Superseded))
            }
        }
    }

    /// Beendet einen laufenden Anruf, meldet ab und stoppt den Transport
    ///
    /// Mehrfaches Aufrufen ist harmlos.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        shared.apply(|core| {
            let mut notifications = core.calls.abort("Disconnected", shared.media.as_ref());
            notifications.extend(core.connection.disconnect(shared.engine.as_ref()));
            notifications
        });
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Der Slot wird vor dem Anfordern der lokalen Aufnahme reserviert, ein
    /// zweiter Aufruf bekommt daher sofort `CallInProgress`.
    pub async fn make_call(
        &self,
        destination: &str,
        options: CallOptions,
    ) -> Result<CallHandle, CallError> {
        let shared = &self.shared;
        let call_id = {
            let mut core = shared.core.lock();
            let state = core.connection.state();
            let callbacks = core.connection.callbacks().merged_with(&options.callbacks);
            core.calls
                .reserve(state, shared.config.target_uri(destination), callbacks)?
        };

        let local = shared
            .media
            .acquire_local_capture(&shared.config.device)
            .await;

        {
            let mut core = shared.core.lock();
            core.calls.originate(
                &call_id,
                local,
                &options.variables,
                shared.engine.as_ref(),
                shared.media.as_ref(),
            )?;
        }

        Ok(CallHandle {
            actions: CallActions::new(call_id.clone(), Arc::downgrade(shared)),
            id: call_id,
        })
    }

    #[cfg(test)]
    fn inject(&self, event: SignalingEvent) {
        self.shared.handle_event(event);
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &self.state())
            .field("endpoints", &self.shared.config.endpoints)
            .finish()
    }
}

// ============================================================================
// CALL ACTIONS
// ============================================================================

/// Aktionen für genau einen Anruf
///
/// Hält den Client nur schwach. Nach dem Freigeben des Clients sind alle
/// Aktionen wirkungslos.
#[derive(Clone)]
pub struct CallActions {
    call_id: CallId,
    shared: Weak<Shared>,
}

impl CallActions {
    fn new(call_id: CallId, shared: Weak<Shared>) -> Self {
        Self { call_id, shared }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Beendet den Anruf (reject, cancel oder bye je nach Status)
    pub fn terminate(&self, reason: Option<String>) -> Result<(), CallError> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let result = shared.core.lock().calls.terminate(&self.call_id, reason);
        result
    }

    /// Nimmt einen eingehenden Anruf an
    ///
    /// Ohne Wirkung wenn der Anruf nicht mehr klingelt oder bereits
    /// angenommen wird.
    pub async fn answer(&self) -> Result<(), CallError> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };

        if !shared.core.lock().calls.begin_answer(&self.call_id) {
            tracing::debug!("Call {} not answerable, ignoring", self.call_id);
            return Ok(());
        }

        let local = shared
            .media
            .acquire_local_capture(&shared.config.device)
            .await;

        let result = shared
            .core
            .lock()
            .calls
            .complete_answer(&self.call_id, local, shared.media.as_ref());
        result
    }

    /// Leitet den verbundenen Anruf weiter
    ///
    /// Wartet auf die Bestätigung der Gegenseite, höchstens so lange wie der
    /// konfigurierte Transfer-Timeout.
    pub async fn transfer(&self, target: &str) -> Result<(), CallError> {
        let Some(shared) = self.shared.upgrade() else {
            return Err(CallError::InvalidState);
        };

        let target = shared.config.target_uri(target);
        let (ticket, rx) = shared.core.lock().calls.begin_transfer(&self.call_id, &target)?;

        let expire = {
            let shared = Arc::clone(&shared);
            let call_id = self.call_id.clone();
            move || {
                shared.core.lock().calls.expire_transfer(&call_id, ticket);
            }
        };
        latch::await_latch(rx, shared.config.transfer_timeout(), expire)
            .await
            .unwrap_or_else(|| Err(CallError::TransferFailed("call ended".to_string())))
    }

    /// Aktionen ohne Client, für Tests des Routers
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(String::new(), Weak::new())
    }
}

impl fmt::Debug for CallActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallActions")
            .field("call_id", &self.call_id)
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
