//! Test-Doubles für Signaling- und Media-Engine

use crate::client::CallActions;
use crate::config::DeviceSelector;
use crate::media::{LocalMedia, Media, MediaEngine, MediaError, MediaTrack, RemoteMedia, TrackKind};
use crate::session::{CallInfo, Callbacks};
use crate::signaling::{
    EndRequest, SessionDirection, SessionHeaders, SessionId, SignalingEngine, SignalingError,
    SignalingEvent, SignalingSession,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use url::Url;

// ============================================================================
// SIGNALING ENGINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineOp {
    CreateTransport(usize),
    Register { identity: String, expires: u32 },
    Unregister,
    Stop,
    Originate { target: String, headers: Vec<String> },
}

/// Zeichnet Operationen auf, Events schickt der Test selbst
pub(crate) struct MockEngine {
    ops: Mutex<Vec<EngineOp>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    /// Antwortet auf create_transport mit `Connected`
    pub(crate) auto_connect: bool,
    /// Antwortet auf register mit `Registered`
    pub(crate) auto_register: bool,
    pub(crate) fail_originate: bool,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            ops: Mutex::new(Vec::new()),
            event_tx,
            auto_connect: false,
            auto_register: false,
            fail_originate: false,
        }
    }

    /// Engine die Verbindung und Registrierung sofort bestätigt
    pub(crate) fn responsive() -> Self {
        Self {
            auto_connect: true,
            auto_register: true,
            ..Self::new()
        }
    }

    /// Engine die nur den Transport bestätigt
    pub(crate) fn connect_only() -> Self {
        Self {
            auto_connect: true,
            ..Self::new()
        }
    }

    /// Engine die jede ausgehende Session ablehnt
    pub(crate) fn failing() -> Self {
        Self {
            fail_originate: true,
            ..Self::new()
        }
    }

    pub(crate) fn ops(&self) -> Vec<EngineOp> {
        self.ops.lock().clone()
    }

    pub(crate) fn originated(&self) -> Vec<(String, Vec<String>)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                EngineOp::Originate { target, headers } => Some((target, headers)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn emit(&self, event: SignalingEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl SignalingEngine for MockEngine {
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    fn create_transport(&self, endpoints: &[Url]) -> Result<(), SignalingError> {
        self.ops.lock().push(EngineOp::CreateTransport(endpoints.len()));
        if self.auto_connect {
            self.emit(SignalingEvent::Connecting);
            self.emit(SignalingEvent::Connected);
        }
        Ok(())
    }

    fn register(&self, identity: &str, _secret: &str, expires: u32) -> Result<(), SignalingError> {
        self.ops.lock().push(EngineOp::Register {
            identity: identity.to_string(),
            expires,
        });
        if self.auto_register {
            self.emit(SignalingEvent::Registered);
        }
        Ok(())
    }

    fn unregister(&self) -> Result<(), SignalingError> {
        self.ops.lock().push(EngineOp::Unregister);
        Ok(())
    }

    fn stop(&self) {
        self.ops.lock().push(EngineOp::Stop);
    }

    fn originate_session(
        &self,
        target: &str,
        headers: &[String],
        _offer: &LocalMedia,
    ) -> Result<(), SignalingError> {
        if self.fail_originate {
            return Err(SignalingError::NotConnected);
        }
        self.ops.lock().push(EngineOp::Originate {
            target: target.to_string(),
            headers: headers.to_vec(),
        });
        Ok(())
    }
}

// ============================================================================
// SIGNALING SESSION
// ============================================================================

#[derive(Debug)]
pub(crate) struct MockSession {
    id: String,
    remote: String,
    accepted: AtomicUsize,
    ended: Mutex<Vec<EndRequest>>,
    transfers: Mutex<Vec<String>>,
}

impl MockSession {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            remote: "sip:2000@example.com".to_string(),
            accepted: AtomicUsize::new(0),
            ended: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn ended(&self) -> Vec<EndRequest> {
        self.ended.lock().clone()
    }

    pub(crate) fn transfers(&self) -> Vec<String> {
        self.transfers.lock().clone()
    }

    /// `SessionCreated` für diese Session
    pub(crate) fn created(
        self: &Arc<Self>,
        direction: SessionDirection,
        headers: Vec<(String, String)>,
    ) -> SignalingEvent {
        SignalingEvent::SessionCreated {
            session: self.clone(),
            direction,
            headers: SessionHeaders::from(headers),
        }
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.id.clone()
    }
}

impl SignalingSession for MockSession {
    fn id(&self) -> SessionId {
        self.id.clone()
    }

    fn remote_identity(&self) -> String {
        self.remote.clone()
    }

    fn accept(&self, _answer: &LocalMedia) -> Result<(), SignalingError> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn end(&self, request: EndRequest) -> Result<(), SignalingError> {
        self.ended.lock().push(request);
        Ok(())
    }

    fn transfer(&self, target: &str) -> Result<(), SignalingError> {
        self.transfers.lock().push(target.to_string());
        Ok(())
    }
}

// ============================================================================
// MEDIA ENGINE
// ============================================================================

#[derive(Default)]
pub(crate) struct MockMedia {
    attached: AtomicUsize,
    acquired: AtomicUsize,
    released: Mutex<Vec<Media>>,
    /// Die nächste Aufnahme wartet bis der Test das Gate öffnet
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub(crate) deny_capture: bool,
}

impl MockMedia {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Verweigert jede lokale Aufnahme
    pub(crate) fn denying() -> Self {
        Self {
            deny_capture: true,
            ..Self::default()
        }
    }

    /// Aufnahme hängt bis zum Senden auf dem zurückgegebenen Gate
    pub(crate) fn gated() -> (Self, oneshot::Sender<()>) {
        let (open, gate) = oneshot::channel();
        let media = Self {
            gate: Mutex::new(Some(gate)),
            ..Self::default()
        };
        (media, open)
    }

    pub(crate) fn local(&self, id: &str) -> LocalMedia {
        LocalMedia {
            id: id.to_string(),
            tracks: vec![MediaTrack {
                id: format!("{}-audio", id),
                kind: TrackKind::Audio,
            }],
        }
    }

    pub(crate) fn attach_count(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn remote_release_count(&self) -> usize {
        self.released
            .lock()
            .iter()
            .filter(|m| matches!(m, Media::Remote(_)))
            .count()
    }

    pub(crate) fn local_release_count(&self) -> usize {
        self.released
            .lock()
            .iter()
            .filter(|m| matches!(m, Media::Local(_)))
            .count()
    }
}

impl MediaEngine for MockMedia {
    fn acquire_local_capture(
        &self,
        device: &DeviceSelector,
    ) -> BoxFuture<'static, Result<LocalMedia, MediaError>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let result = if self.deny_capture {
            Err(MediaError::PermissionDenied)
        } else {
            Ok(self.local(&device.0))
        };
        let gate = self.gate.lock().take();
        Box::pin(async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            result
        })
    }

    fn attach_remote_tracks(
        &self,
        session: &dyn SignalingSession,
    ) -> Result<RemoteMedia, MediaError> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteMedia {
            session_id: session.id(),
            tracks: vec![MediaTrack {
                id: format!("{}-remote-audio", session.id()),
                kind: TrackKind::Audio,
            }],
        })
    }

    fn release(&self, media: Media) {
        self.released.lock().push(media);
    }
}

// ============================================================================
// CALLBACK RECORDER
// ============================================================================

/// Zählt Callback-Aufrufe
#[derive(Default)]
pub(crate) struct Recorder {
    pub(crate) connects: AtomicUsize,
    pub(crate) disconnects: AtomicUsize,
    pub(crate) created: Mutex<Vec<CallInfo>>,
    pub(crate) connected: AtomicUsize,
    pub(crate) terminated: Mutex<Vec<(Option<u16>, String)>>,
    pub(crate) actions: Mutex<Vec<CallActions>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn callbacks(self: &Arc<Self>) -> Callbacks {
        let connects = Arc::clone(self);
        let disconnects = Arc::clone(self);
        let created = Arc::clone(self);
        let connected = Arc::clone(self);
        let terminated = Arc::clone(self);

        Callbacks::new()
            .on_connect(move || {
                connects.connects.fetch_add(1, Ordering::SeqCst);
            })
            .on_disconnect(move |_, _, _| {
                disconnects.disconnects.fetch_add(1, Ordering::SeqCst);
            })
            .call_created(move |actions, info| {
                created.created.lock().push(info.clone());
                created.actions.lock().push(actions);
            })
            .call_connected(move || {
                connected.connected.fetch_add(1, Ordering::SeqCst);
            })
            .call_terminated(move |code, cause| {
                terminated.terminated.lock().push((code, cause.to_string()));
            })
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn terminated(&self) -> Vec<(Option<u16>, String)> {
        self.terminated.lock().clone()
    }

    pub(crate) fn created(&self) -> Vec<CallInfo> {
        self.created.lock().clone()
    }

    pub(crate) fn actions(&self) -> Vec<CallActions> {
        self.actions.lock().clone()
    }
}
