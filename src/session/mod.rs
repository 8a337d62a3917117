//! Session Module - Verbindung, Registrierung und Anrufe
//!
//! Dieses Modul enthält die Zustandsmaschinen des Clients:
//! - ConnectionManager (Transport + Registrierung mit Timeouts)
//! - CallSessionController (genau ein aktiver Anruf)
//! - Dialog (Zustand eines Anrufs und seine Aktionen)
//! - DelegateRouter (Callbacks und Event-Broadcast)

mod connection;
mod controller;
mod delegate;
mod dialog;
pub(crate) mod latch;

pub use connection::{ConnectOptions, ConnectionError, ConnectionState};
pub use controller::CallOptions;
pub use delegate::{
    CallConnectedFn, CallCreatedFn, CallTerminatedFn, Callbacks, ConnectFn, DisconnectFn,
    SessionEvent,
};
pub use dialog::{CallDirection, CallError, CallId, CallInfo, DialogStatus};

pub(crate) use connection::{Begin, ConnectionManager};
pub(crate) use controller::CallSessionController;
pub(crate) use delegate::{DelegateRouter, Notification};
