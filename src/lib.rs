//! Pulse Session - Anrufsteuerung für Web-Softphones
//!
//! Sitzt zwischen der Host-Applikation und zwei externen Engines:
//! - Signaling-Engine (Transport, Registrierung, Sessions)
//! - Media-Engine (lokale Aufnahme, Remote-Tracks)
//!
//! Der Client verwaltet genau einen aktiven Anruf, meldet Zustandsänderungen
//! über Callbacks und einen Broadcast-Kanal und begrenzt Verbindungsaufbau,
//! Registrierung und Transfer mit Timeouts.

pub mod client;
pub mod config;
pub mod media;
pub mod result;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use client::{CallActions, CallHandle, SessionClient};
pub use config::{Config, ConfigError, Credentials, DeviceSelector};
pub use result::OpResult;
pub use session::{
    CallDirection, CallError, CallId, CallInfo, CallOptions, Callbacks, ConnectOptions,
    ConnectionError, ConnectionState, DialogStatus, SessionEvent,
};

/// Initialisiert das Logging
///
/// Ohne `RUST_LOG` wird `pulse_session=debug` verwendet. Ist bereits ein
/// Subscriber gesetzt (z.B. von der Host-Applikation), passiert nichts.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pulse_session=debug"));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
