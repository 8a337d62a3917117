//! Konfiguration für den Session-Client
//!
//! Die Konfiguration wird einmal beim Start übergeben und danach nicht mehr
//! verändert. Einzige Ausnahme sind die Callbacks, die bei `connect()`
//! ergänzt werden können.
//!
//! Das Laden (Datei, Umgebung, ...) übernimmt die Host-Applikation; `Config`
//! implementiert dafür `Deserialize` mit sinnvollen Defaults.

use crate::session::Callbacks;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Timeout für Verbindungsaufbau und Registrierung
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Timeout bis der Gateway einen Transfer bestätigt
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 10_000;

/// Gültigkeit einer Registrierung in Sekunden
pub const DEFAULT_REGISTER_EXPIRES: u32 = 600;

/// Standard-Aufnahmegerät
pub const DEFAULT_DEVICE: &str = "default";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No gateway endpoint configured")]
    NoEndpoints,

    #[error("Invalid gateway endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Missing identity in credentials")]
    MissingIdentity,
}

// ============================================================================
// CONFIG
// ============================================================================

/// Auswahl des Aufnahmegeräts, wird unverändert an die MediaEngine gereicht
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct DeviceSelector(pub String);

impl Default for DeviceSelector {
    fn default() -> Self {
        Self(DEFAULT_DEVICE.to_string())
    }
}

/// Client-Konfiguration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway-URIs (`wss://...`), in Prioritätsreihenfolge
    pub endpoints: Vec<String>,

    /// Domain bzw. Applikations-Kennung, ergänzt kurze Rufziele
    pub domain: String,

    #[serde(default)]
    pub device: DeviceSelector,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,

    #[serde(default = "default_register_expires")]
    pub register_expires: u32,

    /// Verbindungsweite Callbacks (Defaults für jeden Anruf)
    #[serde(skip)]
    pub callbacks: Callbacks,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_transfer_timeout_ms() -> u64 {
    DEFAULT_TRANSFER_TIMEOUT_MS
}

fn default_register_expires() -> u32 {
    DEFAULT_REGISTER_EXPIRES
}

impl Config {
    /// Erstellt eine Konfiguration mit Default-Timeouts
    pub fn new(endpoints: Vec<String>, domain: impl Into<String>) -> Self {
        Self {
            endpoints,
            domain: domain.into(),
            device: DeviceSelector::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            transfer_timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = DeviceSelector(device.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Prüft und parst die Gateway-Endpoints
    ///
    /// Mindestens ein Endpoint muss vorhanden sein, alle müssen
    /// WebSocket-URLs sein.
    pub fn gateway_urls(&self) -> Result<Vec<Url>, ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        self.endpoints
            .iter()
            .map(|endpoint| {
                let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;
                match url.scheme() {
                    "ws" | "wss" => Ok(url),
                    other => Err(ConfigError::InvalidEndpoint {
                        endpoint: endpoint.clone(),
                        reason: format!("unsupported scheme '{}'", other),
                    }),
                }
            })
            .collect()
    }

    /// Ergänzt ein kurzes Rufziel (`1001`) zu einer vollständigen URI
    pub fn target_uri(&self, destination: &str) -> String {
        if destination.contains(':') || destination.contains('@') {
            destination.to_string()
        } else {
            format!("sip:{}@{}", destination, self.domain)
        }
    }
}

// ============================================================================
// CREDENTIALS
// ============================================================================

/// Zugangsdaten für einen Verbindungsversuch
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Extension bzw. Username
    pub identity: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.trim().is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
