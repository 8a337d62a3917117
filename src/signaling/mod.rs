//! Signaling Module - Schnittstelle zur Signaling-Engine
//!
//! Dieses Modul beschreibt die Grenze zur externen Signaling-Engine:
//! - Operationen (Transport, Registrierung, Sessions)
//! - Events, die die Engine auslöst
//! - Header-Rendering für ausgehende Sessions
//!

mod engine;
mod headers;

pub use engine::{
    EndCause, EndRequest, SessionDirection, SessionHeaders, SessionId, SignalingEngine,
    SignalingError, SignalingEvent, SignalingSession,
};
pub use headers::{render_call_headers, CallVariables, CALL_ID_HEADER, MAX_HEADER_LEN};
