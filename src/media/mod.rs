//! Media Module - Schnittstelle zur Media-Engine
//!
//! Capture, Codecs und ICE liegen in der externen Engine. Hier werden nur
//! die Handles beschrieben, die ein Dialog hält und wieder freigibt.

mod engine;

pub use engine::{LocalMedia, Media, MediaEngine, MediaError, MediaTrack, RemoteMedia, TrackKind};
