//! Einheitliches Ergebnis-Format für Host-Applikationen
//!
//! Alle öffentlichen Operationen liefern ein `Result`. Wer die Ergebnisse
//! weiterreicht (z.B. als JSON an ein Frontend), kann sie mit
//! `OpResult::from` in die Form `{ success, data?, error? }` bringen.

use serde::Serialize;
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> OpResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

impl<T, E: Display> From<Result<T, E>> for OpResult<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
