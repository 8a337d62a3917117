//! Header für ausgehende Sessions
//!
//! Jede ausgehende Session trägt die Call-ID als `X-Call-ID`, damit der Anruf
//! auch auf Gateway-Seite korreliert werden kann. Zusätzliche Variablen werden
//! als `X-<key>: <value>` gerendert.

use std::collections::BTreeMap;

/// Header mit der global eindeutigen Call-ID
pub const CALL_ID_HEADER: &str = "X-Call-ID";

/// Längere Header werden trotzdem gesendet, aber geloggt
pub const MAX_HEADER_LEN: usize = 50;

/// Benutzerdefinierte Variablen eines Anrufs
pub type CallVariables = BTreeMap<String, serde_json::Value>;

/// Rendert Call-ID und Variablen zu Header-Zeilen
pub fn render_call_headers(call_id: &str, variables: &CallVariables) -> Vec<String> {
    let mut headers = Vec::with_capacity(variables.len() + 1);
    headers.push(format!("{}: {}", CALL_ID_HEADER, call_id));

    for (key, value) in variables {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let header = format!("X-{}: {}", key, value);

        if header.len() > MAX_HEADER_LEN {
            tracing::warn!(
                "Header '{}' is {} chars long (limit {}), sending anyway",
                key,
                header.len(),
                MAX_HEADER_LEN
            );
        }

        headers.push(header);
    }

    headers
}

// ============================================================================
// TESTS
// ============================================================================
