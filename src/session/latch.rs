//! Single-Fire Latch für asynchrone Vorgänge mit Timeout
//!
//! Verbindungsaufbau, Registrierung und Transfer haben genau ein Ergebnis:
//! Erfolg, Fehler oder Timeout. Der Latch wird im Core-State gehalten und
//! beim Auslösen per `Option::take` entnommen, kann also nur einmal feuern.
//! Der Timer ruft `expire` auf, das den Latch nur dann mit dem Timeout-Fehler
//! auslöst, wenn ihn noch kein Event ausgelöst hat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Wartende Operation, identifiziert über ein Ticket
#[derive(Debug)]
pub(crate) struct Latch<T> {
    ticket: u64,
    waiters: Vec<oneshot::Sender<T>>,
}

impl<T: Clone> Latch<T> {
    pub(crate) fn new() -> Self {
        Self {
            ticket: NEXT_TICKET.fetch_add(1, Ordering::Relaxed),
            waiters: Vec::new(),
        }
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Hängt einen weiteren Wartenden an dieselbe Operation
    pub(crate) fn join(&mut self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    pub(crate) fn fire(self, value: T) {
        for waiter in self.waiters {
            let _ = waiter.send(value.clone());
        }
    }
}

/// Wartet auf den Latch, höchstens `timeout` lang
///
/// Läuft der Timer ab, wird `expire` aufgerufen und danach der Latch erneut
/// gelesen: hat ein Event knapp vorher gefeuert, gewinnt dessen Ergebnis.
/// `None` bedeutet, der Latch wurde ohne Ergebnis verworfen.
pub(crate) async fn await_latch<T, F>(
    mut rx: oneshot::Receiver<T>,
    timeout: Duration,
    expire: F,
) -> Option<T>
where
    F: FnOnce(),
{
    tokio::select! {
        result = &mut rx => return result.ok(),
        _ = tokio::time::sleep(timeout) => {}
    }

    expire();
    rx.try_recv().ok()
}

// ============================================================================
// TESTS
// ============================================================================
