//! STOMP protocol engines: the client-role and server-role state
//! machines that drive a single connection's handshake, heartbeats, and
//! queue-coupled I/O.
//!
//! Generalizes the teacher crate's `communication::Node` connect/accept
//! tasks (`tx_side_connect_task`/`rx_side_accept_task`) from a one-shot
//! handshake into full per-connection state machines with a writer
//! task and a heartbeat watchdog, per `spec.md` §4.3/§4.4.

pub mod client;
pub mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::ProtocolError;

pub const DEFAULT_MAX_NETWORK_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// An item placed on a protocol engine's send-queue: either an
/// application payload to frame and write, a terminal error to surface
/// as a STOMP `ERROR`, or a request for a graceful close.
pub enum WriteItem<T> {
    Item(T),
    Error(crate::error::ServerError),
    Close,
}

/// Parse the `(sx, sy)` pair out of a `heart-beat` header value, e.g.
/// `"1000,90"`.
pub fn parse_heart_beat(value: &str) -> Result<(u64, u64), ProtocolError> {
    let (sx, sy) = value
        .split_once(',')
        .ok_or_else(|| ProtocolError::BadHeartBeat(value.to_owned()))?;
    let sx: u64 = sx.trim().parse().map_err(|_| ProtocolError::BadHeartBeat(value.to_owned()))?;
    let sy: u64 = sy.trim().parse().map_err(|_| ProtocolError::BadHeartBeat(value.to_owned()))?;
    Ok((sx, sy))
}

/// Negotiate one direction of the heartbeat interval: `0` if either
/// side has disabled it, else the slower (larger) of the two requested
/// periods.
pub fn negotiate(own: u64, peer: u64) -> u64 {
    if own == 0 || peer == 0 {
        0
    } else {
        own.max(peer)
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
}

/// A cooperative read-side pause/resume gate: the reader loop awaits
/// `wait_if_paused` before every read, and the watermark-owning queue
/// consumer calls `pause`/`resume` as it crosses thresholds.
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Self {
        PauseGate {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait_if_paused(&self) {
        loop {
            // Register as a waiter (`enable`) before checking `paused`,
            // not after: `notify_waiters` only wakes tasks already
            // registered, so a `resume()` landing between the check and
            // the `.await` would otherwise be lost forever.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.paused.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heart_beat_parses() {
        assert_eq!(parse_heart_beat("1000,90").unwrap(), (1000, 90));
    }

    #[test]
    fn heart_beat_rejects_malformed() {
        assert!(parse_heart_beat("1000").is_err());
        assert!(parse_heart_beat("x,90").is_err());
    }

    #[test]
    fn negotiate_disables_when_either_side_is_zero() {
        assert_eq!(negotiate(0, 500), 0);
        assert_eq!(negotiate(500, 0), 0);
        assert_eq!(negotiate(1000, 90), 1000);
        assert_eq!(negotiate(90, 1000), 1000);
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let gate = std::sync::Arc::new(PauseGate::new());
        gate.pause();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait_if_paused().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        gate.resume();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should finish once resumed")
            .unwrap();
    }
}
