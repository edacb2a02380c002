//! Live WebSocket sessions, keyed by the core's `ConnectionId`.
//!
//! Each session owns a bounded outbound queue drained by its socket loop;
//! everything else (replies, provider requests, gateway results) reaches the
//! socket through a `ConnectionHandle`. A slow peer therefore applies
//! backpressure to whoever is writing to it and never to the broker lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capbroker_core::ConnectionId;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

/// Frame queued for a session's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Encoded JSON-RPC text.
    Text(String),
    /// Close the socket, optionally with a reason.
    Close(Option<String>),
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("send timed out")]
    Timeout,
    #[error("connection closed")]
    Disconnected,
    #[error("outbound channel full")]
    Full,
}

/// Write side of one session.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    outbound: mpsc::Sender<OutboundMessage>,
    opened: Instant,
}

impl ConnectionHandle {
    /// Queues `msg` if there is room right now.
    ///
    /// # Errors
    ///
    /// `Full` when the queue is at capacity, `Disconnected` once the socket
    /// loop has gone away.
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        self.outbound.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Queues `msg`, waiting at most `timeout` for room.
    ///
    /// # Errors
    ///
    /// `Timeout` when the queue stayed full, `Disconnected` once the socket
    /// loop has gone away.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        tokio::time::timeout(timeout, self.outbound.send(msg))
            .await
            .map_err(|_| SendError::Timeout)?
            .map_err(|_| SendError::Disconnected)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Time since the session was registered.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }
}

/// Every open session, shared by the socket loops and the gateway.
#[derive(Debug)]
pub struct ConnectionRegistry {
    sessions: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU32,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Opens a session and returns its handle with the receiver the socket
    /// loop drains.
    pub fn register(
        &self,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (outbound, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Arc::new(ConnectionHandle {
            id: self.allocate_id(),
            outbound,
            opened: Instant::now(),
        });
        self.sessions.insert(handle.id, Arc::clone(&handle));
        (handle, rx)
    }

    // 0 never names a session. After wrap-around, ids still held by a live
    // session are skipped so the engine's per-connection indexes stay exact.
    fn allocate_id(&self) -> ConnectionId {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            if raw != 0 && !self.sessions.contains_key(&ConnectionId(raw)) {
                return ConnectionId(raw);
            }
        }
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.sessions.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Takes every session out of the registry, for shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight() -> ConnectionConfig {
        ConnectionConfig {
            outbound_channel_capacity: 2,
            ..ConnectionConfig::default()
        }
    }

    fn frame(s: &str) -> OutboundMessage {
        OutboundMessage::Text(s.to_string())
    }

    #[test]
    fn sessions_are_numbered_from_one() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = registry.register(&ConnectionConfig::default());
        let (second, _rx2) = registry.register(&ConnectionConfig::default());

        assert_eq!(first.id, ConnectionId(1));
        assert_eq!(second.id, ConnectionId(2));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn wrapped_counter_skips_zero_and_live_sessions() {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig::default();
        let (_live, _rx) = registry.register(&config);

        registry.next_id.store(u32::MAX, Ordering::Relaxed);
        let (last, _rx_last) = registry.register(&config);
        assert_eq!(last.id, ConnectionId(u32::MAX));

        let (wrapped, _rx_wrapped) = registry.register(&config);
        assert_eq!(wrapped.id, ConnectionId(2));
    }

    #[test]
    fn removed_sessions_are_gone() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(&ConnectionConfig::default());

        assert!(registry.get(handle.id).is_some());
        assert!(registry.remove(handle.id).is_some());
        assert!(registry.remove(handle.id).is_none());
        assert!(registry.get(handle.id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn drain_takes_every_session() {
        let registry = ConnectionRegistry::new();
        let (_a, _rx_a) = registry.register(&ConnectionConfig::default());
        let (_b, _rx_b) = registry.register(&ConnectionConfig::default());

        let mut ids: Vec<_> = registry.drain_all().iter().map(|h| h.id.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn try_send_distinguishes_full_from_closed() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(&tight());

        assert_eq!(handle.try_send(frame("a")), Ok(()));
        assert_eq!(handle.try_send(frame("b")), Ok(()));
        assert_eq!(handle.try_send(frame("c")), Err(SendError::Full));

        drop(rx);
        assert!(!handle.is_connected());
        assert_eq!(handle.try_send(frame("d")), Err(SendError::Disconnected));
    }

    #[tokio::test]
    async fn send_waits_for_room_then_gives_up() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = registry.register(&tight());
        handle.try_send(frame("a")).unwrap();
        handle.try_send(frame("b")).unwrap();

        assert_eq!(
            handle.send_timeout(frame("c"), Duration::from_millis(20)).await,
            Err(SendError::Timeout)
        );

        assert_eq!(rx.recv().await, Some(frame("a")));
        assert_eq!(
            handle.send_timeout(frame("c"), Duration::from_millis(20)).await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn send_to_closed_session_fails_fast() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(&ConnectionConfig::default());
        drop(rx);

        assert_eq!(
            handle.send_timeout(frame("a"), Duration::from_secs(5)).await,
            Err(SendError::Disconnected)
        );
    }
}
