//! Multicast broadcast of intercepted exchanges.
//!
//! The engine reports exchanges through a callback; downstream there are
//! many consumers, each of which must see every exchange exactly once
//! without re-running side effects per subscriber. This module turns the
//! callback into two hot multicast streams: the raw stream (every response
//! the engine observed) and the API stream (the subset that carries game
//! API payloads).
//!
//! Delivery is gated by an explicit connect/disconnect lifecycle: nothing
//! reaches any subscriber before `connect`, and a subscriber that attaches
//! late only sees what is published after it attached. This is a live
//! broadcast, not a replay log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use periscope_core::{is_api_call, Exchange};

/// Per-subscriber buffer size for broadcast channels.
pub const BROADCAST_CAPACITY: usize = 128;

/// Sink receiving every exchange the broadcaster handles while connected.
///
/// Purely diagnostic: implementations must not assume they run before or
/// after subscriber delivery, and a sink can never change what subscribers
/// see.
pub trait DiagnosticSink: Send + Sync {
    /// Records one intercepted exchange.
    fn record(&self, exchange: &Exchange);
}

/// Default sink; logs each exchange at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, exchange: &Exchange) {
        tracing::debug!(
            host = exchange.host(),
            path = exchange.path(),
            content_type = exchange.content_type().unwrap_or("-"),
            "intercepted exchange"
        );
    }
}

/// A multicast publish point with an explicit connect/disconnect lifecycle.
///
/// Wraps a `tokio::sync::broadcast` sender. Publishing is a no-op until
/// `connect` is called; `disconnect` swaps in a fresh sender, so existing
/// receivers drain whatever was already queued and then observe channel
/// closure, while nothing lingers into the next connect cycle.
pub struct BroadcastChannel<T> {
    sender: Mutex<broadcast::Sender<T>>,
    connected: AtomicBool,
    capacity: usize,
}

impl<T: Clone> BroadcastChannel<T> {
    /// Creates a disconnected channel with the given per-subscriber capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Mutex::new(sender),
            connected: AtomicBool::new(false),
            capacity,
        }
    }

    /// Returns true while the channel is delivering events.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Starts delivery. Calling connect on a connected channel has no
    /// additional effect.
    pub fn connect(&self) {
        let _guard = self.sender.lock();
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Stops delivery and releases current subscribers.
    ///
    /// Events already queued with a subscriber remain readable; once a
    /// subscriber drains them it observes the channel as closed. Subscribers
    /// attaching after this call belong to the next connect cycle.
    pub fn disconnect(&self) {
        let mut sender = self.sender.lock();
        if self.connected.swap(false, Ordering::SeqCst) {
            let (fresh, _) = broadcast::channel(self.capacity);
            *sender = fresh;
        }
    }

    /// Attaches a subscriber.
    ///
    /// Subscribing is allowed at any time; events only flow while the
    /// channel is connected, and nothing published earlier is replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.lock().subscribe()
    }

    /// Publishes one event to all current subscribers.
    ///
    /// Returns the number of subscribers reached; 0 while disconnected or
    /// when nobody is listening.
    pub fn publish(&self, value: T) -> usize {
        let sender = self.sender.lock();
        if !self.connected.load(Ordering::SeqCst) {
            return 0;
        }
        sender.send(value).unwrap_or(0)
    }
}

impl<T> std::fmt::Debug for BroadcastChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Fans intercepted exchanges out to the raw and API streams.
pub struct ExchangeBroadcaster {
    all: BroadcastChannel<Exchange>,
    api: BroadcastChannel<Exchange>,
    sink: Arc<dyn DiagnosticSink>,
}

impl ExchangeBroadcaster {
    /// Creates a broadcaster with the default diagnostic sink.
    pub fn new() -> Self {
        Self::with_sink(Arc::new(TracingSink))
    }

    /// Creates a broadcaster with a custom diagnostic sink.
    pub fn with_sink(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            all: BroadcastChannel::new(BROADCAST_CAPACITY),
            api: BroadcastChannel::new(BROADCAST_CAPACITY),
            sink,
        }
    }

    /// Attaches a subscriber to the raw exchange stream.
    pub fn all_exchanges(&self) -> broadcast::Receiver<Exchange> {
        self.all.subscribe()
    }

    /// Attaches a subscriber to the game API stream.
    pub fn api_exchanges(&self) -> broadcast::Receiver<Exchange> {
        self.api.subscribe()
    }

    /// Returns true while the broadcaster is delivering events.
    pub fn is_connected(&self) -> bool {
        self.all.is_connected()
    }

    /// Connects both streams, raw first.
    ///
    /// The API stream is derived from the raw stream; connecting in this
    /// order means no subscriber can observe an API event before the raw
    /// stream is live. Idempotent.
    pub fn connect(&self) {
        self.all.connect();
        self.api.connect();
    }

    /// Disconnects both streams, API first, releasing all subscribers.
    pub fn disconnect(&self) {
        self.api.disconnect();
        self.all.disconnect();
    }

    /// Publishes one observed response to the streams.
    ///
    /// Every exchange goes to the raw stream; those matching the API
    /// predicate also go to the API stream, in the same relative order. The
    /// diagnostic sink sees every exchange handled while connected.
    pub fn publish(&self, exchange: Exchange) {
        if !self.all.is_connected() {
            return;
        }

        self.sink.record(&exchange);

        let api = is_api_call(&exchange);
        self.all.publish(exchange.clone());
        if api {
            self.api.publish(exchange);
        }
    }
}

impl Default for ExchangeBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExchangeBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeBroadcaster")
            .field("all", &self.all)
            .field("api", &self.api)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    use super::*;

    struct CountingSink {
        seen: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                seen: AtomicUsize::new(0),
            }
        }
    }

    impl DiagnosticSink for CountingSink {
        fn record(&self, _exchange: &Exchange) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn raw_exchange(n: u32) -> Exchange {
        Exchange::new(
            "game.example.com",
            format!("http://game.example.com/kcs/resource/{n}"),
            format!("/kcs/resource/{n}"),
        )
    }

    fn api_exchange(n: u32) -> Exchange {
        Exchange::new(
            "game.example.com",
            format!("http://game.example.com/kcsapi/api_{n}"),
            format!("/kcsapi/api_{n}"),
        )
        .with_content_type("text/plain")
    }

    // ==================== BroadcastChannel Tests ====================

    #[tokio::test]
    async fn channel_drops_events_before_connect() {
        let channel = BroadcastChannel::new(8);
        let mut rx = channel.subscribe();

        assert_eq!(channel.publish(1u32), 0);

        channel.connect();
        assert_eq!(channel.publish(2u32), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn channel_connect_is_idempotent() {
        let channel = BroadcastChannel::new(8);
        let mut rx = channel.subscribe();

        channel.connect();
        channel.connect();
        channel.publish(7u32);

        assert_eq!(rx.recv().await.unwrap(), 7);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn channel_queued_events_survive_disconnect() {
        let channel = BroadcastChannel::new(8);
        let mut rx = channel.subscribe();

        channel.connect();
        channel.publish(1u32);
        channel.publish(2u32);
        channel.disconnect();

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn channel_disconnect_releases_subscribers_per_cycle() {
        let channel = BroadcastChannel::new(8);
        channel.connect();
        let mut old_rx = channel.subscribe();
        channel.disconnect();

        // A new cycle must not deliver to subscribers of the old one.
        channel.connect();
        let mut new_rx = channel.subscribe();
        channel.publish(9u32);

        assert!(matches!(old_rx.recv().await, Err(RecvError::Closed)));
        assert_eq!(new_rx.recv().await.unwrap(), 9);
    }

    // ==================== ExchangeBroadcaster Tests ====================

    #[tokio::test]
    async fn broadcaster_raw_sees_all_api_sees_subset() {
        let broadcaster = ExchangeBroadcaster::new();
        let mut all_rx = broadcaster.all_exchanges();
        let mut api_rx = broadcaster.api_exchanges();

        broadcaster.connect();
        broadcaster.publish(raw_exchange(1));
        broadcaster.publish(api_exchange(2));
        broadcaster.publish(raw_exchange(3));

        assert_eq!(all_rx.recv().await.unwrap().path(), "/kcs/resource/1");
        assert_eq!(all_rx.recv().await.unwrap().path(), "/kcsapi/api_2");
        assert_eq!(all_rx.recv().await.unwrap().path(), "/kcs/resource/3");

        assert_eq!(api_rx.recv().await.unwrap().path(), "/kcsapi/api_2");
        assert!(matches!(api_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn broadcaster_late_subscriber_misses_earlier_events() {
        let broadcaster = ExchangeBroadcaster::new();
        broadcaster.connect();

        broadcaster.publish(api_exchange(1));

        let mut late_rx = broadcaster.api_exchanges();
        broadcaster.publish(api_exchange(2));

        assert_eq!(late_rx.recv().await.unwrap().path(), "/kcsapi/api_2");
        assert!(matches!(late_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn broadcaster_sink_sees_every_connected_exchange() {
        let sink = Arc::new(CountingSink::new());
        let broadcaster = ExchangeBroadcaster::with_sink(sink.clone());
        let mut all_rx = broadcaster.all_exchanges();

        // Not connected yet: neither sink nor subscribers see anything.
        broadcaster.publish(raw_exchange(0));
        assert_eq!(sink.seen.load(Ordering::SeqCst), 0);

        broadcaster.connect();
        broadcaster.publish(raw_exchange(1));
        broadcaster.publish(api_exchange(2));

        assert_eq!(sink.seen.load(Ordering::SeqCst), 2);
        assert_eq!(all_rx.recv().await.unwrap().path(), "/kcs/resource/1");
        assert_eq!(all_rx.recv().await.unwrap().path(), "/kcsapi/api_2");
        assert!(matches!(all_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn broadcaster_multiple_subscribers_each_see_every_event() {
        let broadcaster = ExchangeBroadcaster::new();
        let mut rx_a = broadcaster.all_exchanges();
        let mut rx_b = broadcaster.all_exchanges();

        broadcaster.connect();
        broadcaster.publish(raw_exchange(1));

        assert_eq!(rx_a.recv().await.unwrap().path(), "/kcs/resource/1");
        assert_eq!(rx_b.recv().await.unwrap().path(), "/kcs/resource/1");
    }
}
