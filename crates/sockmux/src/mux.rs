//! Topic multiplexer.
//!
//! Maps many logical subscribers onto few wire-level subscriptions over one
//! shared transport connection. The first interest in a (topic, filter) pair
//! sends SUBSCRIBE; later joiners are replayed the cached last value instead
//! of waiting for the next push. Interest is refcounted per wire key and
//! UNSUBSCRIBE is debounced by a grace window, so a consumer briefly dropping
//! and re-adding interest causes no wire churn. Every logical subscription
//! tears itself down when the transport closes and rebuilds itself when it
//! reopens.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::sleep;

use crate::registry::SubscriberRegistry;
use crate::session::{Session, LOGIN_PATH};
use crate::transport::{ConnectionState, Transport, TransportEvent, TransportEvents};
use crate::wire::{normalize_topic, wire_key, Filter, Frame, FrameKind};
use crate::Error;

/// Delay between the subscriber count for a key reaching zero and the
/// UNSUBSCRIBE actually reaching the wire.
const UNSUBSCRIBE_GRACE: Duration = Duration::from_millis(1_000);

/// Callback invoked with the raw payload of each matching inbound frame.
pub type Callback = Box<dyn Fn(Option<&str>) + Send + Sync>;

/// Hook invoked on connection transitions.
pub type TransitionHook = Box<dyn Fn() + Send + Sync>;

/// One logical subscriber attached to the inbound frame stream.
struct Listener {
    topic: String,
    key: String,
    filter: Option<Filter>,
    callback: Callback,
    /// Cleared on transport close, set again once the wire subscription has
    /// been rebuilt on reopen.
    attached: AtomicBool,
}

struct Inner<T> {
    transport: T,
    registry: RwLock<SubscriberRegistry>,
    listeners: RwLock<BTreeMap<usize, Arc<Listener>>>,
    listener_counter: AtomicUsize,
    session: Arc<dyn Session>,
    on_reconnect: RwLock<Option<TransitionHook>>,
    on_close: RwLock<Option<TransitionHook>>,
}

/// Topic multiplexer over one shared transport connection.
///
/// Cloneable; all clones share the same registry and connection. Must be
/// created inside a tokio runtime, which also drives the debounced
/// unsubscribe timers.
pub struct Multiplexer<T>
where
    T: Transport,
{
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Multiplexer<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Multiplexer<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Multiplexer with {} logical subscribers",
            self.inner.listeners.read().len()
        )
    }
}

impl<T> Multiplexer<T>
where
    T: Transport,
{
    /// Create the multiplexer and spawn its event loop.
    ///
    /// `events` is the transport's lifecycle/inbound stream; the loop ends
    /// when the transport drops its sending side.
    pub fn new(transport: T, events: TransportEvents, session: Arc<dyn Session>) -> Self {
        let inner = Arc::new(Inner {
            transport,
            registry: RwLock::new(SubscriberRegistry::new()),
            listeners: RwLock::new(BTreeMap::new()),
            listener_counter: AtomicUsize::new(0),
            session,
            on_reconnect: RwLock::new(None),
            on_close: RwLock::new(None),
        });

        tokio::spawn(Inner::run(inner.clone(), events));

        Self { inner }
    }

    /// Subscribe `callback` to `topic`, optionally narrowed by `filter`.
    ///
    /// The first interest in a (topic, filter) pair sends SUBSCRIBE on the
    /// wire; otherwise the cached last value for the pair is replayed
    /// synchronously before the callback is attached. Dropping the returned
    /// [`Subscription`] releases the interest again.
    pub fn subscribe<F>(&self, topic: &str, filter: Option<Filter>, callback: F) -> Subscription<T>
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        let topic = normalize_topic(topic);
        let key = wire_key(&topic, filter.as_ref());
        let callback: Callback = Box::new(callback);

        let replay = {
            let mut registry = self.inner.registry.write();
            let first_interest = match registry.get(&key) {
                Some(entry) => entry.quantity == 0 && !entry.is_delay_unsubscribe,
                None => true,
            };
            let replay = if first_interest {
                None
            } else {
                Some(registry.get(&key).and_then(|entry| entry.last_value.clone()))
            };
            registry.add_subscriber(&key);
            replay
        };

        match &replay {
            // first interest in this key, the wire has to hear about it
            None => {
                tracing::debug!("Subscribing to {topic}");
                self.inner.send_frame(
                    &topic,
                    FrameKind::Subscribe,
                    Inner::<T>::encode_filter(filter.as_ref()),
                );
            }
            // the wire subscription is already live, replay the cached state
            Some(last_value) => callback(last_value.as_deref()),
        }

        let id = self.inner.listener_counter.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(Listener {
            topic: topic.clone(),
            key: key.clone(),
            filter: filter.clone(),
            callback,
            attached: AtomicBool::new(true),
        });
        self.inner.listeners.write().insert(id, listener);

        Subscription {
            id,
            key,
            topic,
            filter,
            inner: self.inner.clone(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Subscribe with a typed payload decoded from JSON.
    ///
    /// Frames whose payload fails to decode are logged and skipped; absent
    /// payloads are forwarded as `None`.
    pub fn subscribe_json<P, F>(
        &self,
        topic: &str,
        filter: Option<Filter>,
        callback: F,
    ) -> Subscription<T>
    where
        P: DeserializeOwned,
        F: Fn(Option<P>) + Send + Sync + 'static,
    {
        self.subscribe(topic, filter, move |payload| match payload {
            None => callback(None),
            Some(raw) => match serde_json::from_str(raw) {
                Ok(value) => callback(Some(value)),
                Err(err) => tracing::error!("Could not decode payload: {err}"),
            },
        })
    }

    /// Fire-and-forget control frame to `destination`.
    pub fn send<M>(&self, destination: &str, kind: FrameKind, message: Option<&M>) -> Result<(), Error>
    where
        M: Serialize,
    {
        let message = message.map(serde_json::to_string).transpose()?;
        self.inner
            .transport
            .send(Frame::control(destination, kind, message))
    }

    /// Register the hook fired after the connection reopens.
    ///
    /// Only the CLOSE to OPEN transition fires it; the initial OPEN does not.
    pub fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_reconnect.write() = Some(Box::new(hook));
    }

    /// Register the hook fired when the connection drops.
    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_close.write() = Some(Box::new(hook));
    }
}

impl<T> Inner<T>
where
    T: Transport,
{
    /// Drains transport events until the transport goes away.
    async fn run(self: Arc<Self>, mut events: TransportEvents) {
        let mut previous: Option<ConnectionState> = None;

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Frame(frame) => self.handle_frame(frame),
                TransportEvent::Close => {
                    self.handle_close();
                    if previous.is_some() {
                        if let Some(hook) = self.on_close.read().as_ref() {
                            hook();
                        }
                    }
                    previous = Some(ConnectionState::Closed);
                }
                TransportEvent::Open => {
                    self.handle_open();
                    if previous == Some(ConnectionState::Closed) {
                        if let Some(hook) = self.on_reconnect.read().as_ref() {
                            hook();
                        }
                    }
                    previous = Some(ConnectionState::Open);
                }
            }
        }

        tracing::debug!("Transport event stream ended, multiplexer loop exiting");
    }

    fn handle_frame(&self, frame: Frame) {
        if frame.kind == FrameKind::Unauthorized {
            self.handle_unauthorized();
            return;
        }

        let listeners: Vec<Arc<Listener>> = self.listeners.read().values().cloned().collect();

        for listener in listeners {
            if !listener.attached.load(Ordering::Relaxed) {
                continue;
            }
            if listener.topic != frame.destination {
                continue;
            }
            if let Some(filter) = &listener.filter {
                if !filter.matches(frame.to.as_ref()) {
                    continue;
                }
            }

            self.registry
                .write()
                .set_subscriber_value(&listener.key, frame.message.clone());
            (listener.callback)(frame.message.as_deref());
        }
    }

    fn handle_unauthorized(&self) {
        tracing::debug!("Session rejected by server, clearing credential");
        self.session.clear_credential();
        if self.session.current_path() != LOGIN_PATH {
            self.session.redirect_to_login();
        }
    }

    /// The wire link is already down: detach every listener and release its
    /// registry reference without sending UNSUBSCRIBE.
    fn handle_close(&self) {
        let listeners: Vec<Arc<Listener>> = self.listeners.read().values().cloned().collect();
        let mut registry = self.registry.write();

        for listener in listeners {
            if listener.attached.swap(false, Ordering::Relaxed) {
                registry.remove_subscriber(&listener.key);
            }
        }
    }

    /// Rebuild the wire subscription of every detached listener, exactly
    /// once each.
    fn handle_open(&self) {
        let listeners: Vec<Arc<Listener>> = self.listeners.read().values().cloned().collect();

        for listener in listeners {
            if !listener.attached.swap(true, Ordering::Relaxed) {
                self.registry.write().add_subscriber(&listener.key);
                self.send_frame(
                    &listener.topic,
                    FrameKind::Subscribe,
                    Self::encode_filter(listener.filter.as_ref()),
                );
            }
        }
    }

    fn send_frame(&self, destination: &str, kind: FrameKind, message: Option<String>) {
        let frame = Frame::control(destination, kind, message);
        if let Err(err) = self.transport.send(frame) {
            tracing::warn!("Dropping outbound frame to {destination}: {err}");
        }
    }

    fn encode_filter(filter: Option<&Filter>) -> Option<String> {
        match filter.map(serde_json::to_string).transpose() {
            Ok(json) => json,
            Err(err) => {
                tracing::error!("Could not serialize subscription filter: {err:?}");
                None
            }
        }
    }

    /// Detach a logical subscriber and, when it was the last interest in its
    /// key, schedule the debounced UNSUBSCRIBE.
    fn dispose(self: &Arc<Self>, id: usize, key: &str, topic: &str, filter: Option<&Filter>) {
        self.listeners.write().remove(&id);

        let last_interest = {
            let mut registry = self.registry.write();
            let last_interest = registry
                .get(key)
                .map(|entry| entry.quantity == 1)
                .unwrap_or(false);
            if last_interest {
                registry.set_delay(key, true);
            }
            registry.remove_subscriber(key);
            last_interest
        };

        if !last_interest {
            return;
        }

        let inner = self.clone();
        let key = key.to_owned();
        let topic = topic.to_owned();
        let message = Self::encode_filter(filter);

        // The timer always fires; a re-subscribe during the grace window is
        // detected by the quantity check rather than by cancellation.
        tokio::spawn(async move {
            sleep(UNSUBSCRIBE_GRACE).await;

            let quantity = inner
                .registry
                .read()
                .get(&key)
                .map(|entry| entry.quantity)
                .unwrap_or(0);
            if quantity == 0 {
                tracing::debug!("Unsubscribing from {topic}");
                inner.send_frame(&topic, FrameKind::Unsubscribe, message);
            }
            inner.registry.write().set_delay(&key, false);
        });
    }
}

/// Handle owning one logical subscription.
///
/// Dropping it (or calling [`unsubscribe`](Self::unsubscribe)) detaches the
/// callback, decrements the interest count for its wire key and, when it was
/// the last interest, schedules the debounced UNSUBSCRIBE.
pub struct Subscription<T>
where
    T: Transport,
{
    id: usize,
    key: String,
    topic: String,
    filter: Option<Filter>,
    inner: Arc<Inner<T>>,
    disposed: AtomicBool,
}

impl<T> Subscription<T>
where
    T: Transport,
{
    /// Release the subscription now instead of at drop time.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Normalized topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wire key this subscription coalesces under.
    pub fn wire_key(&self) -> &str {
        &self.key
    }
}

impl<T> Debug for Subscription<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Subscription<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::Relaxed) {
            self.inner
                .dispose(self.id, &self.key, &self.topic, self.filter.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde::Deserialize;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, Duration};

    use super::Multiplexer;
    use crate::session::{Session, LOGIN_PATH};
    use crate::transport::{Transport, TransportEvent};
    use crate::wire::{Filter, Frame, FrameKind};
    use crate::Error;

    /// Transport that records every outbound frame so tests can assert on
    /// the exact wire traffic.
    struct TestTransport {
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    impl Transport for TestTransport {
        fn send(&self, frame: Frame) -> Result<(), Error> {
            self.sent.lock().push(frame);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestSession {
        cleared: AtomicUsize,
        redirects: AtomicUsize,
        at_login: AtomicBool,
    }

    impl Session for TestSession {
        fn clear_credential(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }

        fn current_path(&self) -> String {
            if self.at_login.load(Ordering::SeqCst) {
                LOGIN_PATH.to_owned()
            } else {
                "/dashboard".to_owned()
            }
        }

        fn redirect_to_login(&self) {
            self.at_login.store(true, Ordering::SeqCst);
            self.redirects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        mux: Multiplexer<TestTransport>,
        sent: Arc<Mutex<Vec<Frame>>>,
        events: mpsc::Sender<TransportEvent>,
        session: Arc<TestSession>,
    }

    fn harness() -> Harness {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::channel(64);
        let session = Arc::new(TestSession::default());
        let mux = Multiplexer::new(
            TestTransport { sent: sent.clone() },
            events_rx,
            session.clone(),
        );
        Harness {
            mux,
            sent,
            events: events_tx,
            session,
        }
    }

    /// With the paused clock this returns once every other task has gone
    /// idle, so injected events are fully processed afterwards.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn capture() -> (
        Arc<Mutex<Vec<Option<String>>>>,
        impl Fn(Option<&str>) + Send + Sync + 'static,
    ) {
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = values.clone();
        (values, move |payload: Option<&str>| {
            sink.lock().push(payload.map(str::to_owned));
        })
    }

    fn filter(agent: &str, build: &str) -> Filter {
        Filter {
            agent_id: Some(agent.to_owned()),
            build_version: Some(build.to_owned()),
            ..Default::default()
        }
    }

    fn data_frame(destination: &str, payload: &str, to: Option<Filter>) -> TransportEvent {
        TransportEvent::Frame(Frame {
            destination: destination.to_owned(),
            kind: FrameKind::Other("MESSAGE".to_owned()),
            message: Some(payload.to_owned()),
            to,
        })
    }

    fn count_kind(sent: &Mutex<Vec<Frame>>, kind: &FrameKind) -> usize {
        sent.lock().iter().filter(|frame| &frame.kind == kind).count()
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_interest_sends_one_subscribe() {
        let h = harness();
        let topic = "/agents/a1/state";
        let f = filter("a1", "1.0");

        let (_v1, cb1) = capture();
        let (_v2, cb2) = capture();
        let (_v3, cb3) = capture();
        let _s1 = h.mux.subscribe(topic, Some(f.clone()), cb1);
        let _s2 = h.mux.subscribe(topic, Some(f.clone()), cb2);
        let _s3 = h.mux.subscribe(topic, Some(f.clone()), cb3);

        assert_eq!(count_kind(&h.sent, &FrameKind::Subscribe), 1);
        let first = h.sent.lock()[0].clone();
        assert_eq!(first.destination, topic);
        assert_eq!(
            first.message.as_deref(),
            Some(r#"{"agentId":"a1","buildVersion":"1.0"}"#)
        );

        // a different filter on the same topic is its own wire subscription
        let (_v4, cb4) = capture();
        let _s4 = h.mux.subscribe(topic, Some(filter("a1", "2.0")), cb4);
        assert_eq!(count_kind(&h.sent, &FrameKind::Subscribe), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_fires_only_after_last_interest() {
        let h = harness();
        let topic = "/agents/a1/state";
        let f = filter("a1", "1.0");

        let (_v1, cb1) = capture();
        let (_v2, cb2) = capture();
        let (_v3, cb3) = capture();
        let s1 = h.mux.subscribe(topic, Some(f.clone()), cb1);
        let s2 = h.mux.subscribe(topic, Some(f.clone()), cb2);
        let s3 = h.mux.subscribe(topic, Some(f.clone()), cb3);
        let key = s3.wire_key().to_owned();

        drop(s1);
        drop(s2);
        sleep(Duration::from_millis(1_500)).await;

        assert_eq!(count_kind(&h.sent, &FrameKind::Unsubscribe), 0);
        assert_eq!(
            h.mux.inner.registry.read().get(&key).map(|e| e.quantity),
            Some(1)
        );

        drop(s3);
        sleep(Duration::from_millis(1_500)).await;

        assert_eq!(count_kind(&h.sent, &FrameKind::Unsubscribe), 1);
        let unsub = h
            .sent
            .lock()
            .iter()
            .find(|frame| frame.kind == FrameKind::Unsubscribe)
            .cloned()
            .expect("unsubscribe frame");
        assert_eq!(unsub.destination, topic);
        // the original filter is echoed so servers can match the SUBSCRIBE
        assert_eq!(
            unsub.message.as_deref(),
            Some(r#"{"agentId":"a1","buildVersion":"1.0"}"#)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_absorbs_resubscribe_churn() {
        let h = harness();
        let topic = "/metrics";

        let (_v1, cb1) = capture();
        let s1 = h.mux.subscribe(topic, None, cb1);
        h.events
            .send(data_frame(topic, "V", None))
            .await
            .expect("inject frame");
        settle().await;

        drop(s1);
        sleep(Duration::from_millis(300)).await;

        let (v2, cb2) = capture();
        let s2 = h.mux.subscribe(topic, None, cb2);

        // cached state replayed, no second SUBSCRIBE on the wire
        assert_eq!(v2.lock().clone(), vec![Some("V".to_owned())]);
        assert_eq!(count_kind(&h.sent, &FrameKind::Subscribe), 1);

        // the original timer still fires but finds a live subscriber
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(count_kind(&h.sent, &FrameKind::Unsubscribe), 0);

        drop(s2);
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(count_kind(&h.sent, &FrameKind::Unsubscribe), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_replays_cached_value_synchronously() {
        let h = harness();
        let topic = "/builds/summary";

        let (v1, cb1) = capture();
        let _s1 = h.mux.subscribe(topic, None, cb1);
        h.events
            .send(data_frame(topic, "V", None))
            .await
            .expect("inject frame");
        settle().await;
        assert_eq!(v1.lock().clone(), vec![Some("V".to_owned())]);

        let (v2, cb2) = capture();
        let _s2 = h.mux.subscribe(topic, None, cb2);

        // replayed before any further inbound frame, no settling needed
        assert_eq!(v2.lock().clone(), vec![Some("V".to_owned())]);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_delivered_only_to_matching_filters() {
        let h = harness();
        let topic = "/agents/state";

        let (v_a, cb_a) = capture();
        let (v_b, cb_b) = capture();
        let (v_c, cb_c) = capture();
        let _a = h.mux.subscribe(topic, Some(filter("a1", "1.0")), cb_a);
        let _b = h.mux.subscribe(topic, Some(filter("a1", "2.0")), cb_b);
        let _c = h.mux.subscribe(topic, None, cb_c);

        h.events
            .send(data_frame(topic, "X", Some(filter("a1", "1.0"))))
            .await
            .expect("inject frame");
        settle().await;

        assert_eq!(v_a.lock().clone(), vec![Some("X".to_owned())]);
        assert!(v_b.lock().is_empty());
        assert_eq!(v_c.lock().clone(), vec![Some("X".to_owned())]);

        // frames without a filter field-set only reach unfiltered listeners
        h.events
            .send(data_frame(topic, "Y", None))
            .await
            .expect("inject frame");
        settle().await;

        assert_eq!(v_a.lock().len(), 1);
        assert!(v_b.lock().is_empty());
        assert_eq!(v_c.lock().len(), 2);

        // other destinations are ignored entirely
        h.events
            .send(data_frame("/elsewhere", "Z", None))
            .await
            .expect("inject frame");
        settle().await;
        assert_eq!(v_c.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_rebuilds_each_subscription_once() {
        let h = harness();
        let reconnects = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let reconnects = reconnects.clone();
            h.mux.on_reconnect(move || {
                reconnects.fetch_add(1, Ordering::SeqCst);
            });
            let closes = closes.clone();
            h.mux.on_close(move || {
                closes.fetch_add(1, Ordering::SeqCst);
            });
        }

        // the initial OPEN is not a reconnection
        h.events.send(TransportEvent::Open).await.expect("open");
        settle().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        let (v_a, cb_a) = capture();
        let (v_b, cb_b) = capture();
        let _a = h.mux.subscribe("/metrics", None, cb_a);
        let _b = h.mux.subscribe("/logs", None, cb_b);
        assert_eq!(count_kind(&h.sent, &FrameKind::Subscribe), 2);

        h.events.send(TransportEvent::Close).await.expect("close");
        settle().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);

        // detached listeners ignore traffic while the link is down
        h.events
            .send(data_frame("/metrics", "stale", None))
            .await
            .expect("inject frame");
        settle().await;
        assert!(v_a.lock().is_empty());

        h.events.send(TransportEvent::Open).await.expect("reopen");
        settle().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);

        // one SUBSCRIBE re-sent per surviving logical subscription
        assert_eq!(count_kind(&h.sent, &FrameKind::Subscribe), 4);

        // a single inbound frame reaches each surviving callback exactly once
        h.events
            .send(data_frame("/metrics", "fresh", None))
            .await
            .expect("inject frame");
        settle().await;
        assert_eq!(v_a.lock().clone(), vec![Some("fresh".to_owned())]);
        assert!(v_b.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_while_disconnected_sends_no_unsubscribe() {
        let h = harness();
        h.events.send(TransportEvent::Open).await.expect("open");
        settle().await;

        let (_v, cb) = capture();
        let s = h.mux.subscribe("/metrics", None, cb);

        h.events.send(TransportEvent::Close).await.expect("close");
        settle().await;

        drop(s);
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(count_kind(&h.sent, &FrameKind::Unsubscribe), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_clears_credential_and_redirects() {
        let h = harness();
        let (v, cb) = capture();
        let _s = h.mux.subscribe("/whatever", None, cb);

        h.events
            .send(TransportEvent::Frame(Frame {
                destination: "/whatever".to_owned(),
                kind: FrameKind::Unauthorized,
                message: None,
                to: None,
            }))
            .await
            .expect("inject frame");
        settle().await;

        assert_eq!(h.session.cleared.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.redirects.load(Ordering::SeqCst), 1);
        // never surfaced to subscriber callbacks
        assert!(v.lock().is_empty());

        // once at the login boundary, no further redirect
        h.events
            .send(TransportEvent::Frame(Frame {
                destination: String::new(),
                kind: FrameKind::Unauthorized,
                message: None,
                to: None,
            }))
            .await
            .expect("inject frame");
        settle().await;

        assert_eq!(h.session.cleared.load(Ordering::SeqCst), 2);
        assert_eq!(h.session.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn typed_subscription_decodes_json_payload() {
        #[derive(Debug, Clone, PartialEq, Deserialize)]
        struct Summary {
            version: String,
        }

        let h = harness();
        let decoded = Arc::new(Mutex::new(Vec::new()));
        let sink = decoded.clone();
        let _s = h
            .mux
            .subscribe_json("/builds/summary", None, move |summary: Option<Summary>| {
                sink.lock().push(summary);
            });

        h.events
            .send(data_frame("/builds/summary", r#"{"version":"1.0"}"#, None))
            .await
            .expect("inject frame");
        settle().await;

        // malformed payloads are skipped, not surfaced
        h.events
            .send(data_frame("/builds/summary", "not json", None))
            .await
            .expect("inject frame");
        settle().await;

        assert_eq!(
            decoded.lock().clone(),
            vec![Some(Summary {
                version: "1.0".to_owned()
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_writes_control_frames_verbatim() {
        let h = harness();
        h.mux
            .send(
                "/agents/a1/toggle",
                FrameKind::Other("RECORD_DATA".to_owned()),
                Some(&filter("a1", "1.0")),
            )
            .expect("send");

        let frame = h.sent.lock()[0].clone();
        assert_eq!(frame.destination, "/agents/a1/toggle");
        assert_eq!(frame.kind, FrameKind::Other("RECORD_DATA".to_owned()));
        assert_eq!(
            frame.message.as_deref(),
            Some(r#"{"agentId":"a1","buildVersion":"1.0"}"#)
        );
    }
}
