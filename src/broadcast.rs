//! Progress broadcaster: fan progress events out to live subscribers.
//!
//! A [`ProgressHub`] is an explicitly owned, cheaply clonable handle. Pass
//! the same hub to the pipeline (it implements
//! [`ConversionProgressCallback`]) and to whatever serves the event stream.
//!
//! ## Delivery model
//!
//! Each subscription owns a bounded queue (capacity 100 by default).
//! [`ProgressHub::broadcast`] never blocks: when a queue is full the oldest
//! queued event is evicted to make room, so a slow consumer may miss stale
//! updates but always converges on the latest status. Broadcasting to a task
//! with no subscribers is a silent no-op.
//!
//! The registry lock guards only the subscriber indexes. `broadcast` takes a
//! snapshot of the target queues under the lock and pushes after releasing
//! it, so one task's slow readers never hold up another task's broadcasts or
//! new registrations.
//!
//! ## Streaming
//!
//! [`Subscription::into_frames`] turns a subscription into an endless
//! [`Frame`] stream: one `Connected` frame, then events as they arrive, with
//! a `KeepAlive` frame after every idle heartbeat interval (30 s by default).
//! Dropping the stream unregisters the subscriber.

use crate::progress::{ConversionProgressCallback, ProgressEvent};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Idle time after which a stream emits a keep-alive frame.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// A boxed, endless stream of frames for one subscriber.
pub type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Frames ───────────────────────────────────────────────────────────────

/// One unit of the subscriber-facing stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// First frame of every stream.
    Connected { client_id: String, task_id: String },
    /// A progress update.
    Event(ProgressEvent),
    /// Emitted after an idle heartbeat interval.
    KeepAlive,
}

impl Frame {
    /// Render the frame in Server-Sent Events wire format.
    pub fn to_sse(&self) -> String {
        match self {
            Frame::Connected { client_id, task_id } => {
                let data = serde_json::json!({ "client_id": client_id, "task_id": task_id });
                format!("event: connected\ndata: {data}\n\n")
            }
            Frame::Event(event) => match serde_json::to_string(event) {
                Ok(data) => format!("data: {data}\n\n"),
                Err(e) => {
                    warn!("[SSE] dropping unserialisable event for {}: {}", event.task_id, e);
                    ": keep-alive\n\n".to_string()
                }
            },
            Frame::KeepAlive => ": keep-alive\n\n".to_string(),
        }
    }
}

// ── Per-subscriber queue ─────────────────────────────────────────────────

struct EventQueue {
    events: Mutex<VecDeque<ProgressEvent>>,
    capacity: usize,
    notify: Notify,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking; returns true when an old event was evicted.
    fn push(&self, event: ProgressEvent) -> bool {
        let evicted = {
            let mut q = lock(&self.events);
            let evicted = q.len() >= self.capacity && q.pop_front().is_some();
            q.push_back(event);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    fn try_pop(&self) -> Option<ProgressEvent> {
        lock(&self.events).pop_front()
    }

    async fn pop(&self) -> ProgressEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

struct ClientEntry {
    task_id: String,
    queue: Arc<EventQueue>,
}

#[derive(Default)]
struct Registry {
    next_client: u64,
    clients: HashMap<String, ClientEntry>,
    tasks: HashMap<String, HashSet<String>>,
}

struct HubInner {
    registry: Mutex<Registry>,
    capacity: usize,
    heartbeat: Duration,
}

/// Subscriber counts, for diagnostics endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub total_clients: usize,
    pub total_tasks: usize,
    pub subscriptions: HashMap<String, usize>,
}

/// Publish/subscribe hub for task progress.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProgressHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHub")
            .field("capacity", &self.inner.capacity)
            .field("heartbeat", &self.inner.heartbeat)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_QUEUE_CAPACITY, DEFAULT_HEARTBEAT)
    }

    /// Hub with a custom queue capacity (min 1) and heartbeat interval.
    pub fn with_settings(capacity: usize, heartbeat: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(Registry::default()),
                capacity: capacity.max(1),
                heartbeat,
            }),
        }
    }

    /// Register a new subscriber for `task_id`.
    pub fn subscribe(&self, task_id: impl Into<String>) -> Subscription {
        let task_id = task_id.into();
        let queue = Arc::new(EventQueue::new(self.inner.capacity));

        let client_id = {
            let mut reg = lock(&self.inner.registry);
            let client_id = format!("client_{}", reg.next_client);
            reg.next_client += 1;
            reg.clients.insert(
                client_id.clone(),
                ClientEntry {
                    task_id: task_id.clone(),
                    queue: Arc::clone(&queue),
                },
            );
            reg.tasks
                .entry(task_id.clone())
                .or_default()
                .insert(client_id.clone());
            client_id
        };

        info!("[SSE] Client {} subscribed to task {}", client_id, task_id);

        Subscription {
            client_id,
            task_id,
            queue,
            hub: self.clone(),
        }
    }

    /// Remove a subscriber from every index. Unknown ids are ignored.
    pub fn unsubscribe(&self, client_id: &str) {
        let mut reg = lock(&self.inner.registry);
        let Some(entry) = reg.clients.remove(client_id) else {
            return;
        };
        if let Some(set) = reg.tasks.get_mut(&entry.task_id) {
            set.remove(client_id);
            if set.is_empty() {
                reg.tasks.remove(&entry.task_id);
            }
        }
        drop(reg);
        info!("[SSE] Client {} unsubscribed", client_id);
    }

    /// Deliver `event` to every current subscriber of `task_id`.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn broadcast(&self, task_id: &str, event: ProgressEvent) -> usize {
        let targets: Vec<(String, Arc<EventQueue>)> = {
            let reg = lock(&self.inner.registry);
            let Some(ids) = reg.tasks.get(task_id) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| {
                    reg.clients
                        .get(id)
                        .map(|c| (id.clone(), Arc::clone(&c.queue)))
                })
                .collect()
        };

        for (client_id, queue) in &targets {
            if queue.push(event.clone()) {
                debug!("[SSE] Queue full for {}, evicted oldest event", client_id);
            }
        }
        targets.len()
    }

    /// Subscribe and return the frame stream directly.
    pub fn event_stream(&self, task_id: impl Into<String>) -> FrameStream {
        self.subscribe(task_id).into_frames()
    }

    /// Subscribe and return the stream already rendered as SSE text.
    pub fn sse_stream(&self, task_id: impl Into<String>) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        use futures::StreamExt;
        Box::pin(self.event_stream(task_id).map(|frame| frame.to_sse()))
    }

    pub fn stats(&self) -> HubStats {
        let reg = lock(&self.inner.registry);
        HubStats {
            total_clients: reg.clients.len(),
            total_tasks: reg.tasks.len(),
            subscriptions: reg
                .tasks
                .iter()
                .map(|(task, ids)| (task.clone(), ids.len()))
                .collect(),
        }
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        lock(&self.inner.registry)
            .tasks
            .get(task_id)
            .map_or(0, HashSet::len)
    }
}

impl ConversionProgressCallback for ProgressHub {
    fn on_progress(&self, event: ProgressEvent) {
        let task_id = event.task_id.clone();
        self.broadcast(&task_id, event);
    }
}

// ── Subscription ─────────────────────────────────────────────────────────

/// A live registration. Unregisters itself when dropped.
pub struct Subscription {
    client_id: String,
    task_id: String,
    queue: Arc<EventQueue>,
    hub: ProgressHub,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("client_id", &self.client_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl Subscription {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the next event, however long it takes.
    pub async fn recv(&self) -> ProgressEvent {
        self.queue.pop().await
    }

    /// Wait up to the hub's heartbeat interval; yields `KeepAlive` on timeout.
    pub async fn next_frame(&self) -> Frame {
        match tokio::time::timeout(self.hub.inner.heartbeat, self.queue.pop()).await {
            Ok(event) => Frame::Event(event),
            Err(_) => Frame::KeepAlive,
        }
    }

    pub fn try_recv(&self) -> Option<ProgressEvent> {
        self.queue.try_pop()
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| self.queue.try_pop()).collect()
    }

    /// Endless frame stream, starting with `Connected`.
    pub fn into_frames(self) -> FrameStream {
        Box::pin(stream::unfold((self, false), |(sub, connected)| async move {
            let frame = if connected {
                sub.next_frame().await
            } else {
                Frame::Connected {
                    client_id: sub.client_id.clone(),
                    task_id: sub.task_id.clone(),
                }
            };
            Some((frame, (sub, true)))
        }))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!("[SSE] Client {} disconnected", self.client_id);
        self.hub.unsubscribe(&self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStatus;
    use futures::StreamExt;

    fn event(task: &str, n: usize) -> ProgressEvent {
        ProgressEvent::processing(task, n, 1000)
    }

    #[tokio::test]
    async fn subscriber_receives_broadcast() {
        let hub = ProgressHub::new();
        let sub = hub.subscribe("task-a");
        assert_eq!(hub.broadcast("task-a", event("task-a", 1)), 1);
        let got = sub.recv().await;
        assert_eq!(got.current_page, 1);
    }

    #[test]
    fn broadcast_without_subscribers_is_dropped() {
        let hub = ProgressHub::new();
        assert_eq!(hub.broadcast("nobody", event("nobody", 1)), 0);
    }

    #[test]
    fn full_queue_keeps_most_recent_events() {
        let hub = ProgressHub::new();
        let sub = hub.subscribe("t");
        for n in 0..150 {
            hub.broadcast("t", event("t", n));
        }
        let drained = sub.drain();
        assert_eq!(drained.len(), 100);
        let pages: Vec<usize> = drained.iter().map(|e| e.current_page).collect();
        assert_eq!(pages, (50..150).collect::<Vec<_>>());
    }

    #[test]
    fn tasks_are_isolated() {
        let hub = ProgressHub::new();
        let a = hub.subscribe("a");
        let b = hub.subscribe("b");
        hub.broadcast("a", event("a", 1));
        assert_eq!(a.drain().len(), 1);
        assert!(b.drain().is_empty());
    }

    #[test]
    fn every_subscriber_of_a_task_gets_a_copy() {
        let hub = ProgressHub::new();
        let first = hub.subscribe("t");
        let second = hub.subscribe("t");
        assert_ne!(first.client_id(), second.client_id());
        assert_eq!(hub.broadcast("t", event("t", 3)), 2);
        assert_eq!(first.drain().len(), 1);
        assert_eq!(second.drain().len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let hub = ProgressHub::new();
        let sub = hub.subscribe("t");
        let id = sub.client_id().to_string();
        hub.unsubscribe(&id);
        hub.unsubscribe(&id);
        hub.unsubscribe("client_999");
        assert_eq!(hub.subscriber_count("t"), 0);
        assert_eq!(hub.broadcast("t", event("t", 1)), 0);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let hub = ProgressHub::new();
        {
            let _sub = hub.subscribe("t");
            assert_eq!(hub.stats().total_clients, 1);
        }
        let stats = hub.stats();
        assert_eq!(stats.total_clients, 0);
        assert_eq!(stats.total_tasks, 0);
    }

    #[test]
    fn stats_count_per_task() {
        let hub = ProgressHub::new();
        let _a1 = hub.subscribe("a");
        let _a2 = hub.subscribe("a");
        let _b = hub.subscribe("b");
        let stats = hub.stats();
        assert_eq!(stats.total_clients, 3);
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.subscriptions.get("a"), Some(&2));
    }

    #[tokio::test]
    async fn stream_starts_connected_then_heartbeats() {
        let hub = ProgressHub::with_settings(DEFAULT_QUEUE_CAPACITY, Duration::from_millis(20));
        let mut frames = hub.event_stream("t");

        match frames.next().await {
            Some(Frame::Connected { task_id, .. }) => assert_eq!(task_id, "t"),
            other => panic!("expected Connected, got {other:?}"),
        }
        assert_eq!(frames.next().await, Some(Frame::KeepAlive));

        hub.broadcast("t", ProgressEvent::completed("t", 3));
        match frames.next().await {
            Some(Frame::Event(e)) => assert_eq!(e.status, ProgressStatus::Completed),
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_stream_unregisters() {
        let hub = ProgressHub::new();
        let mut frames = hub.event_stream("t");
        let _ = frames.next().await;
        assert_eq!(hub.subscriber_count("t"), 1);
        drop(frames);
        assert_eq!(hub.subscriber_count("t"), 0);
    }

    #[test]
    fn sse_rendering() {
        let connected = Frame::Connected {
            client_id: "client_0".into(),
            task_id: "t".into(),
        }
        .to_sse();
        assert!(connected.starts_with("event: connected\ndata: {"));
        assert!(connected.contains("\"client_id\":\"client_0\""));
        assert!(connected.ends_with("\n\n"));

        let data = Frame::Event(ProgressEvent::completed("t", 2)).to_sse();
        assert!(data.starts_with("data: {"));
        assert!(data.contains("\"task_id\":\"t\""));

        assert_eq!(Frame::KeepAlive.to_sse(), ": keep-alive\n\n");
    }

    #[tokio::test]
    async fn hub_as_progress_callback() {
        let hub = ProgressHub::new();
        let sub = hub.subscribe("t");
        let cb: crate::progress::ProgressCallback = Arc::new(hub.clone());
        cb.on_progress(ProgressEvent::processing("t", 1, 2));
        assert_eq!(sub.recv().await.progress, 50.0);
    }
}
