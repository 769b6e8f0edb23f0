#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Core event bus for the Cachelot platform.
//!
//! Delivery contract: every subscriber owns a bounded queue
//! (`subscriber_queue_depth`, default 256). Publishing walks the subscriber
//! table and offers the envelope to each queue; a full queue sheds its
//! oldest envelope and the shed count is readable from that subscriber's
//! stream handle. Publishing is synchronous and never waits on a consumer,
//! so a stalled transport can only ever lose its own events. Within one
//! subscriber, envelopes arrive in publish order with gaps only at the
//! front of a lagging queue.

pub mod payloads;

pub use payloads::{
    CacheHealth, CyclePhase, DEFAULT_SUBSCRIBER_QUEUE_DEPTH, Event, EventEnvelope, EventId,
    LogLevel, OperationType, ServiceState, SessionInfo,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use tokio::sync::Notify;

/// Fan-out hub carrying typed events from the engine to transports.
///
/// Cloning is cheap; all clones feed the same subscriber table. When the
/// last clone is dropped, subscriber streams drain their queues and end.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

struct BusShared {
    queue_depth: usize,
    sequence: AtomicU64,
    subscribers: Mutex<Vec<Weak<SubscriberSlot>>>,
}

struct SubscriberSlot {
    queue_depth: usize,
    queue: Mutex<VecDeque<EventEnvelope>>,
    shed: AtomicU64,
    wakeup: Notify,
    closed: AtomicBool,
}

impl EventBus {
    /// Construct a bus whose subscribers each buffer up to `queue_depth`
    /// undelivered events.
    ///
    /// # Panics
    ///
    /// Panics if `queue_depth` is zero; a zero-depth queue could never
    /// deliver anything.
    #[must_use]
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        assert!(queue_depth > 0, "subscriber queue depth must be positive");
        Self {
            shared: Arc::new(BusShared {
                queue_depth,
                sequence: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Construct a bus with the default subscriber queue depth.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_SUBSCRIBER_QUEUE_DEPTH)
    }

    /// Publish an event, assigning it the next sequential identifier.
    ///
    /// Delivery is best-effort per subscriber: queues at capacity shed their
    /// oldest envelope first. The call does not wait on any consumer.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        let mut subscribers = lock(&self.shared.subscribers);
        subscribers.retain(|weak| {
            weak.upgrade().is_some_and(|slot| {
                slot.offer(envelope.clone());
                true
            })
        });
        id
    }

    /// Register a new subscriber. Its stream sees only events published
    /// after this call; dropping the stream withdraws the subscription.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let slot = Arc::new(SubscriberSlot {
            queue_depth: self.shared.queue_depth,
            queue: Mutex::new(VecDeque::with_capacity(self.shared.queue_depth)),
            shed: AtomicU64::new(0),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
        });
        lock(&self.shared.subscribers).push(Arc::downgrade(&slot));
        EventStream { slot }
    }

    /// Number of live subscribers, after pruning withdrawn ones.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = lock(&self.shared.subscribers);
        subscribers.retain(|slot| slot.strong_count() > 0);
        subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BusShared {
    fn drop(&mut self) {
        // Last publisher gone: let parked streams finish their queues.
        let subscribers = self
            .subscribers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for weak in subscribers.drain(..) {
            if let Some(slot) = weak.upgrade() {
                slot.closed.store(true, Ordering::Release);
                slot.wakeup.notify_one();
            }
        }
    }
}

impl SubscriberSlot {
    fn offer(&self, envelope: EventEnvelope) {
        {
            let mut queue = lock(&self.queue);
            if queue.len() == self.queue_depth {
                queue.pop_front();
                self.shed.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(envelope);
        }
        self.wakeup.notify_one();
    }

    fn take_front(&self) -> Option<EventEnvelope> {
        lock(&self.queue).pop_front()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One subscriber's view of the bus: its bounded queue plus the count of
/// events shed while it lagged.
pub struct EventStream {
    slot: Arc<SubscriberSlot>,
}

impl EventStream {
    /// Receive the next buffered event, waiting for one when the queue is
    /// empty. Returns `None` once the bus is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        loop {
            if let Some(envelope) = self.slot.take_front() {
                return Some(envelope);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            self.slot.wakeup.notified().await;
        }
    }

    /// Events shed for this subscriber because its queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.slot.shed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

    fn progress_event(percent: f64) -> Event {
        Event::OperationProgress {
            operation_id: Uuid::nil(),
            operation_type: OperationType::Cache,
            file_name: "movie.mkv".to_string(),
            progress_percent: percent,
            bytes_transferred: 0,
            bytes_total: 4_096,
            speed_bytes_per_sec: 1_024,
            eta_seconds: None,
        }
    }

    fn stats_event(used: u64) -> Event {
        Event::Stats {
            total_size_bytes: used,
            limit_bytes: 100,
            used_percent: 50.0,
            file_count: 1,
            health: CacheHealth::Healthy,
        }
    }

    async fn drain_one(stream: &mut EventStream) -> EventEnvelope {
        timeout(DRAIN_TIMEOUT, stream.next())
            .await
            .expect("stream stalled")
            .expect("stream closed early")
    }

    #[test]
    fn kind_labels_match_serialized_type_tags() -> anyhow::Result<()> {
        let session = SessionInfo {
            session_key: "s1".to_string(),
            user_id: None,
            logical_path: "/library/demo.mkv".to_string(),
            playing_from_fast: true,
        };
        let every_variant = vec![
            Event::Status {
                state: ServiceState::Starting,
            },
            stats_event(1),
            progress_event(25.0),
            Event::OperationComplete {
                operation_id: Uuid::nil(),
                operation_type: OperationType::Evict,
                file_path: "/library/demo.mkv".to_string(),
                success: false,
                error: Some("fast_full".to_string()),
                duration_seconds: 0.5,
                bytes_transferred: 0,
            },
            Event::SessionStart {
                session: session.clone(),
            },
            Event::SessionUpdate { session },
            Event::SessionEnd {
                session_key: "s1".to_string(),
            },
            Event::Log {
                level: LogLevel::Warning,
                message: "m".to_string(),
                source: "tests".to_string(),
            },
            Event::CycleStart {
                cycle_id: Uuid::nil(),
                phase: CyclePhase::Active,
                items_total: 1,
            },
            Event::CycleProgress {
                cycle_id: Uuid::nil(),
                phase: CyclePhase::Eviction,
                items_processed: 1,
                items_total: 2,
                files_cached: 1,
                files_restored: 0,
            },
            Event::CycleComplete {
                cycle_id: Uuid::nil(),
                phase: CyclePhase::Reconcile,
                items_processed: 2,
                items_total: 2,
                files_cached: 1,
                files_restored: 0,
                aborted: true,
            },
        ];

        // The wire discriminator and the metrics label must always agree.
        for event in every_variant {
            let kind = event.kind();
            let value = serde_json::to_value(&event)?;
            assert_eq!(value["type"], kind, "mismatch for {kind}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn a_relocation_event_sequence_arrives_in_order() {
        let bus = EventBus::with_queue_depth(16);
        let mut stream = bus.subscribe();

        bus.publish(progress_event(25.0));
        bus.publish(progress_event(100.0));
        bus.publish(Event::OperationComplete {
            operation_id: Uuid::nil(),
            operation_type: OperationType::Cache,
            file_path: "/library/movie.mkv".to_string(),
            success: true,
            error: None,
            duration_seconds: 1.0,
            bytes_transferred: 4_096,
        });
        bus.publish(stats_event(4_096));

        let mut kinds = Vec::new();
        let mut last_id = 0;
        for _ in 0..4 {
            let envelope = drain_one(&mut stream).await;
            assert!(envelope.id > last_id, "ids must be monotonic");
            last_id = envelope.id;
            kinds.push(envelope.event.kind());
        }
        assert_eq!(
            kinds,
            vec![
                "operation_progress",
                "operation_progress",
                "operation_complete",
                "stats"
            ]
        );
        assert_eq!(stream.dropped(), 0);
    }

    #[tokio::test]
    async fn oldest_events_shed_first_when_a_subscriber_stalls() {
        // Depth 256, 1000 events published while the subscriber never
        // drains: it must end up with the newest 256 plus a shed count of
        // 744, still in order.
        let bus = EventBus::with_queue_depth(256);
        let mut stream = bus.subscribe();

        for i in 0..1_000 {
            bus.publish(progress_event(f64::from(i) / 10.0));
        }

        assert_eq!(stream.dropped(), 744);
        let first = drain_one(&mut stream).await;
        assert_eq!(first.id, 745, "the shed events are the oldest ones");
        let mut previous = first.id;
        for _ in 0..255 {
            let envelope = drain_one(&mut stream).await;
            assert_eq!(envelope.id, previous + 1, "no gaps after the front");
            previous = envelope.id;
        }
        assert_eq!(previous, 1_000);
    }

    #[tokio::test]
    async fn shedding_is_accounted_per_subscriber() {
        let bus = EventBus::with_queue_depth(8);
        let mut keeping_up = bus.subscribe();
        let stalled = bus.subscribe();

        for i in 0..64 {
            bus.publish(stats_event(i));
            // One consumer drains as it goes; the other never does.
            let envelope = drain_one(&mut keeping_up).await;
            assert_eq!(envelope.id, i + 1);
        }

        assert_eq!(keeping_up.dropped(), 0, "a draining subscriber loses nothing");
        assert_eq!(stalled.dropped(), 64 - 8);
    }

    #[tokio::test]
    async fn publishing_into_a_full_queue_does_not_wait() {
        let bus = EventBus::with_queue_depth(4);
        let _stalled = bus.subscribe();

        // `publish` is synchronous; wrapping the burst in a timeout proves
        // it cannot park on the stalled consumer.
        timeout(DRAIN_TIMEOUT, async {
            for i in 0..10_000 {
                bus.publish(stats_event(i));
            }
        })
        .await
        .expect("publishing must never block on subscribers");
    }

    #[tokio::test]
    async fn dropped_bus_lets_streams_drain_then_end() {
        let bus = EventBus::with_queue_depth(4);
        let mut stream = bus.subscribe();
        bus.publish(stats_event(1));
        bus.publish(stats_event(2));
        drop(bus);

        assert_eq!(drain_one(&mut stream).await.id, 1);
        assert_eq!(drain_one(&mut stream).await.id, 2);
        assert!(
            timeout(DRAIN_TIMEOUT, stream.next())
                .await
                .expect("close must not stall the stream")
                .is_none()
        );
    }

    #[tokio::test]
    async fn withdrawn_subscribers_are_pruned() {
        let bus = EventBus::with_queue_depth(4);
        let stream = bus.subscribe();
        let mut kept = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(stream);
        assert_eq!(bus.subscriber_count(), 1);

        // Publishing after a withdrawal reaches the remaining subscriber.
        bus.publish(stats_event(1));
        assert_eq!(drain_one(&mut kept).await.id, 1);
    }
}
