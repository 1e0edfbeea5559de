//! In-memory event bus fake with failure injection.

use futures::stream;
use souk_core::event::SerializedEvent;
use souk_core::event_bus::{EventBus, EventBusError, EventStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Capturing event bus for tests.
///
/// Publishes are recorded for assertions and fanned out to subscribers over a
/// broadcast channel. [`InMemoryEventBus::fail_next_publishes`] makes the
/// next N publishes fail, which is how tests drive the outbox relay's
/// retry/backoff and dead-row paths.
pub struct InMemoryEventBus {
    published: Mutex<Vec<(String, SerializedEvent)>>,
    sender: broadcast::Sender<(String, SerializedEvent)>,
    fail_remaining: AtomicUsize,
}

impl InMemoryEventBus {
    /// Create a bus with no subscribers and no injected failures.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            published: Mutex::new(Vec::new()),
            sender,
            fail_remaining: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` publish calls fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Everything successfully published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Event types successfully published to `topic`, in order.
    #[must_use]
    pub fn published_types(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, event)| event.event_type)
            .collect()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        Box::pin(async move {
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "publish failed (injected)".to_string(),
                });
            }
            if let Ok(mut published) = self.published.lock() {
                published.push((topic.clone(), event.clone()));
            }
            // No receivers is fine; tests often only assert on captures.
            let _ = self.sender.send((topic, event));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics = topics.to_vec();
        let receiver = self.sender.subscribe();
        Box::pin(async move {
            let stream = stream::unfold(
                (receiver, topics),
                |(mut receiver, topics)| async move {
                    loop {
                        match receiver.recv().await {
                            Ok((topic, event)) if topics.contains(&topic) => {
                                return Some((Ok(event), (receiver, topics)));
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                },
            );
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
