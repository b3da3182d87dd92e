//! Server-Sent Events dispatcher.
//!
//! Every request drains what is pending at the moment it arrives and then
//! ends the stream. Each item becomes a generic `krateo` frame and, when the
//! event belongs to a composition, a second frame named after the
//! composition id so browsers can subscribe to a single composition.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    extract::State,
    http::header::{self, HeaderName},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Response,
    },
};
use eventsse_core::{Event, ExpiringCache, Job, JobIter};
use futures::Stream;
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::state::{AppState, Delivery};

/// Name of the frame sent for every event.
pub const GENERIC_EVENT_NAME: &str = "krateo";

fn stream_headers() -> [(HeaderName, &'static str); 5] {
    [
        (header::CONNECTION, "keep-alive"),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "Authorization,Content-Type"),
        (header::ACCESS_CONTROL_EXPOSE_HEADERS, "Authorization,Content-Type"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ]
}

/// Whether `value` can be used as an SSE `id` or `event` field.
pub fn is_valid_field(value: &str) -> bool {
    !value.is_empty() && !value.contains(['\r', '\n', '\0'])
}

/// Drain pending notifications as an SSE stream.
/// GET /notifications
pub async fn notifications(State(state): State<AppState>) -> Response {
    if state.shutdown_token().is_cancelled() {
        debug!("Shutting down, sending empty notification stream");
        let empty = futures::stream::empty::<Result<SseEvent, Infallible>>();
        return (stream_headers(), Sse::new(empty)).into_response();
    }

    match state.delivery() {
        Delivery::Cache(cache) => {
            let stream = drain_cache(Arc::clone(cache));
            (stream_headers(), Sse::new(stream)).into_response()
        }
        Delivery::Broker { delivery, .. } => {
            let jobs = match delivery.consume(state.config().drain_limit).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(queue = %delivery.name(), error = %e, "Unable to consume notifications");
                    return ApiError::from(e).into_response();
                }
            };
            (stream_headers(), Sse::new(drain_queue(jobs))).into_response()
        }
    }
}

/// SSE frames of one event stored under `key`.
pub fn event_frames(key: &str, event: &Event) -> Result<Vec<SseEvent>, serde_json::Error> {
    let data = serde_json::to_string(event)?;

    let mut frames = vec![SseEvent::default()
        .event(GENERIC_EVENT_NAME)
        .id(key)
        .data(&data)];

    match event.composition_id() {
        Some(composition) if is_valid_field(composition) => frames.push(
            SseEvent::default()
                .event(composition)
                .id(key)
                .data(&data),
        ),
        Some(composition) => {
            warn!(id = %key, composition = %composition, "Skipping composition frame")
        }
        None => {}
    }

    Ok(frames)
}

fn drain_cache(
    cache: Arc<ExpiringCache<String, Event>>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static {
    stream! {
        for key in cache.keys() {
            if !is_valid_field(&key) {
                warn!(id = %key, "Dropping entry with an invalid id");
                cache.remove(&key);
                continue;
            }

            let Some(event) = cache.get(&key) else {
                warn!(id = %key, "Event not found in cache, maybe expired");
                continue;
            };

            let frames = match event_frames(&key, &event) {
                Ok(frames) => frames,
                Err(e) => {
                    error!(id = %key, error = %e, "Unable to encode event");
                    continue;
                }
            };

            info!(id = %key, "Sending notification");
            for frame in frames {
                yield Ok(frame);
            }

            // Resumed only once the transport took the frames. A value stored
            // under the same key meanwhile is a new notification and stays.
            if cache.remove_if(&key, |current| *current == event) {
                debug!(id = %key, "Notification sent");
            } else {
                debug!(id = %key, "Notification sent, newer value kept");
            }
        }
    }
}

fn drain_queue(
    mut jobs: Box<dyn JobIter>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static {
    stream! {
        loop {
            let job = match jobs.try_next() {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    debug!(reason = %e, "Notification queue drain stopped");
                    break;
                }
            };

            let frames = match job_frames(&job) {
                Ok(frames) => frames,
                Err(e) => {
                    error!(id = %job.id, error = %e, "Unable to decode notification");
                    if let Err(e) = job.reject(false).await {
                        warn!(id = %job.id, error = %e, "Failed to reject notification");
                    }
                    continue;
                }
            };

            let pending = PendingJob::new(job);
            info!(id = %pending.id, "Sending notification");
            for frame in frames {
                yield Ok(frame);
            }
            pending.ack().await;
        }
    }
}

fn job_frames(job: &Job) -> Result<Vec<SseEvent>, String> {
    let event: Event = job.decode().map_err(|e| e.to_string())?;
    event_frames(&job.id, &event).map_err(|e| e.to_string())
}

/// A delivered job whose frames are on their way to the client.
///
/// Dropped unsettled (the client went away mid-stream) it is requeued.
struct PendingJob {
    id: String,
    job: Option<Job>,
}

impl PendingJob {
    fn new(job: Job) -> Self {
        Self {
            id: job.id.clone(),
            job: Some(job),
        }
    }

    async fn ack(mut self) {
        if let Some(job) = self.job.take() {
            match job.ack().await {
                Ok(()) => debug!(id = %self.id, "Notification sent"),
                Err(e) => warn!(id = %self.id, error = %e, "Failed to acknowledge notification"),
            }
        }
    }
}

impl Drop for PendingJob {
    fn drop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let id = std::mem::take(&mut self.id);
        handle.spawn(async move {
            match job.reject(true).await {
                Ok(()) => debug!(id = %id, "Undelivered notification requeued"),
                Err(e) => warn!(id = %id, error = %e, "Failed to requeue notification"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use eventsse_core::{Broker, MemoryBroker, Queue, COMPOSITION_ID_LABEL};
    use futures::StreamExt;

    fn event_job(id: &str, retries: u32) -> Job {
        let mut job = Job::new(id).unwrap().with_retries(retries);
        job.encode(&Event::new(id, "demo")).unwrap();
        job
    }

    async fn wait_for_pending(queue: &Arc<dyn Queue>, len: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.len() != len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue should reach the expected length");
    }

    #[test]
    fn test_field_validation() {
        assert!(is_valid_field("comp-a/uid-1"));
        assert!(!is_valid_field(""));
        assert!(!is_valid_field("bad\nid"));
        assert!(!is_valid_field("bad\rid"));
    }

    #[test]
    fn test_frames_without_composition() {
        let event = Event::new("e1", "demo");
        assert_eq!(event_frames("e1", &event).unwrap().len(), 1);
    }

    #[test]
    fn test_frames_with_composition() {
        let event = Event::new("e1", "demo").with_label(COMPOSITION_ID_LABEL, "comp-a");
        assert_eq!(event_frames("comp-a/e1", &event).unwrap().len(), 2);

        let event = Event::new("e1", "demo").with_label(COMPOSITION_ID_LABEL, "bad\nname");
        assert_eq!(event_frames("e1", &event).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_drain_removes_sent_events() {
        let cache = Arc::new(ExpiringCache::new());
        cache.set("e1".to_string(), Event::new("e1", "demo"), Duration::from_secs(60));
        cache.set("e2".to_string(), Event::new("e2", "demo"), Duration::from_secs(60));

        let frames: Vec<_> = drain_cache(Arc::clone(&cache)).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_drain_keeps_event_set_while_sending() {
        let cache = Arc::new(ExpiringCache::new());
        cache.set("e1".to_string(), Event::new("e1", "first"), Duration::from_secs(60));

        let mut stream = Box::pin(drain_cache(Arc::clone(&cache)));
        assert!(stream.next().await.is_some());

        let newer = Event::new("e1", "second");
        cache.set("e1".to_string(), newer.clone(), Duration::from_secs(60));
        assert!(stream.next().await.is_none());

        assert_eq!(cache.get(&"e1".to_string()), Some(newer));
    }

    #[tokio::test]
    async fn test_queue_drain_respects_window() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("notifications").unwrap();
        queue.publish(event_job("e1", 0)).await.unwrap();
        queue.publish(event_job("e2", 0)).await.unwrap();

        let jobs = queue.consume(1).await.unwrap();
        let frames: Vec<_> = drain_queue(jobs).collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_queue_drain_skips_undecodable_job() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("notifications").unwrap();
        let mut broken = Job::new("broken").unwrap().with_retries(3);
        broken.raw = b"not json".to_vec();
        queue.publish(broken).await.unwrap();
        queue.publish(event_job("e1", 0)).await.unwrap();

        let jobs = queue.consume(0).await.unwrap();
        let frames: Vec<_> = drain_queue(jobs).collect().await;
        assert_eq!(frames.len(), 1);
        // Discarded, not requeued.
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unsent_job() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("notifications").unwrap();
        queue.publish(event_job("e1", 2)).await.unwrap();

        let jobs = queue.consume(0).await.unwrap();
        let mut stream = Box::pin(drain_queue(jobs));
        assert!(stream.next().await.is_some());
        assert_eq!(queue.in_flight(), 1);

        drop(stream);
        wait_for_pending(&queue, 1).await;
        assert_eq!(queue.in_flight(), 0);

        let mut jobs = queue.consume(0).await.unwrap();
        let requeued = jobs.try_next().unwrap().unwrap();
        assert_eq!(requeued.id, "e1");
        assert_eq!(requeued.retries_remaining, 1);
    }
}
