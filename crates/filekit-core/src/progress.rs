//! Progress events, sinks and the shared tracker.
//!
//! Long-running work owns a [`ProgressTracker`] and pushes normalized
//! [`ProgressEvent`]s into whatever [`ProgressSink`] the caller registered.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use tokio::sync::{broadcast, mpsc};

/// Free-form key/value details attached to an event.
pub type Details = BTreeMap<String, Value>;

/// A normalized progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub current: u64,
    pub total: u64,
    /// `floor(current / total * 100)`, clamped to `0..=100`.
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub details: Details,
}

impl ProgressEvent {
    pub fn new(current: u64, total: u64) -> Self {
        Self {
            current,
            total,
            percentage: percentage(current, total),
            status: None,
            details: Details::new(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

fn percentage(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (current as u128 * 100) / total as u128;
    pct.min(100) as u8
}

/// Receiver side of progress reporting.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.send(event);
    }
}

impl ProgressSink for broadcast::Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for Arc<S> {
    fn emit(&self, event: ProgressEvent) {
        (**self).emit(event);
    }
}

/// Named event stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ProgressChannel {
    Search,
    ContentSearch,
    Operation,
    Rename,
}

/// A progress event tagged with its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub channel: ProgressChannel,
    pub event: ProgressEvent,
}

/// Sink that tags events with a channel and fans them out to subscribers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    channel: ProgressChannel,
    sender: broadcast::Sender<ChannelEvent>,
}

impl ChannelSink {
    pub fn new(channel: ProgressChannel, sender: broadcast::Sender<ChannelEvent>) -> Self {
        Self { channel, sender }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(ChannelEvent {
            channel: self.channel,
            event,
        });
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct TrackerState {
    current: u64,
    total: u64,
    status: String,
    details: Details,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl TrackerState {
    fn snapshot(&self) -> ProgressEvent {
        ProgressEvent {
            current: self.current,
            total: self.total,
            percentage: percentage(self.current, self.total),
            status: Some(self.status.clone()),
            details: self.details.clone(),
        }
    }

    fn elapsed(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn record_duration(&mut self) {
        let millis = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.details
            .insert("durationMs".to_string(), Value::from(millis));
    }

    fn merge(&mut self, status: Option<&str>, details: Option<Details>) {
        if let Some(status) = status {
            self.status = status.to_string();
        }
        if let Some(details) = details {
            self.details.extend(details);
        }
    }
}

/// Stateful accumulator that emits a [`ProgressEvent`] on every change.
///
/// `current` never decreases and never exceeds `total`. `total` is at least 1
/// and may grow while work is discovered, so the percentage is an estimate
/// that can drop early in a traversal.
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("state", &*lock(&self.state))
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    pub fn new(total: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                current: 0,
                total: total.max(1),
                status: "idle".to_string(),
                details: Details::new(),
                started: None,
                finished: None,
            }),
            sink,
        }
    }

    fn publish(&self, state: &TrackerState) {
        self.sink.emit(state.snapshot());
    }

    /// Mark the start time and emit the first event.
    pub fn start(&self) {
        let mut state = lock(&self.state);
        state.started = Some(Instant::now());
        state.status = "running".to_string();
        self.publish(&state);
    }

    /// Advance by `increment`.
    pub fn update(&self, increment: u64, status: Option<&str>, details: Option<Details>) {
        let mut state = lock(&self.state);
        state.current = state.current.saturating_add(increment).min(state.total);
        state.merge(status, details);
        self.publish(&state);
    }

    /// Inflate the estimated total, e.g. when a directory turns out to have more entries.
    pub fn grow_total(&self, additional: u64) {
        let mut state = lock(&self.state);
        state.total = state.total.saturating_add(additional);
    }

    /// Finish successfully; `current` jumps to `total`.
    pub fn complete(&self, status: Option<&str>, details: Option<Details>) {
        let mut state = lock(&self.state);
        state.current = state.total;
        state.merge(Some(status.unwrap_or("completed")), details);
        state.finished = Some(Instant::now());
        state.record_duration();
        self.publish(&state);
    }

    /// Finish with an error message.
    pub fn fail(&self, message: &str, details: Option<Details>) {
        let mut state = lock(&self.state);
        state.merge(Some("error"), details);
        state.finished = Some(Instant::now());
        state
            .details
            .insert("error".to_string(), Value::from(message.to_string()));
        state.record_duration();
        self.publish(&state);
    }

    /// Current state without emitting.
    pub fn snapshot(&self) -> ProgressEvent {
        lock(&self.state).snapshot()
    }
}

/// Build a [`Details`] map from key/value pairs.
pub fn details<I, K, V>(pairs: I) -> Details
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
