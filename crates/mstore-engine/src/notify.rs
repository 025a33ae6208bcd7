//! In-process change notifications
//!
//! [`ChangeNotifier`] fans a [`ChangeEvent`] out to every registered callback,
//! synchronous or asynchronous. A callback that returns an error or panics is
//! logged and skipped; the remaining callbacks still run. Named events
//! (`data_changed` and friends) carry a plain argument list instead.
//!
//! [`ChangeBuffer`] batches events and delivers them once writes have been
//! quiet for `buffer_time`.

use chrono::{DateTime, Utc};
use derive_more::Display;
use futures::FutureExt;
use futures::future::BoxFuture;
use mstore_common::{NotificationConfig, Value};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Named event fired by the key/value adapter after a write
pub const EVENT_DATA_CHANGED: &str = "data_changed";

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
pub type CallbackResult = Result<(), CallbackError>;

type SyncFn<T> = Arc<dyn Fn(&T) -> CallbackResult + Send + Sync>;
type AsyncFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, CallbackResult> + Send + Sync>;

/// Handle returned on registration, used to remove the callback again
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("callback-{_0}")]
pub struct CallbackId(u64);

/// A registered callable receiving payloads of type `T`
pub enum Callback<T> {
    Sync(SyncFn<T>),
    Async(AsyncFn<T>),
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<T: Send + 'static> Callback<T> {
    /// Wrap a synchronous callable
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&T) -> CallbackResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Wrap an asynchronous callable
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |payload| f(payload).boxed()))
    }
}

impl<T: Clone + Send + 'static> Callback<T> {
    /// Run the callback, converting errors and panics into a message
    async fn invoke(&self, payload: &T) -> Result<(), String> {
        let outcome = match self {
            Self::Sync(f) => catch_unwind(AssertUnwindSafe(|| f(payload))),
            Self::Async(f) => match catch_unwind(AssertUnwindSafe(|| f(payload.clone()))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            },
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("panicked: {}", panic_message(&*panic))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// A field-level change delivered to callbacks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub key: String,
    pub field: String,
    /// `None` if the field did not exist before
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub identity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        key: impl Into<String>,
        field: impl Into<String>,
        old_value: Option<Value>,
        new_value: Value,
        identity_id: Option<&str>,
    ) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
            old_value,
            new_value,
            identity_id: identity_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

type Registered<T> = Vec<(CallbackId, Callback<T>)>;

/// Broadcasts changes and named events to registered callbacks
#[derive(Default)]
pub struct ChangeNotifier {
    next_id: AtomicU64,
    callbacks: Mutex<Registered<ChangeEvent>>,
    event_callbacks: Mutex<HashMap<String, Registered<Vec<Value>>>>,
}

impl ChangeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> CallbackId {
        CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a field-level change callback
    pub fn add_callback(&self, callback: Callback<ChangeEvent>) -> CallbackId {
        let id = self.next_id();
        self.callbacks.lock().push((id, callback));
        id
    }

    /// Register a callback for a named event
    pub fn on_event(&self, event_type: &str, callback: Callback<Vec<Value>>) -> CallbackId {
        let id = self.next_id();
        self.event_callbacks
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove a change or named-event callback; true if it was registered
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        {
            let mut callbacks = self.callbacks.lock();
            if let Some(pos) = callbacks.iter().position(|(cid, _)| *cid == id) {
                callbacks.remove(pos);
                return true;
            }
        }

        let mut events = self.event_callbacks.lock();
        for registered in events.values_mut() {
            if let Some(pos) = registered.iter().position(|(cid, _)| *cid == id) {
                registered.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver a change to every callback
    pub async fn notify_change(
        &self,
        key: &str,
        field: &str,
        old_value: Option<Value>,
        new_value: Value,
        identity_id: Option<&str>,
    ) {
        if self.callbacks.lock().is_empty() {
            return;
        }
        self.notify(&ChangeEvent::new(key, field, old_value, new_value, identity_id))
            .await;
    }

    /// Deliver a prepared event to every callback
    pub async fn notify(&self, event: &ChangeEvent) {
        let callbacks = self.callbacks.lock().clone();
        for (id, callback) in callbacks {
            if let Err(e) = callback.invoke(event).await {
                warn!("Change callback {id} failed for {}.{}: {e}", event.key, event.field);
            }
        }
    }

    /// Invoke the callbacks registered for `event_type` with `args`
    pub async fn trigger_event(&self, event_type: &str, args: Vec<Value>) {
        let callbacks = self
            .event_callbacks
            .lock()
            .get(event_type)
            .cloned()
            .unwrap_or_default();
        for (id, callback) in callbacks {
            if let Err(e) = callback.invoke(&args).await {
                warn!("Event callback {id} failed for '{event_type}': {e}");
            }
        }
    }

    /// Number of field-level change callbacks
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    #[must_use]
    pub fn event_callback_count(&self, event_type: &str) -> usize {
        self.event_callbacks.lock().get(event_type).map_or(0, Vec::len)
    }

    /// Remove the field-level change callbacks
    pub fn clear_callbacks(&self) {
        self.callbacks.lock().clear();
    }

    /// Remove every callback, named events included
    pub fn cleanup(&self) {
        self.callbacks.lock().clear();
        self.event_callbacks.lock().clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStats {
    pub buffered_changes: usize,
    pub buffer_time: Duration,
    /// Age of the oldest buffered change, zero when empty
    pub oldest_change_age: Duration,
}

#[derive(Default)]
struct BufferState {
    changes: Vec<ChangeEvent>,
    last_change: Option<Instant>,
    /// An auto-flush task is running
    scheduled: bool,
}

struct BufferInner {
    notifier: Arc<ChangeNotifier>,
    buffer_time: Duration,
    state: Mutex<BufferState>,
    batch_callbacks: Mutex<Vec<Callback<Vec<ChangeEvent>>>>,
    shutdown: watch::Sender<bool>,
}

impl BufferInner {
    async fn flush(&self) -> usize {
        let changes = std::mem::take(&mut self.state.lock().changes);
        if changes.is_empty() {
            return 0;
        }

        let batch_callbacks = self.batch_callbacks.lock().clone();
        for callback in batch_callbacks {
            if let Err(e) = callback.invoke(&changes).await {
                warn!("Batch callback failed for {} changes: {e}", changes.len());
            }
        }
        for change in &changes {
            self.notifier.notify(change).await;
        }

        debug!("Flushed {} buffered changes", changes.len());
        changes.len()
    }
}

/// Debounced change batching on top of a [`ChangeNotifier`]
pub struct ChangeBuffer {
    inner: Arc<BufferInner>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeBuffer {
    #[must_use]
    pub fn new(notifier: Arc<ChangeNotifier>, buffer_time: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BufferInner {
                notifier,
                buffer_time,
                state: Mutex::new(BufferState::default()),
                batch_callbacks: Mutex::new(Vec::new()),
                shutdown,
            }),
            flush_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn from_config(notifier: Arc<ChangeNotifier>, config: &NotificationConfig) -> Self {
        Self::new(notifier, config.buffer_time())
    }

    /// Register a callback that receives each flushed batch
    pub fn add_batch_callback(&self, callback: Callback<Vec<ChangeEvent>>) {
        self.inner.batch_callbacks.lock().push(callback);
    }

    /// Buffer a change and schedule an auto-flush once `buffer_time` passes
    /// without further changes
    pub async fn add_change(
        &self,
        key: &str,
        field: &str,
        old_value: Option<Value>,
        new_value: Value,
        identity_id: Option<&str>,
    ) {
        let spawn = {
            let mut state = self.inner.state.lock();
            state
                .changes
                .push(ChangeEvent::new(key, field, old_value, new_value, identity_id));
            state.last_change = Some(Instant::now());
            !std::mem::replace(&mut state.scheduled, true)
        };

        if spawn {
            let handle = tokio::spawn(auto_flush(Arc::clone(&self.inner)));
            *self.flush_task.lock() = Some(handle);
        }
    }

    /// Deliver every buffered change now; returns how many were delivered
    pub async fn flush(&self) -> usize {
        self.inner.flush().await
    }

    /// Stop the pending auto-flush and deliver what is left
    pub async fn cleanup(&self) {
        self.inner.shutdown.send_replace(true);
        let task = self.flush_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Change buffer flush task failed: {e}");
        }
        self.inner.flush().await;
    }

    /// Drop buffered changes without delivering them
    pub fn clear(&self) {
        self.inner.state.lock().changes.clear();
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let state = self.inner.state.lock();
        let now = Utc::now();
        let oldest_change_age = state
            .changes
            .iter()
            .map(|change| change.timestamp)
            .min()
            .and_then(|oldest| (now - oldest).to_std().ok())
            .unwrap_or_default();
        BufferStats {
            buffered_changes: state.changes.len(),
            buffer_time: self.inner.buffer_time,
            oldest_change_age,
        }
    }
}

impl Drop for ChangeBuffer {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
    }
}

/// Wait for a quiet period, flush, and repeat until the buffer is empty
async fn auto_flush(inner: Arc<BufferInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let deadline = {
            let mut state = inner.state.lock();
            match state.last_change {
                Some(last) if !state.changes.is_empty() => last + inner.buffer_time,
                _ => {
                    state.scheduled = false;
                    return;
                }
            }
        };

        if Instant::now() < deadline {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    inner.state.lock().scheduled = false;
                    return;
                }
            }
            continue;
        }

        inner.flush().await;
    }
}
