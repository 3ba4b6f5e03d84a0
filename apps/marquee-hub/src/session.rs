//! Live device session registry for one stream kind.
//!
//! Each connected device holds exactly one session per stream kind. A
//! session owns the bounded outbound sink the network writer drains and a
//! watch-based close signal. Reconnects replace the previous session
//! (last writer wins); the replaced session is closed so its writer task
//! observes a clean end-of-stream.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Which device-facing stream a registry serves. Command and content
/// sessions are independent name spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Commands,
    Content,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Commands => "commands",
            StreamKind::Content => "content",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionSendError {
    #[error("session sink closed")]
    Closed,
    #[error("session sink full")]
    Backpressured,
}

/// One currently attached device session.
pub struct DeviceSession<F> {
    device_id: String,
    epoch: u64,
    sink: mpsc::Sender<F>,
    closed: watch::Sender<bool>,
    connected_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    resume_hint: Option<String>,
}

impl<F> DeviceSession<F> {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Monotonic attach counter, used to tell a replaced session's
    /// cleanup apart from the live session it was replaced by.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(self.connected_at)
    }

    /// Resume hint the device supplied on subscribe. Stored for the
    /// administrative surface; the hub does not replay.
    pub fn resume_hint(&self) -> Option<&str> {
        self.resume_hint.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Bump the last-activity timestamp. Monotonic within the session.
    pub fn mark_activity(&self) {
        let now = Utc::now().timestamp_millis();
        self.last_activity_ms.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Non-blocking write into the outbound sink. A full sink is the
    /// slow-consumer signal; the caller decides whether to drop the
    /// session.
    pub(crate) fn try_send(&self, frame: F) -> Result<(), SessionSendError> {
        if self.is_closed() {
            return Err(SessionSendError::Closed);
        }
        match self.sink.try_send(frame) {
            Ok(()) => {
                self.mark_activity();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SessionSendError::Backpressured),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionSendError::Closed),
        }
    }
}

/// Handed to the network side on attach: the frames to forward plus the
/// close signal that fires when the session is replaced or detached.
pub struct SessionReceiver<F> {
    pub device_id: String,
    pub epoch: u64,
    pub frames: mpsc::Receiver<F>,
    pub closed: watch::Receiver<bool>,
}

/// Row of the "list connected devices" surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub device_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_hint: Option<String>,
}

/// Registry of live sessions for one stream kind.
#[derive(Clone)]
pub struct SessionRegistry<F> {
    inner: Arc<RegistryInner<F>>,
}

struct RegistryInner<F> {
    kind: StreamKind,
    sink_capacity: usize,
    epochs: AtomicU64,
    sessions: DashMap<String, Arc<DeviceSession<F>>>,
}

impl<F: Send + 'static> SessionRegistry<F> {
    pub fn new(kind: StreamKind, sink_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                kind,
                sink_capacity: sink_capacity.max(1),
                epochs: AtomicU64::new(0),
                sessions: DashMap::new(),
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    /// Attach a device, replacing any existing session for the same id.
    /// Returns the receiver for the network writer plus the replaced
    /// session, if any, so the caller can fail its pending waiters.
    pub fn attach(
        &self,
        device_id: &str,
        resume_hint: Option<String>,
    ) -> (SessionReceiver<F>, Option<Arc<DeviceSession<F>>>) {
        debug_assert!(!device_id.is_empty(), "device id must be non-empty");
        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
        let (sink, frames) = mpsc::channel(self.inner.sink_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let now = Utc::now();
        let session = Arc::new(DeviceSession {
            device_id: device_id.to_string(),
            epoch,
            sink,
            closed: closed_tx,
            connected_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            resume_hint,
        });

        let replaced = self
            .inner
            .sessions
            .insert(device_id.to_string(), session.clone());
        if let Some(old) = replaced.as_ref() {
            old.close();
            info!(
                kind = self.inner.kind.as_str(),
                device_id, old_epoch = old.epoch, new_epoch = epoch,
                "replacing live session"
            );
        } else {
            info!(
                kind = self.inner.kind.as_str(),
                device_id, epoch, "device attached"
            );
        }

        (
            SessionReceiver {
                device_id: device_id.to_string(),
                epoch,
                frames,
                closed: closed_rx,
            },
            replaced,
        )
    }

    /// Remove and close the device's session unconditionally.
    pub fn detach(&self, device_id: &str) -> Option<Arc<DeviceSession<F>>> {
        let (_, session) = self.inner.sessions.remove(device_id)?;
        session.close();
        info!(
            kind = self.inner.kind.as_str(),
            device_id,
            epoch = session.epoch,
            "device detached"
        );
        Some(session)
    }

    /// Remove the session only if it still belongs to `epoch`. A replaced
    /// session's writer task uses this so its cleanup cannot tear down
    /// the replacement.
    pub fn detach_session(&self, device_id: &str, epoch: u64) -> Option<Arc<DeviceSession<F>>> {
        let removed = self
            .inner
            .sessions
            .remove_if(device_id, |_, session| session.epoch == epoch)?;
        let session = removed.1;
        session.close();
        debug!(
            kind = self.inner.kind.as_str(),
            device_id, epoch, "session detached by owner"
        );
        Some(session)
    }

    pub fn lookup(&self, device_id: &str) -> Option<Arc<DeviceSession<F>>> {
        self.inner
            .sessions
            .get(device_id)
            .map(|entry| entry.value().clone())
    }

    pub fn mark_activity(&self, device_id: &str) {
        if let Some(session) = self.inner.sessions.get(device_id) {
            session.mark_activity();
        }
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.inner
            .sessions
            .iter()
            .map(|entry| SessionSnapshot {
                device_id: entry.device_id.clone(),
                connected_at: entry.connected_at,
                last_activity: entry.last_activity(),
                resume_hint: entry.resume_hint.clone(),
            })
            .collect()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Close and remove every session. Used on hub shutdown.
    pub fn close_all(&self) -> Vec<Arc<DeviceSession<F>>> {
        let ids = self.device_ids();
        ids.iter().filter_map(|id| self.detach(id)).collect()
    }
}
