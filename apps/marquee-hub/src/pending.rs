//! Waiters for in-flight acknowledgement-required dispatches.
//!
//! The table is keyed device id -> correlation id. Every completion path
//! (terminal ack, timeout, disconnect, shutdown, cancel) funnels through
//! the same take-then-resolve step: the waiter is first removed from the
//! table, then its outcome slot is written. Removal is the linearization
//! point, so the slot is written exactly once no matter how the paths
//! race.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::session::StreamKind;

/// Final state of one acknowledgement-required dispatch.
#[derive(Debug)]
pub enum AckOutcome<A> {
    /// The device reported a terminal acknowledgement.
    Acked(A),
    TimedOut,
    Disconnected,
    Cancelled,
    ShuttingDown,
}

/// Reason a device's waiters are being failed wholesale.
#[derive(Debug, Clone, Copy)]
pub enum FailReason {
    Disconnected,
    ShuttingDown,
}

/// What happened to a delivered acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A terminal ack resolved its waiter.
    Completed,
    /// A progress ack was forwarded (or absorbed when no sink is attached).
    Progress,
    /// No waiter matched; the ack was dropped.
    Dropped,
}

struct Waiter<A> {
    /// Distinguishes this registration from successors reusing the same
    /// correlation id, so a stale timeout cannot take a newer waiter.
    id: u64,
    outcome_tx: oneshot::Sender<AckOutcome<A>>,
    progress_tx: Option<mpsc::UnboundedSender<A>>,
    timeout_task: Option<JoinHandle<()>>,
    registered_at: Instant,
}

impl<A> Waiter<A> {
    fn resolve(mut self, outcome: AckOutcome<A>) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        let _ = self.outcome_tx.send(outcome);
    }
}

/// Handle the dispatcher holds while awaiting an acknowledgement.
///
/// Dropping the handle before an outcome was observed cancels the
/// registration, so an abandoned administrative call cannot leak its
/// waiter.
pub struct AckWaiter<A> {
    table: PendingAckTable<A>,
    device_id: String,
    correlation_id: String,
    outcome_rx: oneshot::Receiver<AckOutcome<A>>,
    progress_rx: Option<mpsc::UnboundedReceiver<A>>,
    resolved: bool,
}

impl<A> AckWaiter<A> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Take the progress stream. Present only for registrations made
    /// with `with_progress`.
    pub fn take_progress(&mut self) -> Option<mpsc::UnboundedReceiver<A>> {
        self.progress_rx.take()
    }

    /// Await the final outcome. Resolves exactly once.
    pub async fn outcome(&mut self) -> AckOutcome<A> {
        let outcome = (&mut self.outcome_rx)
            .await
            .unwrap_or(AckOutcome::Cancelled);
        self.resolved = true;
        outcome
    }
}

impl<A> Drop for AckWaiter<A> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // An unread buffered outcome means this waiter was already taken
        // (replaced or failed); cancelling now would hit a successor
        // registered under the same keys.
        if matches!(self.outcome_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            self.table.cancel(&self.device_id, &self.correlation_id);
        }
    }
}

/// Table of outstanding waiters for one stream kind.
pub struct PendingAckTable<A> {
    inner: Arc<PendingInner<A>>,
}

impl<A> Clone for PendingAckTable<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PendingInner<A> {
    kind: StreamKind,
    waiters: DashMap<String, HashMap<String, Waiter<A>>>,
    next_waiter_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl<A> PendingAckTable<A> {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            inner: Arc::new(PendingInner {
                kind,
                waiters: DashMap::new(),
                next_waiter_id: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    /// Attach a freshly spawned timer to its waiter. If the waiter was
    /// already resolved or replaced in the window since insertion, the
    /// timer is dead weight: abort it and let the id check catch any
    /// sleep that slipped through.
    fn arm_timeout(
        &self,
        device_id: &str,
        correlation_id: &str,
        waiter_id: u64,
        task: JoinHandle<()>,
    ) {
        if let Some(mut entries) = self.inner.waiters.get_mut(device_id) {
            if let Some(waiter) = entries.get_mut(correlation_id) {
                if waiter.id == waiter_id {
                    waiter.timeout_task = Some(task);
                    return;
                }
            }
        }
        task.abort();
    }

    /// Timeout path: resolve only the registration the timer was armed
    /// for, never a successor reusing the same correlation id.
    fn expire(&self, device_id: &str, correlation_id: &str, waiter_id: u64) {
        let waiter = {
            let Some(mut entries) = self.inner.waiters.get_mut(device_id) else {
                return;
            };
            match entries.get(correlation_id) {
                Some(waiter) if waiter.id == waiter_id => entries.remove(correlation_id),
                _ => None,
            }
        };
        if let Some(waiter) = waiter {
            debug!(
                kind = self.inner.kind.as_str(),
                device_id, correlation_id, "waiter timed out"
            );
            waiter.resolve(AckOutcome::TimedOut);
            self.inner
                .waiters
                .remove_if(device_id, |_, entries| entries.is_empty());
        }
    }

    /// Remove one waiter. The caller writes the outcome slot; whoever wins
    /// the removal owns the resolution.
    fn take(&self, device_id: &str, correlation_id: &str) -> Option<Waiter<A>> {
        let mut entries = self.inner.waiters.get_mut(device_id)?;
        let waiter = entries.remove(correlation_id);
        let emptied = entries.is_empty();
        drop(entries);
        if emptied {
            self.inner
                .waiters
                .remove_if(device_id, |_, entries| entries.is_empty());
        }
        waiter
    }
}

impl<A: Send + 'static> PendingAckTable<A> {
    /// Register a waiter. The timeout clock starts now; progress acks do
    /// not reset it. A colliding registration for the same device and
    /// correlation id replaces the old waiter, which resolves `Cancelled`.
    pub fn register(
        &self,
        device_id: &str,
        correlation_id: &str,
        timeout: Duration,
        with_progress: bool,
    ) -> AckWaiter<A> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = if with_progress {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        if self.inner.shutting_down.load(Ordering::Acquire) {
            let _ = outcome_tx.send(AckOutcome::ShuttingDown);
            return AckWaiter {
                table: self.clone(),
                device_id: device_id.to_string(),
                correlation_id: correlation_id.to_string(),
                outcome_rx,
                progress_rx,
                resolved: false,
            };
        }

        let waiter_id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let waiter = Waiter {
            id: waiter_id,
            outcome_tx,
            progress_tx,
            timeout_task: None,
            registered_at: Instant::now(),
        };

        // Insert before arming the timer so a zero timeout cannot fire
        // into an empty slot and leave the waiter without a deadline.
        let replaced = self
            .inner
            .waiters
            .entry(device_id.to_string())
            .or_default()
            .insert(correlation_id.to_string(), waiter);
        if let Some(old) = replaced {
            warn!(
                kind = self.inner.kind.as_str(),
                device_id, correlation_id, "correlation id collision, cancelling older waiter"
            );
            old.resolve(AckOutcome::Cancelled);
        }

        let timeout_task = {
            let table = self.clone();
            let device_id = device_id.to_string();
            let correlation_id = correlation_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                table.expire(&device_id, &correlation_id, waiter_id);
            })
        };
        self.arm_timeout(device_id, correlation_id, waiter_id, timeout_task);

        AckWaiter {
            table: self.clone(),
            device_id: device_id.to_string(),
            correlation_id: correlation_id.to_string(),
            outcome_rx,
            progress_rx,
            resolved: false,
        }
    }
}

impl<A> PendingAckTable<A> {
    /// Route one acknowledgement. Non-terminal acks flow to the progress
    /// sink and leave the waiter (and its timeout) in place; terminal acks
    /// take the waiter and write the outcome slot.
    pub fn deliver(
        &self,
        device_id: &str,
        correlation_id: &str,
        ack: A,
        terminal: bool,
    ) -> Delivery {
        if !terminal {
            let Some(entries) = self.inner.waiters.get(device_id) else {
                return Delivery::Dropped;
            };
            let Some(waiter) = entries.get(correlation_id) else {
                return Delivery::Dropped;
            };
            if let Some(progress) = waiter.progress_tx.as_ref() {
                let _ = progress.send(ack);
            }
            return Delivery::Progress;
        }

        match self.take(device_id, correlation_id) {
            Some(waiter) => {
                debug!(
                    kind = self.inner.kind.as_str(),
                    device_id,
                    correlation_id,
                    waited_ms = waiter.registered_at.elapsed().as_millis() as u64,
                    "terminal ack resolved waiter"
                );
                waiter.resolve(AckOutcome::Acked(ack));
                Delivery::Completed
            }
            None => Delivery::Dropped,
        }
    }

    /// Resolve one waiter as cancelled. Idempotent.
    pub fn cancel(&self, device_id: &str, correlation_id: &str) -> bool {
        match self.take(device_id, correlation_id) {
            Some(waiter) => {
                waiter.resolve(AckOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Fail every waiter registered for one device. Invoked on session
    /// detach and replacement.
    pub fn fail_all_for_device(&self, device_id: &str, reason: FailReason) {
        let Some((_, entries)) = self.inner.waiters.remove(device_id) else {
            return;
        };
        let count = entries.len();
        if count > 0 {
            debug!(
                kind = self.inner.kind.as_str(),
                device_id,
                count,
                reason = ?reason,
                "failing waiters for device"
            );
        }
        for (_, waiter) in entries {
            waiter.resolve(match reason {
                FailReason::Disconnected => AckOutcome::Disconnected,
                FailReason::ShuttingDown => AckOutcome::ShuttingDown,
            });
        }
    }

    /// Resolve every waiter as shutting down and refuse new registrations.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let devices: Vec<String> = self
            .inner
            .waiters
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for device_id in devices {
            self.fail_all_for_device(&device_id, FailReason::ShuttingDown);
        }
    }

    /// Number of outstanding waiters for one device.
    pub fn pending_for(&self, device_id: &str) -> usize {
        self.inner
            .waiters
            .get(device_id)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PendingAckTable<&'static str> {
        PendingAckTable::new(StreamKind::Commands)
    }

    #[tokio::test]
    async fn terminal_ack_resolves_waiter() {
        let table = table();
        let mut waiter = table.register("d1", "c1", Duration::from_secs(5), false);
        assert_eq!(table.deliver("d1", "c1", "done", true), Delivery::Completed);
        assert!(matches!(waiter.outcome().await, AckOutcome::Acked("done")));
        assert_eq!(table.pending_for("d1"), 0);
    }

    #[tokio::test]
    async fn progress_flows_before_terminal() {
        let table = table();
        let mut waiter = table.register("d1", "c1", Duration::from_secs(5), true);
        let mut progress = waiter.take_progress().unwrap();

        assert_eq!(
            table.deliver("d1", "c1", "received", false),
            Delivery::Progress
        );
        assert_eq!(table.deliver("d1", "c1", "done", true), Delivery::Completed);

        assert_eq!(progress.recv().await, Some("received"));
        assert!(matches!(waiter.outcome().await, AckOutcome::Acked("done")));
        // Progress channel ends once the waiter is gone.
        assert_eq!(progress.recv().await, None);
    }

    #[tokio::test]
    async fn timeout_fires_and_late_ack_is_dropped() {
        let table = table();
        let mut waiter = table.register("d1", "c1", Duration::from_millis(20), false);
        assert!(matches!(waiter.outcome().await, AckOutcome::TimedOut));
        assert_eq!(table.deliver("d1", "c1", "late", true), Delivery::Dropped);
    }

    #[tokio::test]
    async fn zero_timeout_still_registers() {
        let table = table();
        let mut waiter = table.register("d1", "c1", Duration::ZERO, false);
        assert!(matches!(waiter.outcome().await, AckOutcome::TimedOut));
    }

    #[tokio::test]
    async fn duplicate_terminal_ack_is_noop() {
        let table = table();
        let mut waiter = table.register("d1", "c1", Duration::from_secs(5), false);
        assert_eq!(table.deliver("d1", "c1", "done", true), Delivery::Completed);
        assert_eq!(table.deliver("d1", "c1", "done", true), Delivery::Dropped);
        assert_eq!(table.deliver("d1", "c1", "more", false), Delivery::Dropped);
        assert!(matches!(waiter.outcome().await, AckOutcome::Acked("done")));
    }

    #[tokio::test]
    async fn colliding_registration_cancels_older() {
        let table = table();
        let mut first = table.register("d1", "c1", Duration::from_secs(5), false);
        let mut second = table.register("d1", "c1", Duration::from_secs(5), false);

        assert!(matches!(first.outcome().await, AckOutcome::Cancelled));
        assert_eq!(table.deliver("d1", "c1", "done", true), Delivery::Completed);
        assert!(matches!(second.outcome().await, AckOutcome::Acked("done")));
    }

    #[tokio::test]
    async fn fail_all_for_device_resolves_disconnected() {
        let table = table();
        let mut w1 = table.register("d1", "c1", Duration::from_secs(5), false);
        let mut w2 = table.register("d1", "c2", Duration::from_secs(5), false);
        let mut other = table.register("d2", "c9", Duration::from_secs(5), false);

        table.fail_all_for_device("d1", FailReason::Disconnected);
        assert!(matches!(w1.outcome().await, AckOutcome::Disconnected));
        assert!(matches!(w2.outcome().await, AckOutcome::Disconnected));
        assert_eq!(table.pending_for("d1"), 0);
        assert_eq!(table.pending_for("d2"), 1);

        assert_eq!(table.deliver("d2", "c9", "done", true), Delivery::Completed);
        assert!(matches!(other.outcome().await, AckOutcome::Acked("done")));
    }

    #[tokio::test]
    async fn shutdown_drains_and_refuses_new_waiters() {
        let table = table();
        let mut pending = table.register("d1", "c1", Duration::from_secs(5), false);
        table.shutdown();
        assert!(matches!(pending.outcome().await, AckOutcome::ShuttingDown));

        let mut refused = table.register("d2", "c2", Duration::from_secs(5), false);
        assert!(matches!(refused.outcome().await, AckOutcome::ShuttingDown));
        assert_eq!(table.pending_for("d2"), 0);
    }

    #[tokio::test]
    async fn dropping_waiter_cancels_registration() {
        let table = table();
        let waiter = table.register("d1", "c1", Duration::from_secs(5), false);
        assert_eq!(table.pending_for("d1"), 1);
        drop(waiter);
        assert_eq!(table.pending_for("d1"), 0);
        assert_eq!(table.deliver("d1", "c1", "done", true), Delivery::Dropped);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let table = table();
        let mut waiter = table.register("d1", "c1", Duration::from_secs(5), false);
        assert!(table.cancel("d1", "c1"));
        assert!(!table.cancel("d1", "c1"));
        assert!(matches!(waiter.outcome().await, AckOutcome::Cancelled));
    }
}
