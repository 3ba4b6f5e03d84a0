//! Command-and-content dispatch engine.
//!
//! Translates one administrative "send" intent into session writes plus
//! pending-ack waiters and shapes the per-device result the caller gets
//! back. One dispatcher instance serves one stream kind; commands and
//! content share the engine through the [`Frame`] / [`Acknowledgement`]
//! seams.
//!
//! Per-device conditions are data, not errors: the only failure the
//! engine surfaces out-of-band is a fan-out against an unknown fleet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use marquee_proto::{CommandAck, CommandFrame, ContentAck, ContentFrame};

use crate::fleets::FleetDirectory;
use crate::pending::{AckOutcome, AckWaiter, FailReason, PendingAckTable};
use crate::session::{
    DeviceSession, SessionReceiver, SessionRegistry, SessionSendError, StreamKind,
};
use crate::stream::{run_fan_out_stream, run_unary_stream, DispatchEvent};

/// Buffered events per streaming dispatch before the producer yields.
pub const STREAM_EVENT_BUFFER: usize = 64;

/// Outbound message on a device stream, as the dispatcher sees it.
pub trait Frame: Clone + Send + Sync + 'static {
    fn correlation_id(&self) -> &str;
    fn requires_ack(&self) -> bool;
}

/// Inbound acknowledgement, as the router and dispatcher see it.
pub trait Acknowledgement: Clone + Send + Sync + 'static {
    fn correlation_id(&self) -> &str;
    fn disposition(&self) -> AckDisposition;
    fn status_label(&self) -> &'static str;
    fn message(&self) -> Option<&str>;
}

/// How an acknowledgement status folds into the dispatch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    Progress,
    Completed,
    Failed,
    Rejected,
}

impl AckDisposition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckDisposition::Progress)
    }
}

impl Frame for CommandFrame {
    fn correlation_id(&self) -> &str {
        &self.command_id
    }

    fn requires_ack(&self) -> bool {
        self.requires_ack
    }
}

impl Frame for ContentFrame {
    fn correlation_id(&self) -> &str {
        &self.delivery_id
    }

    fn requires_ack(&self) -> bool {
        self.requires_ack
    }
}

impl Acknowledgement for CommandAck {
    fn correlation_id(&self) -> &str {
        &self.command_id
    }

    fn disposition(&self) -> AckDisposition {
        use marquee_proto::CommandAckStatus as S;
        match self.status {
            S::Unspecified | S::Received => AckDisposition::Progress,
            S::Completed => AckDisposition::Completed,
            S::Failed => AckDisposition::Failed,
            S::Rejected => AckDisposition::Rejected,
        }
    }

    fn status_label(&self) -> &'static str {
        self.status.as_str()
    }

    fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl Acknowledgement for ContentAck {
    fn correlation_id(&self) -> &str {
        &self.delivery_id
    }

    fn disposition(&self) -> AckDisposition {
        use marquee_proto::ContentAckStatus as S;
        match self.status {
            S::Unspecified | S::Received | S::InProgress => AckDisposition::Progress,
            S::Completed => AckDisposition::Completed,
            // Partial landed but lost media; it is a failure with the
            // device's message surfaced alongside the full ack.
            S::Partial | S::Failed => AckDisposition::Failed,
        }
    }

    fn status_label(&self) -> &'static str {
        self.status.as_str()
    }

    fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Per-device outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed,
    Failed(String),
    Rejected(String),
    Timeout,
    NotConnected,
    Disconnected,
    Cancelled,
    ShuttingDown,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Completed)
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, DispatchOutcome::Timeout)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Completed => "completed",
            DispatchOutcome::Failed(_) => "failed",
            DispatchOutcome::Rejected(_) => "rejected",
            DispatchOutcome::Timeout => "timeout",
            DispatchOutcome::NotConnected => "not_connected",
            DispatchOutcome::Disconnected => "disconnected",
            DispatchOutcome::Cancelled => "cancelled",
            DispatchOutcome::ShuttingDown => "shutting_down",
        }
    }
}

/// What one device did with one dispatched frame.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDispatch<A> {
    pub device_id: String,
    pub correlation_id: String,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
    pub success: bool,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_ack: Option<A>,
}

impl<A> DeviceDispatch<A> {
    pub fn new(
        device_id: &str,
        correlation_id: &str,
        outcome: DispatchOutcome,
        final_ack: Option<A>,
    ) -> Self {
        let success = outcome.is_success();
        let timed_out = outcome.timed_out();
        Self {
            device_id: device_id.to_string(),
            correlation_id: correlation_id.to_string(),
            outcome,
            success,
            timed_out,
            final_ack,
        }
    }
}

/// Aggregate of one fan-out. Individual device failures never fail the
/// aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct FleetDispatchReport<A> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fleet_id: Option<String>,
    pub target_devices: u32,
    pub successful: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub failed_devices: Vec<String>,
    pub results: Vec<DeviceDispatch<A>>,
}

impl<A> FleetDispatchReport<A> {
    pub fn from_results(fleet_id: Option<String>, results: Vec<DeviceDispatch<A>>) -> Self {
        let mut successful = 0;
        let mut failed = 0;
        let mut timed_out = 0;
        let mut failed_devices = Vec::new();
        for result in &results {
            if result.success {
                successful += 1;
            } else {
                failed += 1;
                failed_devices.push(result.device_id.clone());
            }
            if result.timed_out {
                timed_out += 1;
            }
        }
        Self {
            fleet_id,
            target_devices: results.len() as u32,
            successful,
            failed,
            timed_out,
            failed_devices,
            results,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("fleet not found: {0}")]
    FleetNotFound(String),
}

pub(crate) enum SendPhase<A> {
    Immediate(DeviceDispatch<A>),
    Waiting {
        waiter: AckWaiter<A>,
        progress: Option<mpsc::UnboundedReceiver<A>>,
    },
}

/// Dispatch engine for one stream kind.
#[derive(Clone)]
pub struct Dispatcher<F, A> {
    registry: SessionRegistry<F>,
    pending: PendingAckTable<A>,
    fleets: Arc<dyn FleetDirectory>,
    shutting_down: Arc<AtomicBool>,
}

impl<F: Frame, A: Acknowledgement> Dispatcher<F, A> {
    pub fn new(
        registry: SessionRegistry<F>,
        pending: PendingAckTable<A>,
        fleets: Arc<dyn FleetDirectory>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            pending,
            fleets,
            shutting_down,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.registry.kind()
    }

    pub fn registry(&self) -> &SessionRegistry<F> {
        &self.registry
    }

    pub fn pending(&self) -> &PendingAckTable<A> {
        &self.pending
    }

    /// Attach a device session, failing any waiters left on a replaced
    /// session so they resolve `Disconnected` promptly rather than at
    /// their original timeouts. The old session is torn down before the
    /// replacement is inserted, so a dispatch racing the reconnect can
    /// never have its waiter swept away with the stale ones.
    pub fn attach(&self, device_id: &str, resume_hint: Option<String>) -> SessionReceiver<F> {
        self.detach(device_id);
        let (receiver, _) = self.registry.attach(device_id, resume_hint);
        receiver
    }

    pub fn detach(&self, device_id: &str) {
        if self.registry.detach(device_id).is_some() {
            self.pending
                .fail_all_for_device(device_id, FailReason::Disconnected);
        }
    }

    /// Epoch-guarded detach used by a session's own writer task, so a
    /// replaced session's cleanup cannot tear down its replacement.
    pub fn detach_session(&self, device_id: &str, epoch: u64) {
        if self.registry.detach_session(device_id, epoch).is_some() {
            self.pending
                .fail_all_for_device(device_id, FailReason::Disconnected);
        }
    }

    /// Send one frame to one device and wait for its outcome.
    pub async fn dispatch(&self, device_id: &str, frame: F, timeout: Duration) -> DeviceDispatch<A> {
        match self.begin(device_id, frame, timeout, false) {
            SendPhase::Immediate(result) => result,
            SendPhase::Waiting { mut waiter, .. } => {
                let correlation_id = waiter.correlation_id().to_string();
                let outcome = waiter.outcome().await;
                self.conclude(device_id, &correlation_id, outcome)
            }
        }
    }

    /// Fan one intent out to every connected device. The frame builder is
    /// invoked once per device so each send carries its own correlation id.
    pub async fn dispatch_all<B>(&self, build: B, timeout: Duration) -> FleetDispatchReport<A>
    where
        B: Fn(&str) -> F + Sync,
    {
        let devices = self.registry.device_ids();
        self.fan_out(None, devices, &build, timeout).await
    }

    /// Fan one intent out to a named fleet. Membership is snapshotted
    /// once, before any write happens.
    pub async fn dispatch_fleet<B>(
        &self,
        fleet_id: &str,
        build: B,
        timeout: Duration,
    ) -> Result<FleetDispatchReport<A>, DispatchError>
    where
        B: Fn(&str) -> F + Sync,
    {
        let members = self
            .fleets
            .members_of(fleet_id)
            .ok_or_else(|| DispatchError::FleetNotFound(fleet_id.to_string()))?;
        Ok(self
            .fan_out(Some(fleet_id.to_string()), members, &build, timeout)
            .await)
    }

    /// Streaming variant of [`dispatch`]: progress acks surface as events
    /// before the terminal resolution. Dropping the receiver cancels the
    /// outstanding waiter best-effort.
    pub fn dispatch_stream(
        &self,
        device_id: &str,
        frame: F,
        timeout: Duration,
    ) -> mpsc::Receiver<DispatchEvent<A>> {
        let (tx, rx) = mpsc::channel(STREAM_EVENT_BUFFER);
        let dispatcher = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            run_unary_stream(dispatcher, device_id, frame, timeout, tx).await;
        });
        rx
    }

    pub fn dispatch_all_stream<B>(
        &self,
        build: B,
        timeout: Duration,
    ) -> mpsc::Receiver<DispatchEvent<A>>
    where
        B: Fn(&str) -> F + Send + Sync + 'static,
    {
        let devices = self.registry.device_ids();
        self.spawn_fan_out_stream(None, devices, build, timeout)
    }

    /// Streaming fleet fan-out. Unknown fleets fail synchronously, before
    /// any outbound write.
    pub fn dispatch_fleet_stream<B>(
        &self,
        fleet_id: &str,
        build: B,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<DispatchEvent<A>>, DispatchError>
    where
        B: Fn(&str) -> F + Send + Sync + 'static,
    {
        let members = self
            .fleets
            .members_of(fleet_id)
            .ok_or_else(|| DispatchError::FleetNotFound(fleet_id.to_string()))?;
        Ok(self.spawn_fan_out_stream(Some(fleet_id.to_string()), members, build, timeout))
    }

    fn spawn_fan_out_stream<B>(
        &self,
        fleet_id: Option<String>,
        devices: Vec<String>,
        build: B,
        timeout: Duration,
    ) -> mpsc::Receiver<DispatchEvent<A>>
    where
        B: Fn(&str) -> F + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_EVENT_BUFFER);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            run_fan_out_stream(dispatcher, fleet_id, devices, Arc::new(build), timeout, tx).await;
        });
        rx
    }

    async fn fan_out(
        &self,
        fleet_id: Option<String>,
        devices: Vec<String>,
        build: &(dyn Fn(&str) -> F + Sync),
        timeout: Duration,
    ) -> FleetDispatchReport<A> {
        let sends = devices.iter().map(|device_id| {
            let frame = build(device_id);
            async move { self.dispatch(device_id, frame, timeout).await }
        });
        let results = join_all(sends).await;
        FleetDispatchReport::from_results(fleet_id, results)
    }

    /// First half of a dispatch: resolve the session, write the frame and
    /// register the waiter. Registration happens before the write so an
    /// ack racing the write cannot be lost.
    pub(crate) fn begin(
        &self,
        device_id: &str,
        frame: F,
        timeout: Duration,
        with_progress: bool,
    ) -> SendPhase<A> {
        let correlation_id = frame.correlation_id().to_string();
        if self.shutting_down.load(Ordering::Acquire) {
            return SendPhase::Immediate(self.record(DeviceDispatch::new(
                device_id,
                &correlation_id,
                DispatchOutcome::ShuttingDown,
                None,
            )));
        }
        let Some(session) = self.registry.lookup(device_id) else {
            return SendPhase::Immediate(self.record(DeviceDispatch::new(
                device_id,
                &correlation_id,
                DispatchOutcome::NotConnected,
                None,
            )));
        };
        if session.is_closed() {
            return SendPhase::Immediate(self.record(DeviceDispatch::new(
                device_id,
                &correlation_id,
                DispatchOutcome::NotConnected,
                None,
            )));
        }

        if !frame.requires_ack() {
            let outcome = match self.write_frame(&session, frame) {
                Ok(()) => DispatchOutcome::Completed,
                Err(_) => DispatchOutcome::Disconnected,
            };
            return SendPhase::Immediate(self.record(DeviceDispatch::new(
                device_id,
                &correlation_id,
                outcome,
                None,
            )));
        }

        let mut waiter = self
            .pending
            .register(device_id, &correlation_id, timeout, with_progress);
        let progress = waiter.take_progress();
        if self.write_frame(&session, frame).is_err() {
            // The failed write already detached the session and resolved
            // this waiter as disconnected.
            drop(waiter);
            return SendPhase::Immediate(self.record(DeviceDispatch::new(
                device_id,
                &correlation_id,
                DispatchOutcome::Disconnected,
                None,
            )));
        }
        SendPhase::Waiting { waiter, progress }
    }

    /// Map a waiter outcome onto the per-device result.
    pub(crate) fn conclude(
        &self,
        device_id: &str,
        correlation_id: &str,
        outcome: AckOutcome<A>,
    ) -> DeviceDispatch<A> {
        let result = match outcome {
            AckOutcome::Acked(ack) => {
                let message = ack.message().unwrap_or_default().to_string();
                let outcome = match ack.disposition() {
                    AckDisposition::Completed => DispatchOutcome::Completed,
                    AckDisposition::Failed => DispatchOutcome::Failed(message),
                    AckDisposition::Rejected => DispatchOutcome::Rejected(message),
                    AckDisposition::Progress => {
                        warn!(
                            kind = self.kind().as_str(),
                            device_id, correlation_id, "non-terminal ack resolved a waiter"
                        );
                        DispatchOutcome::Failed(message)
                    }
                };
                DeviceDispatch::new(device_id, correlation_id, outcome, Some(ack))
            }
            AckOutcome::TimedOut => {
                DeviceDispatch::new(device_id, correlation_id, DispatchOutcome::Timeout, None)
            }
            AckOutcome::Disconnected => DeviceDispatch::new(
                device_id,
                correlation_id,
                DispatchOutcome::Disconnected,
                None,
            ),
            AckOutcome::Cancelled => {
                DeviceDispatch::new(device_id, correlation_id, DispatchOutcome::Cancelled, None)
            }
            AckOutcome::ShuttingDown => DeviceDispatch::new(
                device_id,
                correlation_id,
                DispatchOutcome::ShuttingDown,
                None,
            ),
        };
        self.record(result)
    }

    fn write_frame(
        &self,
        session: &Arc<DeviceSession<F>>,
        frame: F,
    ) -> Result<(), SessionSendError> {
        match session.try_send(frame) {
            Ok(()) => {
                counter!(
                    "marquee_frames_sent_total",
                    1,
                    "kind" => self.kind().as_str()
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    kind = self.kind().as_str(),
                    device_id = session.device_id(),
                    error = %err,
                    "dropping session after failed outbound write"
                );
                self.detach_session(session.device_id(), session.epoch());
                Err(err)
            }
        }
    }

    fn record(&self, result: DeviceDispatch<A>) -> DeviceDispatch<A> {
        counter!(
            "marquee_dispatch_total",
            1,
            "kind" => self.kind().as_str(),
            "outcome" => result.outcome.label()
        );
        debug!(
            kind = self.kind().as_str(),
            device_id = result.device_id.as_str(),
            correlation_id = result.correlation_id.as_str(),
            outcome = result.outcome.label(),
            "dispatch resolved"
        );
        result
    }
}
