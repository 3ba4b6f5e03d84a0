//! Progress event streams for streaming dispatch.
//!
//! Each streaming dispatch gets its own typed channel: progress acks and
//! per-device resolutions flow out as events, fan-outs bracket them with
//! `started` / `complete` meta events. There is exactly one consumer per
//! stream, so the channel is mpsc rather than broadcast; dropping the
//! consumer stops the producers and cancels outstanding waiters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::dispatch::{Acknowledgement, DeviceDispatch, Dispatcher, Frame, SendPhase};

/// One event on a streaming dispatch.
///
/// No cross-device ordering is promised for `progress` events; each
/// device's own events arrive in order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent<A> {
    Started {
        total_devices: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        fleet_id: Option<String>,
    },
    Progress {
        device_id: String,
        correlation_id: String,
        ack: A,
        completed_devices: u32,
        total_devices: u32,
    },
    Resolved {
        #[serde(flatten)]
        result: DeviceDispatch<A>,
        completed_devices: u32,
        total_devices: u32,
    },
    Complete {
        successful: u32,
        failed: u32,
    },
}

impl<A> DispatchEvent<A> {
    /// Wire name, used as the SSE event type.
    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::Started { .. } => "started",
            DispatchEvent::Progress { .. } => "progress",
            DispatchEvent::Resolved { .. } => "resolved",
            DispatchEvent::Complete { .. } => "complete",
        }
    }
}

/// Drive one device's streaming dispatch to completion, emitting into
/// `tx`. A failed send means the consumer is gone: the waiter is dropped
/// unresolved and its drop guard cancels the registration.
pub(crate) async fn run_unary_stream<F: Frame, A: Acknowledgement>(
    dispatcher: Dispatcher<F, A>,
    device_id: String,
    frame: F,
    timeout: Duration,
    tx: mpsc::Sender<DispatchEvent<A>>,
) {
    match dispatcher.begin(&device_id, frame, timeout, true) {
        SendPhase::Immediate(result) => {
            let _ = tx
                .send(DispatchEvent::Resolved {
                    result,
                    completed_devices: 1,
                    total_devices: 1,
                })
                .await;
        }
        SendPhase::Waiting {
            mut waiter,
            progress,
        } => {
            let correlation_id = waiter.correlation_id().to_string();
            if let Some(mut progress) = progress {
                while let Some(ack) = progress.recv().await {
                    let event = DispatchEvent::Progress {
                        device_id: device_id.clone(),
                        correlation_id: ack.correlation_id().to_string(),
                        ack,
                        completed_devices: 0,
                        total_devices: 1,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            let outcome = waiter.outcome().await;
            let result = dispatcher.conclude(&device_id, &correlation_id, outcome);
            let _ = tx
                .send(DispatchEvent::Resolved {
                    result,
                    completed_devices: 1,
                    total_devices: 1,
                })
                .await;
        }
    }
}

/// Drive a fan-out's streaming dispatch: `started`, interleaved per-device
/// events, then `complete` once every per-device stream has ended.
pub(crate) async fn run_fan_out_stream<F: Frame, A: Acknowledgement>(
    dispatcher: Dispatcher<F, A>,
    fleet_id: Option<String>,
    devices: Vec<String>,
    build: Arc<dyn Fn(&str) -> F + Send + Sync>,
    timeout: Duration,
    tx: mpsc::Sender<DispatchEvent<A>>,
) {
    let total = devices.len() as u32;
    if tx
        .send(DispatchEvent::Started {
            total_devices: total,
            fleet_id,
        })
        .await
        .is_err()
    {
        return;
    }

    let completed = AtomicU32::new(0);
    let successful = AtomicU32::new(0);
    let failed = AtomicU32::new(0);

    let streams = devices.into_iter().map(|device_id| {
        let dispatcher = dispatcher.clone();
        let build = build.clone();
        let tx = tx.clone();
        let completed = &completed;
        let successful = &successful;
        let failed = &failed;
        async move {
            let frame = build.as_ref()(&device_id);
            let result = match dispatcher.begin(&device_id, frame, timeout, true) {
                SendPhase::Immediate(result) => result,
                SendPhase::Waiting {
                    mut waiter,
                    progress,
                } => {
                    let correlation_id = waiter.correlation_id().to_string();
                    if let Some(mut progress) = progress {
                        while let Some(ack) = progress.recv().await {
                            let event = DispatchEvent::Progress {
                                device_id: device_id.clone(),
                                correlation_id: ack.correlation_id().to_string(),
                                ack,
                                completed_devices: completed.load(Ordering::Relaxed),
                                total_devices: total,
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    let outcome = waiter.outcome().await;
                    dispatcher.conclude(&device_id, &correlation_id, outcome)
                }
            };
            if result.success {
                successful.fetch_add(1, Ordering::Relaxed);
            } else {
                failed.fetch_add(1, Ordering::Relaxed);
            }
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            let _ = tx
                .send(DispatchEvent::Resolved {
                    result,
                    completed_devices: done,
                    total_devices: total,
                })
                .await;
        }
    });
    join_all(streams).await;

    let _ = tx
        .send(DispatchEvent::Complete {
            successful: successful.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleets::FleetStore;
    use crate::pending::PendingAckTable;
    use crate::session::{SessionRegistry, StreamKind};
    use marquee_proto::{
        ContentAck, ContentAckStatus, ContentFrame, ContentProgress, MediaItem,
    };
    use std::sync::atomic::AtomicBool;

    type ContentDispatcher = Dispatcher<ContentFrame, ContentAck>;

    fn engine() -> ContentDispatcher {
        Dispatcher::new(
            SessionRegistry::new(StreamKind::Content, 8),
            PendingAckTable::new(StreamKind::Content),
            Arc::new(FleetStore::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn playlist(requires_ack: bool) -> ContentFrame {
        let media = vec![
            MediaItem {
                id: "m1".into(),
                checksum: "aa".into(),
                url: "https://cdn.example/m1".into(),
            },
            MediaItem {
                id: "m2".into(),
                checksum: "bb".into(),
                url: "https://cdn.example/m2".into(),
            },
            MediaItem {
                id: "m3".into(),
                checksum: "cc".into(),
                url: "https://cdn.example/m3".into(),
            },
        ];
        ContentFrame::new(serde_json::json!({ "playlist": "spring" }), media, requires_ack)
    }

    fn ack(delivery_id: &str, status: ContentAckStatus, progress: Option<ContentProgress>) -> ContentAck {
        ContentAck {
            delivery_id: delivery_id.to_string(),
            status,
            message: None,
            progress,
        }
    }

    #[tokio::test]
    async fn delivery_progress_streams_in_order() {
        let dispatcher = engine();
        let mut session = dispatcher.attach("d1", None);

        let pending = dispatcher.pending().clone();
        tokio::spawn(async move {
            let frame = session.frames.recv().await.expect("frame delivered");
            let id = frame.delivery_id;
            pending.deliver("d1", &id, ack(&id, ContentAckStatus::Received, None), false);
            pending.deliver(
                "d1",
                &id,
                ack(
                    &id,
                    ContentAckStatus::InProgress,
                    Some(ContentProgress {
                        percent: Some(50.0),
                        total_media: Some(3),
                        completed_media: Some(2),
                        failed_media: Some(0),
                        media_states: vec![],
                    }),
                ),
                false,
            );
            pending.deliver("d1", &id, ack(&id, ContentAckStatus::Completed, None), true);
        });

        let mut rx = dispatcher.dispatch_stream("d1", playlist(true), Duration::from_secs(2));
        let mut statuses = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                DispatchEvent::Progress { ack, .. } => statuses.push(ack.status),
                DispatchEvent::Resolved { result, .. } => {
                    assert!(result.success);
                    assert_eq!(
                        result.final_ack.map(|a| a.status),
                        Some(ContentAckStatus::Completed)
                    );
                }
                other => panic!("unexpected event {}", other.name()),
            }
        }
        assert_eq!(
            statuses,
            vec![ContentAckStatus::Received, ContentAckStatus::InProgress]
        );
    }

    #[tokio::test]
    async fn disconnected_device_resolves_immediately() {
        let dispatcher = engine();
        let mut rx = dispatcher.dispatch_stream("ghost", playlist(true), Duration::from_secs(1));
        match rx.recv().await.expect("terminal event") {
            DispatchEvent::Resolved { result, .. } => {
                assert!(!result.success);
            }
            other => panic!("unexpected event {}", other.name()),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn empty_fan_out_brackets_with_meta_events() {
        let dispatcher = engine();
        let mut rx =
            dispatcher.dispatch_all_stream(|_| playlist(true), Duration::from_secs(1));
        match rx.recv().await.unwrap() {
            DispatchEvent::Started { total_devices, .. } => assert_eq!(total_devices, 0),
            other => panic!("unexpected event {}", other.name()),
        }
        match rx.recv().await.unwrap() {
            DispatchEvent::Complete { successful, failed } => {
                assert_eq!((successful, failed), (0, 0));
            }
            other => panic!("unexpected event {}", other.name()),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_consumer_cancels_waiter() {
        let dispatcher = engine();
        let mut session = dispatcher.attach("d1", None);

        let rx = dispatcher.dispatch_stream("d1", playlist(true), Duration::from_secs(30));
        let frame = session.frames.recv().await.expect("frame delivered");
        drop(rx);

        // The next progress delivery trips the failed send; the producer
        // bails out and its waiter guard cancels the registration.
        let id = frame.delivery_id.clone();
        dispatcher.pending().deliver(
            "d1",
            &id,
            ack(&id, ContentAckStatus::Received, None),
            false,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.pending().pending_for("d1"), 0);
    }
}
