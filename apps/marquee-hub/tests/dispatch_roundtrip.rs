//! End-to-end dispatch flows driven through the hub's public surface:
//! attach a simulated device, dispatch, feed acknowledgements back
//! through the router, observe the resolved results.

use std::time::Duration;

use marquee_hub::config::Config;
use marquee_hub::dispatch::DispatchOutcome;
use marquee_hub::state::HubState;
use marquee_hub::stream::DispatchEvent;
use marquee_proto::{
    CommandAck, CommandAckStatus, CommandFrame, ContentAck, ContentAckStatus, ContentFrame,
    ContentProgress, DeviceCommand, MediaItem, MediaState, MediaTransferState,
};

fn playlist() -> ContentFrame {
    let media = vec![
        MediaItem {
            id: "m1".into(),
            checksum: "11".into(),
            url: "https://cdn.example/m1".into(),
        },
        MediaItem {
            id: "m2".into(),
            checksum: "22".into(),
            url: "https://cdn.example/m2".into(),
        },
        MediaItem {
            id: "m3".into(),
            checksum: "33".into(),
            url: "https://cdn.example/m3".into(),
        },
    ];
    ContentFrame::new(serde_json::json!({ "playlist": "august" }), media, true)
}

#[tokio::test]
async fn content_delivery_streams_progress_then_completes() {
    let hub = HubState::new(Config::default());
    let mut device = hub.content.attach("d1", None);

    // Simulated device: download in two steps, then report completion.
    let acks = hub.content_acks.clone();
    tokio::spawn(async move {
        let frame = device.frames.recv().await.expect("delivery frame");
        let id = frame.delivery_id;
        acks.deliver(
            "d1",
            ContentAck {
                delivery_id: id.clone(),
                status: ContentAckStatus::Received,
                message: None,
                progress: None,
            },
        );
        acks.deliver(
            "d1",
            ContentAck {
                delivery_id: id.clone(),
                status: ContentAckStatus::InProgress,
                message: None,
                progress: Some(ContentProgress {
                    percent: Some(50.0),
                    total_media: Some(3),
                    completed_media: Some(2),
                    failed_media: Some(0),
                    media_states: vec![],
                }),
            },
        );
        acks.deliver(
            "d1",
            ContentAck {
                delivery_id: id,
                status: ContentAckStatus::Completed,
                message: Some("all media cached".into()),
                progress: None,
            },
        );
    });

    let mut events = hub
        .content
        .dispatch_stream("d1", playlist(), Duration::from_secs(5));
    let mut progress = Vec::new();
    let mut resolved = None;
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::Progress { ack, .. } => progress.push(ack.status),
            DispatchEvent::Resolved { result, .. } => resolved = Some(result),
            _ => {}
        }
    }

    assert_eq!(
        progress,
        vec![ContentAckStatus::Received, ContentAckStatus::InProgress]
    );
    let resolved = resolved.expect("terminal event emitted");
    assert!(resolved.success);
    assert_eq!(
        resolved.final_ack.unwrap().message.as_deref(),
        Some("all media cached")
    );
}

#[tokio::test]
async fn partial_content_failure_is_not_success() {
    let hub = HubState::new(Config::default());
    let mut device = hub.content.attach("d1", None);

    let acks = hub.content_acks.clone();
    tokio::spawn(async move {
        let frame = device.frames.recv().await.expect("delivery frame");
        acks.deliver(
            "d1",
            ContentAck {
                delivery_id: frame.delivery_id,
                status: ContentAckStatus::Partial,
                message: Some("1 of 3 media failed".into()),
                progress: Some(ContentProgress {
                    percent: Some(100.0),
                    total_media: Some(3),
                    completed_media: Some(2),
                    failed_media: Some(1),
                    media_states: vec![
                        MediaTransferState {
                            id: "m1".into(),
                            state: MediaState::Completed,
                            detail: None,
                        },
                        MediaTransferState {
                            id: "m2".into(),
                            state: MediaState::Failed,
                            detail: Some("CHECKSUM_MISMATCH".into()),
                        },
                        MediaTransferState {
                            id: "m3".into(),
                            state: MediaState::Completed,
                            detail: None,
                        },
                    ],
                }),
            },
        );
    });

    let result = hub
        .content
        .dispatch("d1", playlist(), Duration::from_secs(5))
        .await;
    assert!(!result.success);
    assert_eq!(
        result.outcome,
        DispatchOutcome::Failed("1 of 3 media failed".into())
    );
    let final_ack = result.final_ack.expect("partial ack surfaced");
    assert_eq!(final_ack.status, ContentAckStatus::Partial);
    assert_eq!(final_ack.progress.unwrap().failed_media, Some(1));
}

#[tokio::test]
async fn command_roundtrip_and_silent_timeout() {
    let hub = HubState::new(Config::default());
    let mut responsive = hub.commands.attach("kiosk-1", None);
    let _silent = hub.commands.attach("kiosk-2", None);

    let acks = hub.command_acks.clone();
    tokio::spawn(async move {
        while let Some(frame) = responsive.frames.recv().await {
            acks.deliver(
                "kiosk-1",
                CommandAck {
                    command_id: frame.command_id,
                    status: CommandAckStatus::Completed,
                    message: None,
                },
            );
        }
    });

    let report = hub
        .commands
        .dispatch_all(
            |_| {
                CommandFrame::new(
                    DeviceCommand::RotateScreen {
                        orientation: marquee_proto::ScreenOrientation::Landscape,
                        fullscreen: None,
                    },
                    true,
                )
            },
            Duration::from_millis(100),
        )
        .await;

    assert_eq!(report.target_devices, 2);
    assert_eq!(report.successful, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.timed_out, 1);
    assert!(report.failed_devices.contains(&"kiosk-2".to_string()));
}

#[tokio::test]
async fn reconnect_fails_stale_dispatch_quickly() {
    let hub = HubState::new(Config::default());
    let _first = hub.commands.attach("kiosk-9", None);

    let dispatcher = hub.commands.clone();
    let stale = tokio::spawn(async move {
        dispatcher
            .dispatch(
                "kiosk-9",
                CommandFrame::new(DeviceCommand::RequestReboot { delay_seconds: 0 }, true),
                Duration::from_secs(60),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The device reconnects long before the 60 s timeout would fire.
    let _second = hub.commands.attach("kiosk-9", None);
    let result = tokio::time::timeout(Duration::from_secs(1), stale)
        .await
        .expect("stale dispatch resolved promptly")
        .unwrap();
    assert_eq!(result.outcome, DispatchOutcome::Disconnected);
}
