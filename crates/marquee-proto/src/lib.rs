//! Marquee protocol: wire contract shared by the hub and device integrations.
//!
//! Responsibilities:
//! - command and content frames pushed to subscribed devices
//! - acknowledgement statuses and bodies devices report back
//! - analytics batch shapes for the telemetry upload path
//!
//! The hub treats frame payloads opaquely; only identifiers and the
//! `requires_ack` flag participate in dispatch.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Analytics batch and event identifiers are exactly this many raw bytes.
pub const ANALYTICS_ID_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Command stream
// ---------------------------------------------------------------------------

/// One outbound message on a device's command stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command_id: String,
    pub requires_ack: bool,
    pub issued_at: DateTime<Utc>,
    pub command: DeviceCommand,
}

impl CommandFrame {
    pub fn new(command: DeviceCommand, requires_ack: bool) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            requires_ack,
            issued_at: Utc::now(),
            command,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceCommand {
    SetClock {
        simulated_time: String,
    },
    RequestReboot {
        delay_seconds: u32,
    },
    UpdateNetwork {
        ssid: String,
        password: String,
    },
    RotateScreen {
        orientation: ScreenOrientation,
        #[serde(skip_serializing_if = "Option::is_none")]
        fullscreen: Option<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenOrientation {
    Landscape,
    Portrait,
    LandscapeFlipped,
    PortraitFlipped,
}

/// Command acknowledgement state machine.
///
/// `Received` is the only progress state; the rest are terminal and only
/// `Completed` counts as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAckStatus {
    Unspecified,
    Received,
    Completed,
    Failed,
    Rejected,
}

impl CommandAckStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Received => "received",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

/// Acknowledgement a device reports for one command frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: String,
    pub status: CommandAckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Content stream
// ---------------------------------------------------------------------------

/// One outbound content package on a device's content stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentFrame {
    pub delivery_id: String,
    pub requires_ack: bool,
    pub content: serde_json::Value,
    #[serde(default)]
    pub media: Vec<MediaItem>,
}

impl ContentFrame {
    pub fn new(content: serde_json::Value, media: Vec<MediaItem>, requires_ack: bool) -> Self {
        Self {
            delivery_id: Uuid::new_v4().to_string(),
            requires_ack,
            content,
            media,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub checksum: String,
    pub url: String,
}

/// Content acknowledgement state machine.
///
/// `Received` and `InProgress` are progress states. `Partial` is terminal
/// failure: the delivery landed but some media did not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentAckStatus {
    Unspecified,
    Received,
    InProgress,
    Completed,
    Partial,
    Failed,
}

impl ContentAckStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Received => "received",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Per-media transfer state reported inside a content acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaTransferState {
    pub id: String,
    pub state: MediaState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    Pending,
    Transferring,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_media: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_media: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_media: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_states: Vec<MediaTransferState>,
}

/// Acknowledgement a device reports for one content delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentAck {
    pub delivery_id: String,
    pub status: ContentAckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ContentProgress>,
}

/// Unary response to every acknowledgement RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckReceipt {
    pub accepted: bool,
    pub retry_after_seconds: u32,
}

impl AckReceipt {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            retry_after_seconds: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Analytics upload path
// ---------------------------------------------------------------------------

/// One uploaded telemetry batch. Identifiers are base64 of 16 raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: String,
    pub device_fingerprint: u32,
    pub events: Vec<TelemetryEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_status: Option<QueueStatus>,
    pub sent_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub recorded_at_ms: i64,
    pub payload: serde_json::Value,
}

/// Uploader-side queue health, reported opportunistically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueStatus {
    pub depth: u32,
    pub dropped: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_event_ids: Vec<String>,
    pub throttle_ms: u64,
    pub policy: IngestPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestPolicy {
    pub max_batch_size: usize,
}

/// Decode a batch or event identifier, enforcing the 16-byte contract.
pub fn decode_analytics_id(encoded: &str) -> Option<[u8; ANALYTICS_ID_BYTES]> {
    let raw = BASE64_STANDARD.decode(encoded).ok()?;
    raw.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_payload_uses_snake_case_tags() {
        let frame = CommandFrame::new(
            DeviceCommand::RotateScreen {
                orientation: ScreenOrientation::Portrait,
                fullscreen: Some(true),
            },
            true,
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["command"]["type"], "rotate_screen");
        assert_eq!(json["command"]["orientation"], "portrait");
        assert_eq!(frame.command_id.len(), 36);
    }

    #[test]
    fn terminal_classification() {
        assert!(!CommandAckStatus::Received.is_terminal());
        assert!(CommandAckStatus::Rejected.is_terminal());
        assert!(!CommandAckStatus::Rejected.is_success());
        assert!(ContentAckStatus::Partial.is_terminal());
        assert!(!ContentAckStatus::Partial.is_success());
        assert!(!ContentAckStatus::InProgress.is_terminal());
        assert!(ContentAckStatus::Completed.is_success());
    }

    #[test]
    fn analytics_ids_must_be_sixteen_bytes() {
        let good = BASE64_STANDARD.encode([7u8; ANALYTICS_ID_BYTES]);
        assert!(decode_analytics_id(&good).is_some());
        let short = BASE64_STANDARD.encode([7u8; 8]);
        assert!(decode_analytics_id(&short).is_none());
        assert!(decode_analytics_id("not base64!").is_none());
    }
}
