//! Telemetry batch ingestion.
//!
//! A separate service from the dispatch engine: devices upload event
//! batches, the hub validates and retains them in bounded process
//! memory, and every upload is answered with a receipt carrying the
//! current ingest policy. There is no session coupling with dispatch.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use marquee_proto::{decode_analytics_id, BatchAck, EventBatch, IngestPolicy, QueueStatus};

#[derive(Debug, Clone)]
pub struct AnalyticsSettings {
    /// Events per batch before the whole batch is refused.
    pub max_batch_size: usize,
    /// Events retained per device, oldest evicted first.
    pub retention_per_device: usize,
    /// Backoff answered to misbehaving or overflowing uploaders.
    pub backoff_ms: u64,
    /// Recently seen batch ids kept per device for duplicate suppression.
    pub recent_batch_window: usize,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            retention_per_device: 1024,
            backoff_ms: 1000,
            recent_batch_window: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub recorded_at_ms: i64,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device_fingerprint: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub batches_accepted: u64,
    pub batches_rejected: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_queue: Option<QueueStatus>,
}

struct DeviceRecord {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    batches_accepted: u64,
    batches_rejected: u64,
    events_accepted: u64,
    events_rejected: u64,
    last_queue: Option<QueueStatus>,
    recent_batches: VecDeque<String>,
    events: VecDeque<StoredEvent>,
}

impl DeviceRecord {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            first_seen: now,
            last_seen: now,
            batches_accepted: 0,
            batches_rejected: 0,
            events_accepted: 0,
            events_rejected: 0,
            last_queue: None,
            recent_batches: VecDeque::new(),
            events: VecDeque::new(),
        }
    }
}

#[derive(Clone)]
pub struct AnalyticsService {
    inner: Arc<AnalyticsInner>,
}

struct AnalyticsInner {
    settings: AnalyticsSettings,
    devices: DashMap<u32, DeviceRecord>,
}

impl AnalyticsService {
    pub fn new(settings: AnalyticsSettings) -> Self {
        Self {
            inner: Arc::new(AnalyticsInner {
                settings,
                devices: DashMap::new(),
            }),
        }
    }

    pub fn policy(&self) -> IngestPolicy {
        IngestPolicy {
            max_batch_size: self.inner.settings.max_batch_size,
        }
    }

    /// Validate and store one uploaded batch, answering the receipt the
    /// uploader schedules its next attempt by.
    pub fn ingest(&self, batch: EventBatch) -> BatchAck {
        let settings = &self.inner.settings;
        let policy = self.policy();
        let fingerprint = batch.device_fingerprint;

        if decode_analytics_id(&batch.batch_id).is_none() {
            warn!(fingerprint, batch_id = batch.batch_id.as_str(), "malformed batch id");
            self.reject(fingerprint);
            counter!("marquee_analytics_batches_total", 1, "result" => "rejected");
            return BatchAck {
                batch_id: batch.batch_id,
                accepted: false,
                rejected_event_ids: Vec::new(),
                throttle_ms: settings.backoff_ms,
                policy,
            };
        }

        if batch.events.len() > settings.max_batch_size {
            warn!(
                fingerprint,
                batch_id = batch.batch_id.as_str(),
                events = batch.events.len(),
                max = settings.max_batch_size,
                "oversize batch refused"
            );
            self.reject(fingerprint);
            counter!("marquee_analytics_batches_total", 1, "result" => "rejected");
            return BatchAck {
                batch_id: batch.batch_id,
                accepted: false,
                rejected_event_ids: Vec::new(),
                throttle_ms: settings.backoff_ms,
                policy,
            };
        }

        let mut record = self
            .inner
            .devices
            .entry(fingerprint)
            .or_insert_with(DeviceRecord::new);
        let now = Utc::now();
        record.last_seen = now;
        record.last_queue = batch.queue_status;

        if record.recent_batches.contains(&batch.batch_id) {
            debug!(
                fingerprint,
                batch_id = batch.batch_id.as_str(),
                "duplicate batch suppressed"
            );
            counter!("marquee_analytics_batches_total", 1, "result" => "duplicate");
            return BatchAck {
                batch_id: batch.batch_id,
                accepted: true,
                rejected_event_ids: Vec::new(),
                throttle_ms: 0,
                policy,
            };
        }
        record.recent_batches.push_back(batch.batch_id.clone());
        while record.recent_batches.len() > settings.recent_batch_window {
            record.recent_batches.pop_front();
        }

        let mut rejected_event_ids = Vec::new();
        for event in batch.events {
            if decode_analytics_id(&event.event_id).is_none() {
                record.events_rejected += 1;
                rejected_event_ids.push(event.event_id);
                continue;
            }
            record.events.push_back(StoredEvent {
                event_id: event.event_id,
                recorded_at_ms: event.recorded_at_ms,
                received_at: now,
                payload: event.payload,
            });
            record.events_accepted += 1;
            while record.events.len() > settings.retention_per_device {
                record.events.pop_front();
            }
        }
        record.batches_accepted += 1;

        let overflowing = batch
            .queue_status
            .map(|queue| queue.dropped > 0)
            .unwrap_or(false);
        let throttle_ms = if overflowing { settings.backoff_ms } else { 0 };

        counter!("marquee_analytics_batches_total", 1, "result" => "accepted");
        BatchAck {
            batch_id: batch.batch_id,
            accepted: true,
            rejected_event_ids,
            throttle_ms,
            policy,
        }
    }

    pub fn device_summaries(&self) -> Vec<DeviceSummary> {
        let mut summaries: Vec<DeviceSummary> = self
            .inner
            .devices
            .iter()
            .map(|entry| DeviceSummary {
                device_fingerprint: *entry.key(),
                first_seen: entry.first_seen,
                last_seen: entry.last_seen,
                batches_accepted: entry.batches_accepted,
                batches_rejected: entry.batches_rejected,
                events_accepted: entry.events_accepted,
                events_rejected: entry.events_rejected,
                last_queue: entry.last_queue,
            })
            .collect();
        summaries.sort_by_key(|summary| summary.device_fingerprint);
        summaries
    }

    pub fn events_for(&self, fingerprint: u32) -> Option<Vec<StoredEvent>> {
        self.inner
            .devices
            .get(&fingerprint)
            .map(|record| record.events.iter().cloned().collect())
    }

    fn reject(&self, fingerprint: u32) {
        let mut record = self
            .inner
            .devices
            .entry(fingerprint)
            .or_insert_with(DeviceRecord::new);
        record.last_seen = Utc::now();
        record.batches_rejected += 1;
    }
}
