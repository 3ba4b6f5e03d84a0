//! Inbound acknowledgement hot path.
//!
//! Every ack the device ingress receives funnels through here: bump the
//! session's activity clock, hand the ack to the pending table, log what
//! happened. The router holds no state of its own; stale and duplicate
//! acks are dropped, never errors.

use metrics::counter;
use tracing::debug;

use crate::dispatch::Acknowledgement;
use crate::pending::{Delivery, PendingAckTable};
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AckRouter<F, A> {
    registry: SessionRegistry<F>,
    pending: PendingAckTable<A>,
}

impl<F: Send + 'static, A: Acknowledgement> AckRouter<F, A> {
    pub fn new(registry: SessionRegistry<F>, pending: PendingAckTable<A>) -> Self {
        Self { registry, pending }
    }

    pub fn deliver(&self, device_id: &str, ack: A) -> Delivery {
        self.registry.mark_activity(device_id);

        let kind = self.pending.kind().as_str();
        let correlation_id = ack.correlation_id().to_string();
        let status = ack.status_label();
        let terminal = ack.disposition().is_terminal();

        let delivery = self
            .pending
            .deliver(device_id, &correlation_id, ack, terminal);
        match delivery {
            Delivery::Dropped => {
                debug!(
                    kind,
                    device_id, correlation_id, status, "dropping ack without a waiter"
                );
            }
            _ => {
                debug!(kind, device_id, correlation_id, status, terminal, "ack routed");
            }
        }
        counter!(
            "marquee_acks_total",
            1,
            "kind" => kind,
            "result" => match delivery {
                Delivery::Completed => "completed",
                Delivery::Progress => "progress",
                Delivery::Dropped => "dropped",
            }
        );
        delivery
    }
}
