//! Hub-wide state: the two stream-kind engines plus the services around
//! them, wired once at startup and cloned into every handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use marquee_proto::{CommandAck, CommandFrame, ContentAck, ContentFrame};

use crate::ack::AckRouter;
use crate::analytics::AnalyticsService;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::fleets::FleetStore;
use crate::pending::PendingAckTable;
use crate::session::{SessionRegistry, StreamKind};

pub type CommandDispatcher = Dispatcher<CommandFrame, CommandAck>;
pub type ContentDispatcher = Dispatcher<ContentFrame, ContentAck>;
pub type CommandAckRouter = AckRouter<CommandFrame, CommandAck>;
pub type ContentAckRouter = AckRouter<ContentFrame, ContentAck>;

#[derive(Clone)]
pub struct HubState {
    pub config: Arc<Config>,
    pub commands: CommandDispatcher,
    pub content: ContentDispatcher,
    pub command_acks: CommandAckRouter,
    pub content_acks: ContentAckRouter,
    pub fleets: FleetStore,
    pub analytics: AnalyticsService,
    shutting_down: Arc<AtomicBool>,
}

impl HubState {
    pub fn new(config: Config) -> Self {
        let fleets = FleetStore::new();
        let shutting_down = Arc::new(AtomicBool::new(false));
        let directory: Arc<FleetStore> = Arc::new(fleets.clone());

        let command_registry = SessionRegistry::new(StreamKind::Commands, config.outbound_buffer);
        let command_pending = PendingAckTable::new(StreamKind::Commands);
        let commands = Dispatcher::new(
            command_registry.clone(),
            command_pending.clone(),
            directory.clone(),
            shutting_down.clone(),
        );
        let command_acks = AckRouter::new(command_registry, command_pending);

        let content_registry = SessionRegistry::new(StreamKind::Content, config.outbound_buffer);
        let content_pending = PendingAckTable::new(StreamKind::Content);
        let content = Dispatcher::new(
            content_registry.clone(),
            content_pending.clone(),
            directory,
            shutting_down.clone(),
        );
        let content_acks = AckRouter::new(content_registry, content_pending);

        let analytics = AnalyticsService::new(config.analytics_settings());

        Self {
            config: Arc::new(config),
            commands,
            content,
            command_acks,
            content_acks,
            fleets,
            analytics,
            shutting_down,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Drain the hub: refuse new dispatches, resolve every pending waiter
    /// as shutting down, then close all device sessions.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("draining hub");
        self.commands.pending().shutdown();
        self.content.pending().shutdown();
        self.commands.registry().close_all();
        self.content.registry().close_all();
    }
}
