//! The Receiver: the ingress agent.
//!
//! Frame reception and reassembly are external collaborators; this core
//! owns the Receiver's lifecycle: its command queue, its registry of
//! subscriptions and images, and the path by which new streams and loss
//! observations are reported back to the Conductor.

use std::sync::Arc;

use petrel_primitives::queue::ArrayQueue;
use petrel_primitives::MmapRegion;

use crate::agent::Agent;
use crate::command::ReceiverCmd;
use crate::proxy::{CommandHandler, ConductorProxy};
use crate::system_counters::SystemCounters;

const COMMAND_DRAIN_LIMIT: usize = 10;

struct SubscriptionEntry {
    registration_id: u64,
    stream_id: i32,
    destinations: Vec<u64>,
}

struct ImageEntry {
    correlation_id: u64,
    #[allow(dead_code)]
    session_id: i32,
    stream_id: i32,
}

pub struct Receiver {
    /// Keeps the CnC mapping alive for the counter views below.
    #[allow(dead_code)]
    cnc: Arc<MmapRegion>,
    command_queue: Arc<ArrayQueue<ReceiverCmd>>,
    conductor_proxy: ConductorProxy,
    #[allow(dead_code)]
    system_counters: Arc<SystemCounters>,
    subscriptions: Vec<SubscriptionEntry>,
    images: Vec<ImageEntry>,
}

impl Receiver {
    pub fn new(
        cnc: Arc<MmapRegion>,
        command_queue: Arc<ArrayQueue<ReceiverCmd>>,
        conductor_proxy: ConductorProxy,
        system_counters: Arc<SystemCounters>,
    ) -> Self {
        Self {
            cnc,
            command_queue,
            conductor_proxy,
            system_counters,
            subscriptions: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Report a setup frame seen for a stream with no image yet. The
    /// Conductor owns resource creation and will answer with
    /// `NewPublicationImage`.
    pub fn on_setup_frame(&self, session_id: i32, stream_id: i32, correlation_id: u64) {
        self.conductor_proxy
            .create_publication_image(session_id, stream_id, correlation_id);
    }

    /// Report a gap detected on a live image.
    pub fn on_loss_detected(&self, session_id: i32, stream_id: i32, bytes_lost: u64) {
        self.conductor_proxy
            .record_loss(session_id, stream_id, bytes_lost);
    }

    /// For tests and diagnostics: live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// For tests and diagnostics: live images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Agent for Receiver {
    fn role_name(&self) -> &str {
        "receiver"
    }

    fn do_work(&mut self) -> usize {
        let queue = self.command_queue.clone();
        queue.drain(|cmd| self.on_command(cmd), COMMAND_DRAIN_LIMIT)

        // Datagram polling and reassembly would follow here.
    }

    fn on_close(&mut self) {
        log_at!(
            info,
            "receiver closing; {} subscriptions, {} images",
            self.subscriptions.len(),
            self.images.len()
        );
    }
}

impl CommandHandler<ReceiverCmd> for Receiver {
    fn on_command(&mut self, cmd: ReceiverCmd) {
        match cmd {
            ReceiverCmd::AddSubscription {
                registration_id,
                stream_id,
            } => {
                if !self
                    .subscriptions
                    .iter()
                    .any(|s| s.registration_id == registration_id)
                {
                    self.subscriptions.push(SubscriptionEntry {
                        registration_id,
                        stream_id,
                        destinations: Vec::new(),
                    });
                }
            }
            ReceiverCmd::RemoveSubscription { registration_id } => {
                if let Some(index) = self
                    .subscriptions
                    .iter()
                    .position(|s| s.registration_id == registration_id)
                {
                    let subscription = self.subscriptions.swap_remove(index);
                    // Images for a stream nobody subscribes to are dropped.
                    self.images
                        .retain(|image| image.stream_id != subscription.stream_id);
                }
            }
            ReceiverCmd::NewPublicationImage {
                correlation_id,
                session_id,
                stream_id,
            } => {
                if !self
                    .images
                    .iter()
                    .any(|image| image.correlation_id == correlation_id)
                {
                    self.images.push(ImageEntry {
                        correlation_id,
                        session_id,
                        stream_id,
                    });
                }
            }
            ReceiverCmd::AddDestination {
                registration_id,
                endpoint_id,
            } => {
                if let Some(subscription) = self
                    .subscriptions
                    .iter_mut()
                    .find(|s| s.registration_id == registration_id)
                {
                    if !subscription.destinations.contains(&endpoint_id) {
                        subscription.destinations.push(endpoint_id);
                    }
                }
            }
            ReceiverCmd::RemoveDestination {
                registration_id,
                endpoint_id,
            } => {
                if let Some(subscription) = self
                    .subscriptions
                    .iter_mut()
                    .find(|s| s.registration_id == registration_id)
                {
                    subscription.destinations.retain(|&d| d != endpoint_id);
                }
            }
        }
    }
}
