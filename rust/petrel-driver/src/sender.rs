//! The Sender: the egress agent.
//!
//! The wire machinery (frame encoding, flow control, socket I/O) is an
//! external collaborator; this core owns the Sender's lifecycle: its command
//! queue, its registry of publications and destinations, and its duty-cycle
//! shape.

use std::sync::Arc;

use petrel_primitives::queue::ArrayQueue;
use petrel_primitives::MmapRegion;

use crate::agent::Agent;
use crate::command::SenderCmd;
use crate::proxy::{CommandHandler, ConductorProxy};
use crate::system_counters::SystemCounters;

const COMMAND_DRAIN_LIMIT: usize = 10;

struct PublicationEntry {
    registration_id: u64,
    destinations: Vec<u64>,
}

pub struct Sender {
    /// Keeps the CnC mapping alive for the counter views below.
    #[allow(dead_code)]
    cnc: Arc<MmapRegion>,
    command_queue: Arc<ArrayQueue<SenderCmd>>,
    #[allow(dead_code)]
    conductor_proxy: ConductorProxy,
    #[allow(dead_code)]
    system_counters: Arc<SystemCounters>,
    publications: Vec<PublicationEntry>,
}

impl Sender {
    pub fn new(
        cnc: Arc<MmapRegion>,
        command_queue: Arc<ArrayQueue<SenderCmd>>,
        conductor_proxy: ConductorProxy,
        system_counters: Arc<SystemCounters>,
    ) -> Self {
        Self {
            cnc,
            command_queue,
            conductor_proxy,
            system_counters,
            publications: Vec::new(),
        }
    }

    /// For tests and diagnostics: live publications.
    pub fn publication_count(&self) -> usize {
        self.publications.len()
    }
}

impl Agent for Sender {
    fn role_name(&self) -> &str {
        "sender"
    }

    fn do_work(&mut self) -> usize {
        let queue = self.command_queue.clone();
        queue.drain(|cmd| self.on_command(cmd), COMMAND_DRAIN_LIMIT)

        // Frame transmission would follow here; the publications registry is
        // all the egress state this layer owns.
    }

    fn on_close(&mut self) {
        log_at!(info, "sender closing; {} publications", self.publications.len());
    }
}

impl CommandHandler<SenderCmd> for Sender {
    fn on_command(&mut self, cmd: SenderCmd) {
        match cmd {
            SenderCmd::AddPublication { registration_id } => {
                if !self
                    .publications
                    .iter()
                    .any(|p| p.registration_id == registration_id)
                {
                    self.publications.push(PublicationEntry {
                        registration_id,
                        destinations: Vec::new(),
                    });
                }
            }
            SenderCmd::RemovePublication { registration_id } => {
                self.publications
                    .retain(|p| p.registration_id != registration_id);
            }
            SenderCmd::AddDestination {
                registration_id,
                endpoint_id,
            } => {
                if let Some(publication) = self
                    .publications
                    .iter_mut()
                    .find(|p| p.registration_id == registration_id)
                {
                    if !publication.destinations.contains(&endpoint_id) {
                        publication.destinations.push(endpoint_id);
                    }
                }
            }
            SenderCmd::RemoveDestination {
                registration_id,
                endpoint_id,
            } => {
                if let Some(publication) = self
                    .publications
                    .iter_mut()
                    .find(|p| p.registration_id == registration_id)
                {
                    publication.destinations.retain(|&d| d != endpoint_id);
                }
            }
        }
    }
}
