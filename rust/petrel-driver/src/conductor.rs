//! The Conductor: the driver's control-plane agent.
//!
//! Each duty cycle the Conductor drains its command queue, drains client
//! requests from the to-driver ring, and — at a millisecond grain — stamps
//! the consumer heartbeat that advertises driver liveness and ages out
//! clients whose keepalives have stopped. Resources owned by a timed-out
//! client are torn down through the Sender and Receiver proxies.

use std::sync::Arc;

use petrel_primitives::queue::ArrayQueue;
use petrel_primitives::ringbuffer::MpscRingBuffer;
use petrel_primitives::{EpochClock, MmapRegion, NanoClock};

use crate::agent::{Agent, ErrorHandler};
use crate::client_proxy::ClientProxy;
use crate::command::ConductorCmd;
use crate::loss_report::{LossEntryHandle, LossReport};
use crate::protocol::{
    EVT_OPERATION_SUCCESS, MSG_ADD_PUBLICATION, MSG_ADD_SUBSCRIPTION, MSG_CLIENT_KEEPALIVE,
    MSG_REMOVE_PUBLICATION, MSG_REMOVE_SUBSCRIPTION, decode_add_stream, decode_client_id,
    decode_remove_registration, encode_registration_id,
};
use crate::proxy::{CommandHandler, ReceiverProxy, SenderProxy};
use crate::system_counters::{CountersAllocator, SystemCounterId, SystemCounters};

const COMMAND_DRAIN_LIMIT: usize = 10;
const CLIENT_COMMAND_LIMIT: usize = 16;

/// Counter type id for per-client heartbeat counters.
pub const CLIENT_HEARTBEAT_TYPE_ID: u32 = 11;

/// A client process known from its keepalives.
struct ClientSession {
    client_id: i64,
    last_keepalive_ms: u64,
    /// Heartbeat counter exposed through the CnC file; reclaimed when the
    /// client is aged out.
    heartbeat_counter: Option<u32>,
}

/// A publication or subscription registered by a client.
struct StreamLink {
    registration_id: u64,
    client_id: i64,
    #[allow(dead_code)]
    stream_id: i32,
}

/// An image the Conductor has created resources for.
struct ImageEntry {
    correlation_id: u64,
    session_id: i32,
    stream_id: i32,
    loss_entry: Option<LossEntryHandle>,
}

pub struct Conductor {
    /// Keeps the CnC mapping alive for the ring and counter views below.
    #[allow(dead_code)]
    cnc: Arc<MmapRegion>,
    to_driver: Arc<MpscRingBuffer>,
    client_proxy: ClientProxy,
    command_queue: Arc<ArrayQueue<ConductorCmd>>,
    sender_proxy: SenderProxy,
    receiver_proxy: ReceiverProxy,
    counters: CountersAllocator,
    system_counters: Arc<SystemCounters>,
    error_handler: ErrorHandler,
    loss_report: LossReport,
    epoch_clock: Arc<dyn EpochClock>,
    #[allow(dead_code)]
    nano_clock: Arc<dyn NanoClock>,
    client_liveness_timeout_ns: u64,
    clients: Vec<ClientSession>,
    publications: Vec<StreamLink>,
    subscriptions: Vec<StreamLink>,
    images: Vec<ImageEntry>,
    /// Image notifications owed to the Receiver, flushed on the next duty
    /// cycle. The answer must not go out inline from `on_command`: in the
    /// single-thread modes the requesting Receiver may still be mid-cycle,
    /// and dispatching back into it would re-enter the agent.
    pending_image_notifications: Vec<(u64, i32, i32)>,
    next_registration_id: u64,
    last_timeout_check_ms: u64,
}

/// Everything the Conductor is constructed from.
pub struct ConductorParams {
    pub cnc: Arc<MmapRegion>,
    pub to_driver: Arc<MpscRingBuffer>,
    pub client_proxy: ClientProxy,
    pub command_queue: Arc<ArrayQueue<ConductorCmd>>,
    pub sender_proxy: SenderProxy,
    pub receiver_proxy: ReceiverProxy,
    pub counters: CountersAllocator,
    pub system_counters: Arc<SystemCounters>,
    pub error_handler: ErrorHandler,
    pub loss_report: LossReport,
    pub epoch_clock: Arc<dyn EpochClock>,
    pub nano_clock: Arc<dyn NanoClock>,
    pub client_liveness_timeout_ns: u64,
}

impl Conductor {
    pub fn new(params: ConductorParams) -> Self {
        Self {
            cnc: params.cnc,
            to_driver: params.to_driver,
            client_proxy: params.client_proxy,
            command_queue: params.command_queue,
            sender_proxy: params.sender_proxy,
            receiver_proxy: params.receiver_proxy,
            counters: params.counters,
            system_counters: params.system_counters,
            error_handler: params.error_handler,
            loss_report: params.loss_report,
            epoch_clock: params.epoch_clock,
            nano_clock: params.nano_clock,
            client_liveness_timeout_ns: params.client_liveness_timeout_ns,
            clients: Vec::new(),
            publications: Vec::new(),
            subscriptions: Vec::new(),
            images: Vec::new(),
            pending_image_notifications: Vec::new(),
            next_registration_id: 1,
            last_timeout_check_ms: 0,
        }
    }

    fn record_error(&self, msg: &str) {
        self.system_counters.get(SystemCounterId::Errors).increment();
        (*self.error_handler)(msg);
    }

    fn on_client_message(&mut self, msg_type: i32, payload: &[u8], now_ms: u64) {
        log_at!(trace, "client command {msg_type} ({} bytes)", payload.len());
        match msg_type {
            MSG_CLIENT_KEEPALIVE => match decode_client_id(payload) {
                Some(client_id) => self.on_client_keepalive(client_id, now_ms),
                None => self.record_error("malformed client keepalive"),
            },
            MSG_ADD_PUBLICATION => match decode_add_stream(payload) {
                Some((client_id, stream_id)) => {
                    self.on_add_publication(client_id, stream_id, now_ms);
                }
                None => self.record_error("malformed add-publication request"),
            },
            MSG_REMOVE_PUBLICATION => match decode_remove_registration(payload) {
                Some((client_id, registration_id)) => {
                    self.on_remove_publication(client_id, registration_id);
                }
                None => self.record_error("malformed remove-publication request"),
            },
            MSG_ADD_SUBSCRIPTION => match decode_add_stream(payload) {
                Some((client_id, stream_id)) => {
                    self.on_add_subscription(client_id, stream_id, now_ms);
                }
                None => self.record_error("malformed add-subscription request"),
            },
            MSG_REMOVE_SUBSCRIPTION => match decode_remove_registration(payload) {
                Some((client_id, registration_id)) => {
                    self.on_remove_subscription(client_id, registration_id);
                }
                None => self.record_error("malformed remove-subscription request"),
            },
            other => {
                self.record_error(&format!("unknown client command type {other}"));
            }
        }
    }

    fn on_client_keepalive(&mut self, client_id: i64, now_ms: u64) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.client_id == client_id) {
            client.last_keepalive_ms = now_ms;
            let counter = client.heartbeat_counter;
            self.stamp_heartbeat_counter(counter, now_ms);
            return;
        }

        log_at!(debug, "new client {client_id}");
        let heartbeat_counter = self
            .counters
            .allocate(
                &format!("client-heartbeat: {client_id}"),
                CLIENT_HEARTBEAT_TYPE_ID,
                &client_id.to_le_bytes(),
            )
            .ok();
        self.stamp_heartbeat_counter(heartbeat_counter, now_ms);
        self.clients.push(ClientSession {
            client_id,
            last_keepalive_ms: now_ms,
            heartbeat_counter,
        });
    }

    fn stamp_heartbeat_counter(&self, counter_id: Option<u32>, now_ms: u64) {
        if let Some(id) = counter_id
            && let Ok(handle) = self.counters.counter(id)
        {
            handle.set(now_ms);
        }
    }

    fn on_add_publication(&mut self, client_id: i64, stream_id: i32, now_ms: u64) {
        self.on_client_keepalive(client_id, now_ms);

        let registration_id = self.next_registration_id;
        self.next_registration_id += 1;

        self.publications.push(StreamLink {
            registration_id,
            client_id,
            stream_id,
        });
        self.sender_proxy.new_publication(registration_id);
        self.client_proxy.transmit(
            EVT_OPERATION_SUCCESS,
            &encode_registration_id(registration_id),
        );
    }

    fn on_remove_publication(&mut self, client_id: i64, registration_id: u64) {
        let found = self.publications.iter().position(|link| {
            link.registration_id == registration_id && link.client_id == client_id
        });
        match found {
            Some(index) => {
                self.publications.swap_remove(index);
                self.sender_proxy.remove_publication(registration_id);
                self.client_proxy.transmit(
                    EVT_OPERATION_SUCCESS,
                    &encode_registration_id(registration_id),
                );
            }
            None => self.record_error(&format!(
                "remove of unknown publication {registration_id} by client {client_id}"
            )),
        }
    }

    fn on_add_subscription(&mut self, client_id: i64, stream_id: i32, now_ms: u64) {
        self.on_client_keepalive(client_id, now_ms);

        let registration_id = self.next_registration_id;
        self.next_registration_id += 1;

        self.subscriptions.push(StreamLink {
            registration_id,
            client_id,
            stream_id,
        });
        self.receiver_proxy.add_subscription(registration_id, stream_id);
        self.client_proxy.transmit(
            EVT_OPERATION_SUCCESS,
            &encode_registration_id(registration_id),
        );
    }

    fn on_remove_subscription(&mut self, client_id: i64, registration_id: u64) {
        let found = self.subscriptions.iter().position(|link| {
            link.registration_id == registration_id && link.client_id == client_id
        });
        match found {
            Some(index) => {
                self.subscriptions.swap_remove(index);
                self.receiver_proxy.remove_subscription(registration_id);
                self.client_proxy.transmit(
                    EVT_OPERATION_SUCCESS,
                    &encode_registration_id(registration_id),
                );
            }
            None => self.record_error(&format!(
                "remove of unknown subscription {registration_id} by client {client_id}"
            )),
        }
    }

    /// Millisecond-grain housekeeping: heartbeat + client liveness.
    fn check_timeouts(&mut self, now_ms: u64) -> usize {
        self.to_driver.set_consumer_heartbeat_ms(now_ms);

        let timeout_ms = self.client_liveness_timeout_ns / 1_000_000;
        let mut work = 0;

        let mut index = 0;
        while index < self.clients.len() {
            if now_ms.saturating_sub(self.clients[index].last_keepalive_ms) > timeout_ms {
                let client = self.clients.swap_remove(index);
                self.on_client_timeout(client);
                work += 1;
            } else {
                index += 1;
            }
        }

        work
    }

    /// Tear down everything a dead client left behind.
    fn on_client_timeout(&mut self, client: ClientSession) {
        let client_id = client.client_id;
        log_at!(info, "client {client_id} timed out");

        if let Some(id) = client.heartbeat_counter {
            let _ = self.counters.free(id);
        }

        let mut index = 0;
        while index < self.publications.len() {
            if self.publications[index].client_id == client_id {
                let link = self.publications.swap_remove(index);
                self.sender_proxy.remove_publication(link.registration_id);
            } else {
                index += 1;
            }
        }

        let mut index = 0;
        while index < self.subscriptions.len() {
            if self.subscriptions[index].client_id == client_id {
                let link = self.subscriptions.swap_remove(index);
                self.receiver_proxy.remove_subscription(link.registration_id);
            } else {
                index += 1;
            }
        }

        self.client_proxy.on_client_timeout(client_id);
    }

    fn on_create_publication_image(
        &mut self,
        session_id: i32,
        stream_id: i32,
        correlation_id: u64,
    ) {
        if self
            .images
            .iter()
            .any(|image| image.correlation_id == correlation_id)
        {
            return;
        }

        self.images.push(ImageEntry {
            correlation_id,
            session_id,
            stream_id,
            loss_entry: None,
        });
        self.pending_image_notifications
            .push((correlation_id, session_id, stream_id));
    }

    fn on_record_loss(&mut self, session_id: i32, stream_id: i32, bytes_lost: u64) {
        let now_ms = self.epoch_clock.now_ms();

        let entry = self
            .images
            .iter()
            .position(|image| image.session_id == session_id && image.stream_id == stream_id);

        match entry {
            Some(index) => {
                if let Some(handle) = self.images[index].loss_entry {
                    handle.record_observation(bytes_lost, now_ms);
                    return;
                }
                let channel = format!("session {session_id}/stream {stream_id}");
                let created = self.loss_report.create_entry(
                    bytes_lost,
                    now_ms,
                    session_id,
                    stream_id,
                    &channel,
                    "",
                );
                match created {
                    Some(handle) => self.images[index].loss_entry = Some(handle),
                    None => log_at!(warn, "loss report full; dropping observation"),
                }
            }
            None => {
                self.record_error(&format!(
                    "loss reported for unknown image session {session_id}/stream {stream_id}"
                ));
            }
        }
    }

    /// For tests and diagnostics: known live clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// For tests and diagnostics: registered publications.
    pub fn publication_count(&self) -> usize {
        self.publications.len()
    }

    /// For tests and diagnostics: registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// For tests and diagnostics: tracked images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Agent for Conductor {
    fn role_name(&self) -> &str {
        "driver-conductor"
    }

    fn do_work(&mut self) -> usize {
        let mut work = 0;

        // Image notifications owed from earlier cycles go out first, now
        // that no other agent can be mid-request.
        for (correlation_id, session_id, stream_id) in
            self.pending_image_notifications.drain(..)
        {
            self.receiver_proxy
                .new_publication_image(correlation_id, session_id, stream_id);
            work += 1;
        }

        let queue = self.command_queue.clone();
        work += queue.drain(|cmd| self.on_command(cmd), COMMAND_DRAIN_LIMIT);

        let now_ms = self.epoch_clock.now_ms();
        let ring = self.to_driver.clone();
        work += ring.read(
            |msg_type, payload| self.on_client_message(msg_type, payload, now_ms),
            CLIENT_COMMAND_LIMIT,
        );

        if now_ms != self.last_timeout_check_ms {
            self.last_timeout_check_ms = now_ms;
            work += self.check_timeouts(now_ms);
        }

        work
    }

    fn on_close(&mut self) {
        log_at!(info, "conductor closing; {} clients known", self.clients.len());
    }
}

impl CommandHandler<ConductorCmd> for Conductor {
    fn on_command(&mut self, cmd: ConductorCmd) {
        match cmd {
            ConductorCmd::CreatePublicationImage {
                session_id,
                stream_id,
                correlation_id,
            } => self.on_create_publication_image(session_id, stream_id, correlation_id),
            ConductorCmd::RecordLoss {
                session_id,
                stream_id,
                bytes_lost,
            } => self.on_record_loss(session_id, stream_id, bytes_lost),
            ConductorCmd::ReleaseCounter { counter_id } => {
                if self.counters.free(counter_id).is_err() {
                    self.record_error(&format!("release of invalid counter {counter_id}"));
                }
            }
        }
    }
}
