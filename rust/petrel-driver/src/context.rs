//! Driver configuration and the conclude step.
//!
//! `Context` is the mutable configuration record: every knob has a fluent
//! setter, injectable collaborators are explicit optionals, and nothing is
//! validated until `conclude`. Conclusion consumes the context and produces
//! an immutable `ConcludedContext` with every field bound, so "conclude
//! twice" and "use before conclude" cannot be expressed.
//!
//! `conclude` performs, in order: validation, CnC creation, client proxy,
//! to-driver ring, error log and default error handler, counters, proxies,
//! raw-log factory, loss report, idle strategies, consumer heartbeat, and
//! finally the CnC ready signal. Any failure before the ready signal drops
//! (and thereby unmaps) everything created so far.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use petrel_primitives::broadcast::BroadcastTransmitter;
use petrel_primitives::counters::{ConcurrentCountersManager, CountersManager};
use petrel_primitives::errorlog::DistinctErrorLog;
use petrel_primitives::queue::ArrayQueue;
use petrel_primitives::ringbuffer::MpscRingBuffer;
use petrel_primitives::{
    EpochClock, MmapRegion, NanoClock, SystemEpochClock, SystemNanoClock,
};

use crate::agent::{ErrorHandler, ThreadFactory, default_thread_factory};
use crate::client_proxy::ClientProxy;
use crate::cnc::{CncFile, CncLengths, CncParams};
use crate::command::{ConductorCmd, ReceiverCmd, SenderCmd};
use crate::config::{
    self, ChannelEndpointSupplier, CongestionControlPolicy, FlowControlPolicy, ThreadingMode,
};
use crate::error::DriverError;
use crate::idle::IdleStrategy;
use crate::loss_report::{LOSS_REPORT_FILE_NAME, LossReport};
use crate::proxy::{CommandProxy, ConductorProxy, ReceiverProxy, SenderProxy};
use crate::raw_log::RawLogFactory;
use crate::system_counters::{CountersAllocator, SystemCounterId, SystemCounters};

/// Mutable driver configuration. One driver per context; never reuse.
pub struct Context {
    dir: Option<PathBuf>,
    warn_if_directory_exists: bool,
    dir_delete_on_start: bool,
    use_windows_high_res_timer: bool,
    term_buffer_sparse_file: bool,
    spies_simulate_connection: bool,
    use_concurrent_counters_manager: bool,
    controllable_idle_strategies: bool,

    driver_timeout_ms: u64,
    client_liveness_timeout_ns: u64,
    image_liveness_timeout_ns: u64,
    publication_unblock_timeout_ns: u64,
    status_message_timeout_ns: u64,

    mtu_length: usize,
    ipc_mtu_length: usize,
    max_term_buffer_length: usize,
    publication_term_buffer_length: usize,
    ipc_publication_term_buffer_length: Option<usize>,
    initial_window_length: usize,
    socket_rcvbuf_length: usize,

    to_driver_buffer_length: usize,
    to_clients_buffer_length: usize,
    counters_values_buffer_length: usize,
    error_buffer_length: usize,
    loss_report_buffer_length: usize,
    cmd_queue_capacity: usize,

    threading_mode: ThreadingMode,
    epoch_clock: Option<Arc<dyn EpochClock>>,
    nano_clock: Option<Arc<dyn NanoClock>>,

    conductor_idle_strategy: Option<IdleStrategy>,
    sender_idle_strategy: Option<IdleStrategy>,
    receiver_idle_strategy: Option<IdleStrategy>,
    shared_idle_strategy: Option<IdleStrategy>,
    shared_network_idle_strategy: Option<IdleStrategy>,

    conductor_thread_factory: Option<ThreadFactory>,
    sender_thread_factory: Option<ThreadFactory>,
    receiver_thread_factory: Option<ThreadFactory>,
    shared_thread_factory: Option<ThreadFactory>,
    shared_network_thread_factory: Option<ThreadFactory>,

    error_handler: Option<ErrorHandler>,

    unicast_flow_control: FlowControlPolicy,
    multicast_flow_control: FlowControlPolicy,
    congestion_control: CongestionControlPolicy,
    send_channel_endpoint_supplier: Option<ChannelEndpointSupplier>,
    receive_channel_endpoint_supplier: Option<ChannelEndpointSupplier>,
    application_specific_feedback: Vec<u8>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            dir: None,
            warn_if_directory_exists: false,
            dir_delete_on_start: false,
            use_windows_high_res_timer: false,
            term_buffer_sparse_file: false,
            spies_simulate_connection: false,
            use_concurrent_counters_manager: false,
            controllable_idle_strategies: false,

            driver_timeout_ms: config::DEFAULT_DRIVER_TIMEOUT_MS,
            client_liveness_timeout_ns: config::DEFAULT_CLIENT_LIVENESS_TIMEOUT_NS,
            image_liveness_timeout_ns: config::DEFAULT_IMAGE_LIVENESS_TIMEOUT_NS,
            publication_unblock_timeout_ns: config::DEFAULT_PUBLICATION_UNBLOCK_TIMEOUT_NS,
            status_message_timeout_ns: config::DEFAULT_STATUS_MESSAGE_TIMEOUT_NS,

            mtu_length: config::DEFAULT_MTU_LENGTH,
            ipc_mtu_length: config::DEFAULT_IPC_MTU_LENGTH,
            max_term_buffer_length: config::DEFAULT_MAX_TERM_BUFFER_LENGTH,
            publication_term_buffer_length: config::DEFAULT_TERM_BUFFER_LENGTH,
            ipc_publication_term_buffer_length: None,
            initial_window_length: config::DEFAULT_INITIAL_WINDOW_LENGTH,
            socket_rcvbuf_length: config::DEFAULT_SOCKET_RCVBUF_LENGTH,

            to_driver_buffer_length: config::DEFAULT_TO_DRIVER_BUFFER_LENGTH,
            to_clients_buffer_length: config::DEFAULT_TO_CLIENTS_BUFFER_LENGTH,
            counters_values_buffer_length: config::DEFAULT_COUNTERS_VALUES_BUFFER_LENGTH,
            error_buffer_length: config::DEFAULT_ERROR_BUFFER_LENGTH,
            loss_report_buffer_length: config::DEFAULT_LOSS_REPORT_BUFFER_LENGTH,
            cmd_queue_capacity: config::CMD_QUEUE_CAPACITY,

            threading_mode: ThreadingMode::default(),
            epoch_clock: None,
            nano_clock: None,

            conductor_idle_strategy: None,
            sender_idle_strategy: None,
            receiver_idle_strategy: None,
            shared_idle_strategy: None,
            shared_network_idle_strategy: None,

            conductor_thread_factory: None,
            sender_thread_factory: None,
            receiver_thread_factory: None,
            shared_thread_factory: None,
            shared_network_thread_factory: None,

            error_handler: None,

            unicast_flow_control: FlowControlPolicy::MaxPosition,
            multicast_flow_control: FlowControlPolicy::MinPosition,
            congestion_control: CongestionControlPolicy::default(),
            send_channel_endpoint_supplier: None,
            receive_channel_endpoint_supplier: None,
            application_specific_feedback: Vec::new(),
        }
    }
}

macro_rules! setter {
    ($(#[$doc:meta])* $name:ident: $ty:ty) => {
        $(#[$doc])*
        pub fn $name(mut self, value: $ty) -> Self {
            self.$name = value;
            self
        }
    };
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// The driver state directory. Defaults to the per-user directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    setter!(
        /// Warn on stderr when the state directory already exists.
        warn_if_directory_exists: bool
    );
    setter!(
        /// Force-clean the state directory on startup, skipping arbitration.
        dir_delete_on_start: bool
    );
    setter!(
        /// Raise the Windows timer resolution for the driver's lifetime.
        use_windows_high_res_timer: bool
    );
    setter!(
        /// Create term-buffer files sparsely.
        term_buffer_sparse_file: bool
    );
    setter!(
        /// Treat a local spy subscription as a live subscriber for flow control.
        spies_simulate_connection: bool
    );
    setter!(
        /// Use the CAS-claiming counters manager so threads other than the
        /// Conductor may register counters.
        use_concurrent_counters_manager: bool
    );
    setter!(
        /// Drive every defaulted idle strategy from the
        /// CONTROLLABLE_IDLE_STRATEGY counter slot.
        controllable_idle_strategies: bool
    );
    setter!(driver_timeout_ms: u64);
    setter!(client_liveness_timeout_ns: u64);
    setter!(image_liveness_timeout_ns: u64);
    setter!(publication_unblock_timeout_ns: u64);
    setter!(status_message_timeout_ns: u64);
    setter!(mtu_length: usize);
    setter!(ipc_mtu_length: usize);
    setter!(max_term_buffer_length: usize);
    setter!(publication_term_buffer_length: usize);
    setter!(initial_window_length: usize);
    setter!(socket_rcvbuf_length: usize);
    setter!(to_driver_buffer_length: usize);
    setter!(to_clients_buffer_length: usize);
    setter!(counters_values_buffer_length: usize);
    setter!(error_buffer_length: usize);
    setter!(loss_report_buffer_length: usize);
    setter!(cmd_queue_capacity: usize);
    setter!(threading_mode: ThreadingMode);
    setter!(unicast_flow_control: FlowControlPolicy);
    setter!(multicast_flow_control: FlowControlPolicy);
    setter!(congestion_control: CongestionControlPolicy);
    setter!(application_specific_feedback: Vec<u8>);

    /// IPC publications fall back to the network term length when unset.
    pub fn ipc_publication_term_buffer_length(mut self, length: usize) -> Self {
        self.ipc_publication_term_buffer_length = Some(length);
        self
    }

    pub fn epoch_clock(mut self, clock: Arc<dyn EpochClock>) -> Self {
        self.epoch_clock = Some(clock);
        self
    }

    pub fn nano_clock(mut self, clock: Arc<dyn NanoClock>) -> Self {
        self.nano_clock = Some(clock);
        self
    }

    pub fn conductor_idle_strategy(mut self, strategy: IdleStrategy) -> Self {
        self.conductor_idle_strategy = Some(strategy);
        self
    }

    pub fn sender_idle_strategy(mut self, strategy: IdleStrategy) -> Self {
        self.sender_idle_strategy = Some(strategy);
        self
    }

    pub fn receiver_idle_strategy(mut self, strategy: IdleStrategy) -> Self {
        self.receiver_idle_strategy = Some(strategy);
        self
    }

    pub fn shared_idle_strategy(mut self, strategy: IdleStrategy) -> Self {
        self.shared_idle_strategy = Some(strategy);
        self
    }

    pub fn shared_network_idle_strategy(mut self, strategy: IdleStrategy) -> Self {
        self.shared_network_idle_strategy = Some(strategy);
        self
    }

    pub fn conductor_thread_factory(mut self, factory: ThreadFactory) -> Self {
        self.conductor_thread_factory = Some(factory);
        self
    }

    pub fn sender_thread_factory(mut self, factory: ThreadFactory) -> Self {
        self.sender_thread_factory = Some(factory);
        self
    }

    pub fn receiver_thread_factory(mut self, factory: ThreadFactory) -> Self {
        self.receiver_thread_factory = Some(factory);
        self
    }

    pub fn shared_thread_factory(mut self, factory: ThreadFactory) -> Self {
        self.shared_thread_factory = Some(factory);
        self
    }

    pub fn shared_network_thread_factory(mut self, factory: ThreadFactory) -> Self {
        self.shared_network_thread_factory = Some(factory);
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn send_channel_endpoint_supplier(mut self, supplier: ChannelEndpointSupplier) -> Self {
        self.send_channel_endpoint_supplier = Some(supplier);
        self
    }

    pub fn receive_channel_endpoint_supplier(mut self, supplier: ChannelEndpointSupplier) -> Self {
        self.receive_channel_endpoint_supplier = Some(supplier);
        self
    }

    // Pre-conclude views used by the launcher.

    pub fn configured_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(config::default_dir)
    }

    pub fn is_dir_configured(&self) -> bool {
        self.dir.is_some()
    }

    pub fn configured_threading_mode(&self) -> ThreadingMode {
        self.threading_mode
    }

    pub fn configured_driver_timeout_ms(&self) -> u64 {
        self.driver_timeout_ms
    }

    pub fn is_warn_if_directory_exists(&self) -> bool {
        self.warn_if_directory_exists
    }

    pub fn is_dir_delete_on_start(&self) -> bool {
        self.dir_delete_on_start
    }

    pub fn is_use_windows_high_res_timer(&self) -> bool {
        self.use_windows_high_res_timer
    }

    /// The wall clock, binding the default on first use.
    pub fn epoch_clock_ref(&mut self) -> Arc<dyn EpochClock> {
        self.epoch_clock
            .get_or_insert_with(|| Arc::new(SystemEpochClock))
            .clone()
    }

    /// Validate the socket-dependent configuration. The launcher calls this
    /// before directory arbitration so a hopeless configuration fails before
    /// it can touch the filesystem.
    pub fn validate_socket_buffer_lengths(&self) -> Result<(), DriverError> {
        config::validate_initial_window_length(
            self.initial_window_length,
            self.mtu_length,
            self.socket_rcvbuf_length,
        )
    }

    /// Validate everything, create and initialize the CnC file and its
    /// companions, and bind the runtime components together.
    pub fn conclude(mut self) -> Result<ConcludedContext, DriverError> {
        // (1) validation
        config::validate_mtu_length(self.mtu_length)?;
        config::validate_mtu_length(self.ipc_mtu_length)?;
        config::check_term_length(self.max_term_buffer_length)?;
        config::check_term_length(self.publication_term_buffer_length)?;
        let ipc_term_length = self
            .ipc_publication_term_buffer_length
            .unwrap_or(self.publication_term_buffer_length);
        config::check_term_length(ipc_term_length)?;

        if self.publication_term_buffer_length > self.max_term_buffer_length {
            return Err(DriverError::Configuration(format!(
                "publication term buffer length {} greater than max length {}",
                self.publication_term_buffer_length, self.max_term_buffer_length
            )));
        }
        if ipc_term_length > self.max_term_buffer_length {
            return Err(DriverError::Configuration(format!(
                "IPC publication term buffer length {ipc_term_length} greater than max length {}",
                self.max_term_buffer_length
            )));
        }

        self.validate_socket_buffer_lengths()?;

        if !self.cmd_queue_capacity.is_power_of_two() || self.cmd_queue_capacity == 0 {
            return Err(DriverError::Configuration(format!(
                "command queue capacity {} must be a power of 2",
                self.cmd_queue_capacity
            )));
        }

        let epoch_clock = self
            .epoch_clock
            .take()
            .unwrap_or_else(|| Arc::new(SystemEpochClock));
        let nano_clock = self
            .nano_clock
            .take()
            .unwrap_or_else(|| Arc::new(SystemNanoClock));

        let dir = self.dir.clone().unwrap_or_else(config::default_dir);
        std::fs::create_dir_all(&dir)?;

        // (2) CnC creation
        let lengths = CncLengths::from_capacities(
            self.to_driver_buffer_length,
            self.to_clients_buffer_length,
            self.counters_values_buffer_length,
            self.error_buffer_length,
        );
        let cnc = CncFile::create(
            &dir,
            &CncParams {
                lengths,
                client_liveness_timeout_ns: self.client_liveness_timeout_ns,
                start_timestamp_ms: epoch_clock.now_ms(),
            },
        )?;

        // (3) client proxy over the to-clients broadcast
        let transmitter = unsafe {
            BroadcastTransmitter::init(
                cnc.to_clients_region(),
                0,
                self.to_clients_buffer_length as u32,
            )
        };
        let client_proxy = ClientProxy::new(transmitter);

        // (4) to-driver MPSC ring
        let to_driver = Arc::new(unsafe {
            MpscRingBuffer::init(cnc.to_driver_region(), 0, self.to_driver_buffer_length as u32)
        });

        // (5) error log + default error handler
        let error_log = Arc::new(unsafe { DistinctErrorLog::new(cnc.error_log_region()) });
        let error_handler = self
            .error_handler
            .take()
            .unwrap_or_else(|| default_error_handler(error_log.clone(), epoch_clock.clone()));

        // (6) counters
        let mut counters = if self.use_concurrent_counters_manager {
            CountersAllocator::Concurrent(
                ConcurrentCountersManager::new(
                    cnc.counters_metadata_region(),
                    cnc.counters_values_region(),
                )
                .map_err(|e| DriverError::Configuration(e.to_string()))?,
            )
        } else {
            CountersAllocator::SingleWriter(
                CountersManager::new(
                    cnc.counters_metadata_region(),
                    cnc.counters_values_region(),
                )
                .map_err(|e| DriverError::Configuration(e.to_string()))?,
            )
        };
        let system_counters = Arc::new(
            SystemCounters::register(&mut counters)
                .map_err(|e| DriverError::Configuration(e.to_string()))?,
        );

        // (7) command queues + proxies, bound to the threading mode
        let sender_queue: Arc<ArrayQueue<SenderCmd>> =
            Arc::new(ArrayQueue::new(self.cmd_queue_capacity));
        let receiver_queue: Arc<ArrayQueue<ReceiverCmd>> =
            Arc::new(ArrayQueue::new(self.cmd_queue_capacity));
        let conductor_queue: Arc<ArrayQueue<ConductorCmd>> =
            Arc::new(ArrayQueue::new(self.cmd_queue_capacity));

        let sender_proxy = SenderProxy::new(CommandProxy::new(
            self.threading_mode,
            sender_queue.clone(),
            system_counters.get(SystemCounterId::SenderProxyFails),
        ));
        let receiver_proxy = ReceiverProxy::new(CommandProxy::new(
            self.threading_mode,
            receiver_queue.clone(),
            system_counters.get(SystemCounterId::ReceiverProxyFails),
        ));
        let conductor_proxy = ConductorProxy::new(CommandProxy::new(
            self.threading_mode,
            conductor_queue.clone(),
            system_counters.get(SystemCounterId::ConductorProxyFails),
        ));

        // (8) raw-log factory
        let raw_log_factory = RawLogFactory::new(
            &dir,
            self.max_term_buffer_length,
            self.term_buffer_sparse_file,
            error_log.clone(),
            epoch_clock.clone(),
        )?;

        // (9) loss report
        let loss_mmap = Arc::new(MmapRegion::create(
            &dir.join(LOSS_REPORT_FILE_NAME),
            self.loss_report_buffer_length,
            false,
        )?);
        let loss_report = unsafe { LossReport::new(loss_mmap.region()) };

        // (10) idle strategies
        let controllable = self.controllable_idle_strategies;
        let controllable_status = system_counters.get(SystemCounterId::ControllableIdleStrategy);
        let default_network_idle = move || {
            if controllable {
                IdleStrategy::Controllable(controllable_status)
            } else {
                config::default_backoff()
            }
        };
        let conductor_idle = self.conductor_idle_strategy.take().unwrap_or_else(move || {
            if controllable {
                IdleStrategy::Controllable(controllable_status)
            } else {
                config::default_conductor_idle()
            }
        });
        let sender_idle = self.sender_idle_strategy.take().unwrap_or_else(default_network_idle);
        let receiver_idle = self
            .receiver_idle_strategy
            .take()
            .unwrap_or_else(default_network_idle);
        let shared_idle = self.shared_idle_strategy.take().unwrap_or_else(default_network_idle);
        let shared_network_idle = self
            .shared_network_idle_strategy
            .take()
            .unwrap_or_else(default_network_idle);

        // (11) consumer heartbeat
        to_driver.set_consumer_heartbeat_ms(epoch_clock.now_ms());

        // (12) ready: from here on clients may act on the file
        cnc.signal_ready();

        Ok(ConcludedContext {
            dir,
            threading_mode: self.threading_mode,
            use_windows_high_res_timer: self.use_windows_high_res_timer,
            spies_simulate_connection: self.spies_simulate_connection,
            driver_timeout_ms: self.driver_timeout_ms,
            client_liveness_timeout_ns: self.client_liveness_timeout_ns,
            image_liveness_timeout_ns: self.image_liveness_timeout_ns,
            publication_unblock_timeout_ns: self.publication_unblock_timeout_ns,
            status_message_timeout_ns: self.status_message_timeout_ns,
            mtu_length: self.mtu_length,
            ipc_mtu_length: self.ipc_mtu_length,
            publication_term_buffer_length: self.publication_term_buffer_length,
            ipc_publication_term_buffer_length: ipc_term_length,
            initial_window_length: self.initial_window_length,
            unicast_flow_control: self.unicast_flow_control,
            multicast_flow_control: self.multicast_flow_control,
            congestion_control: self.congestion_control,
            send_channel_endpoint_supplier: self
                .send_channel_endpoint_supplier
                .take()
                .unwrap_or_else(config::default_channel_endpoint_supplier),
            receive_channel_endpoint_supplier: self
                .receive_channel_endpoint_supplier
                .take()
                .unwrap_or_else(config::default_channel_endpoint_supplier),
            application_specific_feedback: std::mem::take(
                &mut self.application_specific_feedback,
            ),
            cnc,
            to_driver,
            client_proxy: Some(client_proxy),
            error_log,
            error_handler,
            counters: Some(counters),
            system_counters,
            sender_queue,
            receiver_queue,
            conductor_queue,
            sender_proxy,
            receiver_proxy,
            conductor_proxy,
            raw_log_factory: Some(raw_log_factory),
            loss_mmap,
            loss_report: Some(loss_report),
            conductor_idle,
            sender_idle,
            receiver_idle,
            shared_idle,
            shared_network_idle,
            conductor_thread_factory: self
                .conductor_thread_factory
                .take()
                .unwrap_or_else(default_thread_factory),
            sender_thread_factory: self
                .sender_thread_factory
                .take()
                .unwrap_or_else(default_thread_factory),
            receiver_thread_factory: self
                .receiver_thread_factory
                .take()
                .unwrap_or_else(default_thread_factory),
            shared_thread_factory: self
                .shared_thread_factory
                .take()
                .unwrap_or_else(default_thread_factory),
            shared_network_thread_factory: self
                .shared_network_thread_factory
                .take()
                .unwrap_or_else(default_thread_factory),
            epoch_clock,
            nano_clock,
        })
    }
}

fn default_error_handler(
    error_log: Arc<DistinctErrorLog>,
    epoch_clock: Arc<dyn EpochClock>,
) -> ErrorHandler {
    let warned = AtomicBool::new(false);
    Arc::new(move |msg| {
        if !error_log.record(msg, epoch_clock.now_ms()) {
            if !warned.swap(true, Ordering::Relaxed) {
                eprintln!(
                    "WARNING: error log is full, consider increasing the error buffer length"
                );
            }
            eprintln!("{msg}");
        }
    })
}

/// The concluded, immutable form of the configuration: every field bound,
/// every backing buffer mapped and initialized, CnC signalled ready.
pub struct ConcludedContext {
    dir: PathBuf,
    threading_mode: ThreadingMode,
    use_windows_high_res_timer: bool,
    spies_simulate_connection: bool,

    driver_timeout_ms: u64,
    client_liveness_timeout_ns: u64,
    image_liveness_timeout_ns: u64,
    publication_unblock_timeout_ns: u64,
    status_message_timeout_ns: u64,

    mtu_length: usize,
    ipc_mtu_length: usize,
    publication_term_buffer_length: usize,
    ipc_publication_term_buffer_length: usize,
    initial_window_length: usize,

    unicast_flow_control: FlowControlPolicy,
    multicast_flow_control: FlowControlPolicy,
    congestion_control: CongestionControlPolicy,
    send_channel_endpoint_supplier: ChannelEndpointSupplier,
    receive_channel_endpoint_supplier: ChannelEndpointSupplier,
    application_specific_feedback: Vec<u8>,

    cnc: CncFile,
    to_driver: Arc<MpscRingBuffer>,
    client_proxy: Option<ClientProxy>,
    error_log: Arc<DistinctErrorLog>,
    error_handler: ErrorHandler,
    counters: Option<CountersAllocator>,
    system_counters: Arc<SystemCounters>,

    sender_queue: Arc<ArrayQueue<SenderCmd>>,
    receiver_queue: Arc<ArrayQueue<ReceiverCmd>>,
    conductor_queue: Arc<ArrayQueue<ConductorCmd>>,
    sender_proxy: SenderProxy,
    receiver_proxy: ReceiverProxy,
    conductor_proxy: ConductorProxy,

    raw_log_factory: Option<RawLogFactory>,
    loss_mmap: Arc<MmapRegion>,
    loss_report: Option<LossReport>,

    conductor_idle: IdleStrategy,
    sender_idle: IdleStrategy,
    receiver_idle: IdleStrategy,
    shared_idle: IdleStrategy,
    shared_network_idle: IdleStrategy,

    conductor_thread_factory: ThreadFactory,
    sender_thread_factory: ThreadFactory,
    receiver_thread_factory: ThreadFactory,
    shared_thread_factory: ThreadFactory,
    shared_network_thread_factory: ThreadFactory,

    epoch_clock: Arc<dyn EpochClock>,
    nano_clock: Arc<dyn NanoClock>,
}

impl ConcludedContext {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn threading_mode(&self) -> ThreadingMode {
        self.threading_mode
    }

    pub fn use_windows_high_res_timer(&self) -> bool {
        self.use_windows_high_res_timer
    }

    pub fn spies_simulate_connection(&self) -> bool {
        self.spies_simulate_connection
    }

    pub fn driver_timeout_ms(&self) -> u64 {
        self.driver_timeout_ms
    }

    pub fn client_liveness_timeout_ns(&self) -> u64 {
        self.client_liveness_timeout_ns
    }

    pub fn image_liveness_timeout_ns(&self) -> u64 {
        self.image_liveness_timeout_ns
    }

    pub fn publication_unblock_timeout_ns(&self) -> u64 {
        self.publication_unblock_timeout_ns
    }

    pub fn status_message_timeout_ns(&self) -> u64 {
        self.status_message_timeout_ns
    }

    pub fn mtu_length(&self) -> usize {
        self.mtu_length
    }

    pub fn ipc_mtu_length(&self) -> usize {
        self.ipc_mtu_length
    }

    pub fn publication_term_buffer_length(&self) -> usize {
        self.publication_term_buffer_length
    }

    pub fn ipc_publication_term_buffer_length(&self) -> usize {
        self.ipc_publication_term_buffer_length
    }

    pub fn initial_window_length(&self) -> usize {
        self.initial_window_length
    }

    pub fn unicast_flow_control(&self) -> FlowControlPolicy {
        self.unicast_flow_control
    }

    pub fn multicast_flow_control(&self) -> FlowControlPolicy {
        self.multicast_flow_control
    }

    pub fn congestion_control(&self) -> CongestionControlPolicy {
        self.congestion_control
    }

    pub fn send_channel_endpoint_supplier(&self) -> &ChannelEndpointSupplier {
        &self.send_channel_endpoint_supplier
    }

    pub fn receive_channel_endpoint_supplier(&self) -> &ChannelEndpointSupplier {
        &self.receive_channel_endpoint_supplier
    }

    pub fn application_specific_feedback(&self) -> &[u8] {
        &self.application_specific_feedback
    }

    pub fn cnc(&self) -> &CncFile {
        &self.cnc
    }

    pub fn to_driver(&self) -> &Arc<MpscRingBuffer> {
        &self.to_driver
    }

    pub fn error_log(&self) -> &Arc<DistinctErrorLog> {
        &self.error_log
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }

    pub fn system_counters(&self) -> &Arc<SystemCounters> {
        &self.system_counters
    }

    pub fn sender_proxy(&self) -> &SenderProxy {
        &self.sender_proxy
    }

    pub fn receiver_proxy(&self) -> &ReceiverProxy {
        &self.receiver_proxy
    }

    pub fn conductor_proxy(&self) -> &ConductorProxy {
        &self.conductor_proxy
    }

    pub fn sender_queue(&self) -> &Arc<ArrayQueue<SenderCmd>> {
        &self.sender_queue
    }

    pub fn receiver_queue(&self) -> &Arc<ArrayQueue<ReceiverCmd>> {
        &self.receiver_queue
    }

    pub fn conductor_queue(&self) -> &Arc<ArrayQueue<ConductorCmd>> {
        &self.conductor_queue
    }

    pub fn epoch_clock(&self) -> &Arc<dyn EpochClock> {
        &self.epoch_clock
    }

    pub fn nano_clock(&self) -> &Arc<dyn NanoClock> {
        &self.nano_clock
    }

    pub(crate) fn conductor_idle(&self) -> IdleStrategy {
        self.conductor_idle.clone()
    }

    pub(crate) fn sender_idle(&self) -> IdleStrategy {
        self.sender_idle.clone()
    }

    pub(crate) fn receiver_idle(&self) -> IdleStrategy {
        self.receiver_idle.clone()
    }

    pub(crate) fn shared_idle(&self) -> IdleStrategy {
        self.shared_idle.clone()
    }

    pub(crate) fn shared_network_idle(&self) -> IdleStrategy {
        self.shared_network_idle.clone()
    }

    pub(crate) fn conductor_thread_factory(&self) -> ThreadFactory {
        self.conductor_thread_factory.clone()
    }

    pub(crate) fn sender_thread_factory(&self) -> ThreadFactory {
        self.sender_thread_factory.clone()
    }

    pub(crate) fn receiver_thread_factory(&self) -> ThreadFactory {
        self.receiver_thread_factory.clone()
    }

    pub(crate) fn shared_thread_factory(&self) -> ThreadFactory {
        self.shared_thread_factory.clone()
    }

    pub(crate) fn shared_network_thread_factory(&self) -> ThreadFactory {
        self.shared_network_thread_factory.clone()
    }

    pub(crate) fn take_client_proxy(&mut self) -> ClientProxy {
        self.client_proxy.take().expect("client proxy already taken")
    }

    pub(crate) fn take_counters(&mut self) -> CountersAllocator {
        self.counters.take().expect("counters already taken")
    }

    pub(crate) fn take_loss_report(&mut self) -> LossReport {
        self.loss_report.take().expect("loss report already taken")
    }

    /// The raw-log factory, handed to whichever layer creates publications.
    pub fn take_raw_log_factory(&mut self) -> Option<RawLogFactory> {
        self.raw_log_factory.take()
    }

    /// Keep the loss-report mapping alive alongside its writer.
    pub(crate) fn loss_backing(&self) -> Arc<MmapRegion> {
        self.loss_mmap.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnc::CNC_FILE_NAME;
    use petrel_primitives::ManualClock;

    fn small_context(dir: &Path) -> Context {
        Context::new()
            .dir(dir)
            .to_driver_buffer_length(64 * 1024)
            .to_clients_buffer_length(64 * 1024)
            .counters_values_buffer_length(64 * 1024)
            .error_buffer_length(64 * 1024)
            .loss_report_buffer_length(64 * 1024)
    }

    #[test]
    fn conclude_builds_a_ready_cnc_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("petrel");
        let clock = Arc::new(ManualClock::new(1_234, 0));

        let ctx = small_context(&dir)
            .epoch_clock(clock.clone())
            .nano_clock(clock.clone())
            .conclude()
            .unwrap();

        assert!(ctx.cnc().is_ready());
        let header = ctx.cnc().header();
        assert_eq!(header.start_timestamp_ms, 1_234);
        assert_eq!(
            header.client_liveness_timeout_ns,
            config::DEFAULT_CLIENT_LIVENESS_TIMEOUT_NS
        );
        assert_eq!(ctx.to_driver().consumer_heartbeat_ms(), 1_234);
        assert!(dir.join(CNC_FILE_NAME).is_file());
        assert!(dir.join(LOSS_REPORT_FILE_NAME).is_file());
        assert!(dir.join("publications").is_dir());
        assert!(dir.join("images").is_dir());
    }

    #[test]
    fn header_region_lengths_match_file_size() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("petrel");
        let ctx = small_context(&dir).conclude().unwrap();

        let header = ctx.cnc().header();
        let layout = ctx.cnc().layout();
        assert_eq!(header.to_driver_len as usize, layout.lengths.to_driver_len);
        assert_eq!(header.to_clients_len as usize, layout.lengths.to_clients_len);
        assert_eq!(
            header.counters_metadata_len as usize,
            layout.lengths.counters_metadata_len
        );
        assert_eq!(
            header.counters_values_len as usize,
            layout.lengths.counters_values_len
        );
        assert_eq!(header.error_log_len as usize, layout.lengths.error_log_len);
        assert_eq!(
            std::fs::metadata(ctx.cnc().path()).unwrap().len() as usize,
            layout.total_length
        );
    }

    #[test]
    fn oversized_publication_term_is_rejected_before_any_file_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("petrel");

        let result = small_context(&dir)
            .max_term_buffer_length(64 * 1024 * 1024)
            .publication_term_buffer_length(128 * 1024 * 1024)
            .conclude();

        match result {
            Err(DriverError::Configuration(msg)) => {
                assert!(msg.contains("134217728"), "cites the configured value: {msg}");
                assert!(msg.contains("67108864"), "cites the max value: {msg}");
            }
            Err(other) => panic!("expected ConfigurationError, got {other}"),
            Ok(_) => panic!("expected ConfigurationError, got a concluded context"),
        }
        assert!(!dir.join(CNC_FILE_NAME).exists(), "no CnC file on disk");
    }

    #[test]
    fn invalid_window_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("petrel");

        let result = small_context(&dir)
            .initial_window_length(256 * 1024)
            .socket_rcvbuf_length(128 * 1024)
            .conclude();
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[test]
    fn system_counters_are_registered_and_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("petrel");
        let ctx = small_context(&dir).conclude().unwrap();

        let errors = ctx.system_counters().get(SystemCounterId::Errors);
        assert_eq!(errors.get(), 0);
        assert_eq!(errors.id(), SystemCounterId::Errors as u32);
    }

    #[test]
    fn default_error_handler_records_distinctly() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("petrel");
        let ctx = small_context(&dir).conclude().unwrap();

        let handler = ctx.error_handler().clone();
        (*handler)("network unreachable");
        (*handler)("network unreachable");

        let mut seen = Vec::new();
        petrel_primitives::errorlog::ErrorLogReader::read(
            ctx.cnc().error_log_region(),
            |count, _, _, desc| seen.push((count, desc.to_string())),
        );
        assert_eq!(seen, vec![(2, "network unreachable".to_string())]);
    }

    #[test]
    fn ipc_term_length_falls_back_to_publication_length() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("petrel");
        let ctx = small_context(&dir)
            .publication_term_buffer_length(128 * 1024)
            .conclude()
            .unwrap();
        assert_eq!(ctx.ipc_publication_term_buffer_length(), 128 * 1024);
    }
}
