//! Configuration defaults, limits, and validation.
//!
//! The driver takes an already-populated configuration record; process-wide
//! property loading is the launcher's business. Everything here is either a
//! default value for a `Context` field or a validation rule applied during
//! `conclude`.

use std::io;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DriverError;

/// Capacity of each inter-agent command queue (power of two).
pub const CMD_QUEUE_CAPACITY: usize = 1024;

/// Minimum term buffer length.
pub const TERM_MIN_LENGTH: usize = 64 * 1024;
/// Maximum term buffer length.
pub const TERM_MAX_LENGTH: usize = 1 << 30;

/// Length of the data frame header on the wire.
pub const DATA_HEADER_LENGTH: usize = 32;
/// Smallest useful MTU: one header plus a minimal payload.
pub const MTU_MIN_LENGTH: usize = DATA_HEADER_LENGTH + 32;
/// Largest UDP payload the driver will configure.
pub const MTU_MAX_LENGTH: usize = 65504;

pub const DEFAULT_MTU_LENGTH: usize = 1408;
pub const DEFAULT_IPC_MTU_LENGTH: usize = 1408;
pub const DEFAULT_TERM_BUFFER_LENGTH: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_TERM_BUFFER_LENGTH: usize = TERM_MAX_LENGTH;
pub const DEFAULT_INITIAL_WINDOW_LENGTH: usize = 128 * 1024;
pub const DEFAULT_SOCKET_RCVBUF_LENGTH: usize = 128 * 1024;

pub const DEFAULT_TO_DRIVER_BUFFER_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_TO_CLIENTS_BUFFER_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_COUNTERS_VALUES_BUFFER_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_ERROR_BUFFER_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_LOSS_REPORT_BUFFER_LENGTH: usize = 1024 * 1024;

pub const DEFAULT_DRIVER_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CLIENT_LIVENESS_TIMEOUT_NS: u64 = 5_000_000_000;
pub const DEFAULT_IMAGE_LIVENESS_TIMEOUT_NS: u64 = 10_000_000_000;
pub const DEFAULT_PUBLICATION_UNBLOCK_TIMEOUT_NS: u64 = 10_000_000_000;
pub const DEFAULT_STATUS_MESSAGE_TIMEOUT_NS: u64 = 200_000_000;

/// How many OS threads host the three worker agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// No threads: the caller pumps a composite of all three agents.
    Invoker,
    /// One thread runs Sender + Receiver + Conductor.
    Shared,
    /// One thread runs Sender + Receiver; one runs the Conductor.
    SharedNetwork,
    /// One thread per agent.
    #[default]
    Dedicated,
}

impl ThreadingMode {
    /// In these modes the producer and consumer of every inter-agent queue
    /// share a thread, so proxies dispatch inline and never enqueue.
    #[inline]
    pub fn is_inline(self) -> bool {
        matches!(self, Self::Invoker | Self::Shared)
    }
}

/// Flow-control strategy for a publication (consumed by the Sender's
/// out-of-scope wire machinery; the core only selects and carries it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlPolicy {
    /// Track the fastest receiver (unicast default).
    MaxPosition,
    /// Track the slowest receiver (multicast default).
    MinPosition,
}

/// Congestion-control strategy for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControlPolicy {
    /// Fixed window sized from the initial window length.
    #[default]
    StaticWindow,
}

/// Creates the socket backing a send or receive channel endpoint.
///
/// The channel URI is handed through untouched; endpoint specialization is a
/// collaborator concern.
pub type ChannelEndpointSupplier = Arc<dyn Fn(&str) -> io::Result<UdpSocket> + Send + Sync>;

/// Default endpoint supplier: an unbound, ephemeral-port UDP socket.
pub fn default_channel_endpoint_supplier() -> ChannelEndpointSupplier {
    Arc::new(|_channel| UdpSocket::bind(("0.0.0.0", 0)))
}

/// Default state directory: `/dev/shm` on Linux, the system temp directory
/// elsewhere, qualified by user name.
pub fn default_dir() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    base_dir().join(format!("petrel-{user}"))
}

/// A randomized directory for an embedded driver private to this process.
pub fn random_dir() -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    base_dir().join(format!(
        "petrel-{user}-{}-{sequence}-{nonce}",
        std::process::id()
    ))
}

#[cfg(target_os = "linux")]
fn base_dir() -> PathBuf {
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}

#[cfg(not(target_os = "linux"))]
fn base_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Validate a term buffer length: power of two within the allowed range.
pub fn check_term_length(length: usize) -> Result<(), DriverError> {
    if !length.is_power_of_two() || length < TERM_MIN_LENGTH || length > TERM_MAX_LENGTH {
        return Err(DriverError::Configuration(format!(
            "term buffer length {length} must be a power of 2 in \
             [{TERM_MIN_LENGTH}, {TERM_MAX_LENGTH}]"
        )));
    }
    Ok(())
}

/// Validate an MTU: in range and frame-aligned.
pub fn validate_mtu_length(mtu: usize) -> Result<(), DriverError> {
    if !(MTU_MIN_LENGTH..=MTU_MAX_LENGTH).contains(&mtu) {
        return Err(DriverError::Configuration(format!(
            "mtu length {mtu} must be in [{MTU_MIN_LENGTH}, {MTU_MAX_LENGTH}]"
        )));
    }
    if !mtu.is_multiple_of(8) {
        return Err(DriverError::Configuration(format!(
            "mtu length {mtu} must be a multiple of 8"
        )));
    }
    Ok(())
}

/// Validate the initial flow-control window against the MTU and the socket
/// receive buffer it must fit inside.
pub fn validate_initial_window_length(
    window: usize,
    mtu: usize,
    socket_rcvbuf: usize,
) -> Result<(), DriverError> {
    if window < mtu {
        return Err(DriverError::Configuration(format!(
            "initial window length {window} is less than mtu length {mtu}"
        )));
    }
    if window > socket_rcvbuf {
        return Err(DriverError::Configuration(format!(
            "initial window length {window} exceeds socket receive buffer length \
             {socket_rcvbuf}"
        )));
    }
    Ok(())
}

/// Default idle back-off ladder for the network agents.
pub fn default_backoff() -> crate::idle::IdleStrategy {
    crate::idle::IdleStrategy::Backoff {
        max_spins: 10,
        max_yields: 5,
        min_park: Duration::from_micros(1),
        max_park: Duration::from_millis(1),
    }
}

/// Default idle strategy for the Conductor.
pub fn default_conductor_idle() -> crate::idle::IdleStrategy {
    crate::idle::IdleStrategy::Sleep(Duration::from_millis(1))
}
