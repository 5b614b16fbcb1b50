//! The driver's fixed set of system counters.
//!
//! Registered exactly once during `conclude`, in enumeration order, so the
//! counter ids in a fresh CnC file are deterministic for the life of the
//! file.

use petrel_primitives::counters::{
    ConcurrentCountersManager, CounterHandle, CountersError, CountersManager,
};

/// Type id used for every system counter's metadata record.
pub const SYSTEM_COUNTER_TYPE_ID: u32 = 0;

/// Aggregate driver-status counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SystemCounterId {
    BytesSent = 0,
    BytesReceived = 1,
    ReceiverProxyFails = 2,
    SenderProxyFails = 3,
    ConductorProxyFails = 4,
    NakMessagesSent = 5,
    NakMessagesReceived = 6,
    StatusMessagesSent = 7,
    StatusMessagesReceived = 8,
    HeartbeatsSent = 9,
    HeartbeatsReceived = 10,
    RetransmitsSent = 11,
    FlowControlUnderRuns = 12,
    FlowControlOverRuns = 13,
    InvalidPackets = 14,
    Errors = 15,
    ShortSends = 16,
    FreeFails = 17,
    SenderFlowControlLimits = 18,
    UnblockedPublications = 19,
    UnblockedCommands = 20,
    PossibleTtlAsymmetry = 21,
    ControllableIdleStrategy = 22,
    LossGapFills = 23,
}

impl SystemCounterId {
    pub const ALL: [SystemCounterId; 24] = [
        Self::BytesSent,
        Self::BytesReceived,
        Self::ReceiverProxyFails,
        Self::SenderProxyFails,
        Self::ConductorProxyFails,
        Self::NakMessagesSent,
        Self::NakMessagesReceived,
        Self::StatusMessagesSent,
        Self::StatusMessagesReceived,
        Self::HeartbeatsSent,
        Self::HeartbeatsReceived,
        Self::RetransmitsSent,
        Self::FlowControlUnderRuns,
        Self::FlowControlOverRuns,
        Self::InvalidPackets,
        Self::Errors,
        Self::ShortSends,
        Self::FreeFails,
        Self::SenderFlowControlLimits,
        Self::UnblockedPublications,
        Self::UnblockedCommands,
        Self::PossibleTtlAsymmetry,
        Self::ControllableIdleStrategy,
        Self::LossGapFills,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::BytesSent => "Bytes sent",
            Self::BytesReceived => "Bytes received",
            Self::ReceiverProxyFails => "Failed offers to ReceiverProxy",
            Self::SenderProxyFails => "Failed offers to SenderProxy",
            Self::ConductorProxyFails => "Failed offers to DriverConductorProxy",
            Self::NakMessagesSent => "NAKs sent",
            Self::NakMessagesReceived => "NAKs received",
            Self::StatusMessagesSent => "Status Messages sent",
            Self::StatusMessagesReceived => "Status Messages received",
            Self::HeartbeatsSent => "Heartbeats sent",
            Self::HeartbeatsReceived => "Heartbeats received",
            Self::RetransmitsSent => "Retransmits sent",
            Self::FlowControlUnderRuns => "Flow control under runs",
            Self::FlowControlOverRuns => "Flow control over runs",
            Self::InvalidPackets => "Invalid packets",
            Self::Errors => "Errors",
            Self::ShortSends => "Short sends",
            Self::FreeFails => "Failed attempts to free log buffers",
            Self::SenderFlowControlLimits => "Sender flow control limits applied",
            Self::UnblockedPublications => "Unblocked Publications",
            Self::UnblockedCommands => "Unblocked Control Commands",
            Self::PossibleTtlAsymmetry => "Possible TTL Asymmetry",
            Self::ControllableIdleStrategy => "ControllableIdleStrategy status",
            Self::LossGapFills => "Loss gap fills",
        }
    }
}

/// The counters manager flavor selected at conclude time.
///
/// The single-writer flavor assumes only the Conductor registers counters;
/// the concurrent flavor CAS-claims records so any thread may.
pub enum CountersAllocator {
    SingleWriter(CountersManager),
    Concurrent(ConcurrentCountersManager),
}

impl CountersAllocator {
    pub fn allocate(
        &mut self,
        label: &str,
        type_id: u32,
        key: &[u8],
    ) -> Result<u32, CountersError> {
        match self {
            Self::SingleWriter(manager) => manager.allocate(label, type_id, key),
            Self::Concurrent(manager) => manager.allocate(label, type_id, key),
        }
    }

    pub fn free(&mut self, id: u32) -> Result<(), CountersError> {
        match self {
            Self::SingleWriter(manager) => manager.free(id),
            Self::Concurrent(manager) => manager.free(id),
        }
    }

    pub fn counter(&self, id: u32) -> Result<CounterHandle, CountersError> {
        match self {
            Self::SingleWriter(manager) => manager.counter(id),
            Self::Concurrent(manager) => manager.counter(id),
        }
    }

    pub fn max_counters(&self) -> usize {
        match self {
            Self::SingleWriter(manager) => manager.max_counters(),
            Self::Concurrent(manager) => manager.max_counters(),
        }
    }
}

/// Typed accessors over the registered system counters.
pub struct SystemCounters {
    handles: Vec<CounterHandle>,
}

impl SystemCounters {
    /// Register the full enumeration. Must run before any other counter is
    /// allocated so the ids match the enumeration discriminants.
    pub fn register(allocator: &mut CountersAllocator) -> Result<Self, CountersError> {
        let mut handles = Vec::with_capacity(SystemCounterId::ALL.len());
        for id in SystemCounterId::ALL {
            let counter_id = allocator.allocate(id.label(), SYSTEM_COUNTER_TYPE_ID, &[])?;
            debug_assert_eq!(counter_id, id as u32);
            handles.push(allocator.counter(counter_id)?);
        }
        Ok(Self { handles })
    }

    /// Handle for one of the system counters.
    #[inline]
    pub fn get(&self, id: SystemCounterId) -> CounterHandle {
        self.handles[id as usize]
    }
}
