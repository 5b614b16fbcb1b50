//! Tagged commands carried on the inter-agent queues.
//!
//! Commands are plain-data records: resources are referenced by registration
//! id rather than carried by value, so the queues stay trivially copyable
//! and the proxies stay cheap handles.

/// Commands consumed by the Sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderCmd {
    AddPublication {
        registration_id: u64,
    },
    RemovePublication {
        registration_id: u64,
    },
    AddDestination {
        registration_id: u64,
        endpoint_id: u64,
    },
    RemoveDestination {
        registration_id: u64,
        endpoint_id: u64,
    },
}

/// Commands consumed by the Receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverCmd {
    AddSubscription {
        registration_id: u64,
        stream_id: i32,
    },
    RemoveSubscription {
        registration_id: u64,
    },
    NewPublicationImage {
        correlation_id: u64,
        session_id: i32,
        stream_id: i32,
    },
    AddDestination {
        registration_id: u64,
        endpoint_id: u64,
    },
    RemoveDestination {
        registration_id: u64,
        endpoint_id: u64,
    },
}

/// Commands consumed by the Conductor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConductorCmd {
    /// The Receiver saw a setup frame for an unknown stream and needs the
    /// Conductor to create the image resources.
    CreatePublicationImage {
        session_id: i32,
        stream_id: i32,
        correlation_id: u64,
    },
    /// The Receiver observed loss on an image.
    RecordLoss {
        session_id: i32,
        stream_id: i32,
        bytes_lost: u64,
    },
    /// A counter owned by another agent can be reclaimed.
    ReleaseCounter { counter_id: u32 },
}
