//! Bootstrap and lifecycle core of the petrel messaging media driver.
//!
//! The driver hosts three cooperating workers that move messages between
//! processes and across the network:
//!
//! ```text
//!             ┌────────────┐
//!  clients ──▶│ Conductor  │  control plane: CnC ring, liveness, counters
//!             └─────┬──────┘
//!        commands   │   commands
//!         ┌─────────┴─────────┐
//!   ┌─────▼─────┐       ┌─────▼─────┐
//!   │  Sender   │       │ Receiver  │
//!   └───────────┘       └───────────┘
//!      egress              ingress
//! ```
//!
//! Clients discover a driver through the CnC file in the driver's state
//! directory: a memory-mapped region holding the to-driver command ring, the
//! to-clients broadcast, the counters buffers, and the error log. Nothing in
//! that file may be interpreted until its ready word reads 1.
//!
//! # Usage
//!
//! ```no_run
//! use petrel_driver::{Context, Driver, ThreadingMode};
//!
//! let driver = Driver::launch(
//!     Context::new().threading_mode(ThreadingMode::Dedicated),
//! )?;
//!
//! // ... the driver runs on its own threads ...
//!
//! driver.close();
//! # Ok::<(), petrel_driver::DriverError>(())
//! ```
//!
//! Embedded tests usually prefer `Driver::launch_embedded`, which puts the
//! driver in a randomized private directory, or `ThreadingMode::Invoker`,
//! where the caller pumps the composite agent itself.

/// Emit a driver lifecycle event at the given level.
///
/// Expands to a `tracing` event when the `tracing` feature is enabled and to
/// nothing otherwise, so the hot paths carry no logging cost by default.
macro_rules! log_at {
    ($level:ident, $($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        ::tracing::$level!($($arg)*);
    }};
}

pub mod agent;
pub mod client_proxy;
pub mod cnc;
pub mod command;
pub mod conductor;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod idle;
pub mod loss_report;
pub mod protocol;
pub mod proxy;
pub mod raw_log;
pub mod receiver;
pub mod sender;
pub mod system_counters;
pub mod timer;

mod driver;

pub use agent::{Agent, AgentInvoker, AgentRunner, CompositeAgent, ErrorHandler, ThreadFactory};
pub use cnc::{CNC_FILE_NAME, CncFile, CncHeader, CncLayout, CncLengths};
pub use config::{CongestionControlPolicy, FlowControlPolicy, ThreadingMode};
pub use context::{ConcludedContext, Context};
pub use driver::Driver;
pub use error::DriverError;
pub use idle::{IdleStrategy, Idler};
pub use loss_report::{LOSS_REPORT_FILE_NAME, LossReport, LossReportReader};
pub use proxy::{CommandHandler, ConductorProxy, ReceiverProxy, SenderProxy};
pub use system_counters::{SystemCounterId, SystemCounters};
