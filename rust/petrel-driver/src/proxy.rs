//! Typed proxies over the inter-agent command queues.
//!
//! A proxy is a cheap, cloneable handle bound to one queue, the threading
//! mode, and a fail counter. In SHARED and INVOKER modes the producing and
//! consuming agents share a thread, so proxies dispatch straight into the
//! target agent's handler and never enqueue; this is a hard invariant of
//! the design. In the threaded modes a failed (queue-full) offer bumps the
//! corresponding `*_PROXY_FAILS` counter and drops the command — producers
//! never block.
//!
//! The dispatch target is set once, after the agents are constructed, which
//! breaks the construction cycle between the three workers. Targets are
//! held weakly so the proxies do not keep dead agents alive.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use petrel_primitives::counters::CounterHandle;
use petrel_primitives::queue::ArrayQueue;

use crate::command::{ConductorCmd, ReceiverCmd, SenderCmd};
use crate::config::ThreadingMode;

/// An agent's typed command intake.
pub trait CommandHandler<C>: Send {
    fn on_command(&mut self, cmd: C);
}

/// Shared core of the typed proxies.
pub struct CommandProxy<C: Copy> {
    mode: ThreadingMode,
    queue: Arc<ArrayQueue<C>>,
    fail_counter: CounterHandle,
    target: Arc<OnceLock<Weak<Mutex<dyn CommandHandler<C>>>>>,
}

impl<C: Copy> Clone for CommandProxy<C> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            queue: self.queue.clone(),
            fail_counter: self.fail_counter,
            target: self.target.clone(),
        }
    }
}

impl<C: Copy> CommandProxy<C> {
    pub fn new(mode: ThreadingMode, queue: Arc<ArrayQueue<C>>, fail_counter: CounterHandle) -> Self {
        Self {
            mode,
            queue,
            fail_counter,
            target: Arc::new(OnceLock::new()),
        }
    }

    /// Bind the dispatch target. Called once after agent construction.
    pub fn set_target(&self, target: &Arc<Mutex<dyn CommandHandler<C>>>) {
        let _ = self.target.set(Arc::downgrade(target));
    }

    #[inline]
    pub fn mode(&self) -> ThreadingMode {
        self.mode
    }

    /// The queue this proxy produces into. The consuming agent owns the
    /// dequeue side exclusively.
    #[inline]
    pub fn queue(&self) -> &Arc<ArrayQueue<C>> {
        &self.queue
    }

    /// Offer a command: inline dispatch in SHARED/INVOKER, queued otherwise.
    pub fn offer(&self, cmd: C) {
        if self.mode.is_inline() {
            let target = self.target.get().and_then(Weak::upgrade);
            match target {
                Some(handler) => {
                    let mut guard = handler
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    guard.on_command(cmd);
                }
                None => self.fail_counter.increment(),
            }
            return;
        }

        if self.queue.try_push(cmd).is_err() {
            self.fail_counter.increment();
        }
    }
}

/// Commands a publication lifecycle to the Sender.
#[derive(Clone)]
pub struct SenderProxy(CommandProxy<SenderCmd>);

impl SenderProxy {
    pub fn new(proxy: CommandProxy<SenderCmd>) -> Self {
        Self(proxy)
    }

    pub fn set_target(&self, target: &Arc<Mutex<dyn CommandHandler<SenderCmd>>>) {
        self.0.set_target(target);
    }

    pub fn new_publication(&self, registration_id: u64) {
        self.0.offer(SenderCmd::AddPublication { registration_id });
    }

    pub fn remove_publication(&self, registration_id: u64) {
        self.0.offer(SenderCmd::RemovePublication { registration_id });
    }

    pub fn add_destination(&self, registration_id: u64, endpoint_id: u64) {
        self.0.offer(SenderCmd::AddDestination {
            registration_id,
            endpoint_id,
        });
    }

    pub fn remove_destination(&self, registration_id: u64, endpoint_id: u64) {
        self.0.offer(SenderCmd::RemoveDestination {
            registration_id,
            endpoint_id,
        });
    }

    pub fn queue(&self) -> &Arc<ArrayQueue<SenderCmd>> {
        self.0.queue()
    }
}

/// Commands a subscription lifecycle to the Receiver.
#[derive(Clone)]
pub struct ReceiverProxy(CommandProxy<ReceiverCmd>);

impl ReceiverProxy {
    pub fn new(proxy: CommandProxy<ReceiverCmd>) -> Self {
        Self(proxy)
    }

    pub fn set_target(&self, target: &Arc<Mutex<dyn CommandHandler<ReceiverCmd>>>) {
        self.0.set_target(target);
    }

    pub fn add_subscription(&self, registration_id: u64, stream_id: i32) {
        self.0.offer(ReceiverCmd::AddSubscription {
            registration_id,
            stream_id,
        });
    }

    pub fn remove_subscription(&self, registration_id: u64) {
        self.0
            .offer(ReceiverCmd::RemoveSubscription { registration_id });
    }

    pub fn new_publication_image(&self, correlation_id: u64, session_id: i32, stream_id: i32) {
        self.0.offer(ReceiverCmd::NewPublicationImage {
            correlation_id,
            session_id,
            stream_id,
        });
    }

    pub fn add_destination(&self, registration_id: u64, endpoint_id: u64) {
        self.0.offer(ReceiverCmd::AddDestination {
            registration_id,
            endpoint_id,
        });
    }

    pub fn remove_destination(&self, registration_id: u64, endpoint_id: u64) {
        self.0.offer(ReceiverCmd::RemoveDestination {
            registration_id,
            endpoint_id,
        });
    }

    pub fn queue(&self) -> &Arc<ArrayQueue<ReceiverCmd>> {
        self.0.queue()
    }
}

/// Reports network-side events back to the Conductor.
#[derive(Clone)]
pub struct ConductorProxy(CommandProxy<ConductorCmd>);

impl ConductorProxy {
    pub fn new(proxy: CommandProxy<ConductorCmd>) -> Self {
        Self(proxy)
    }

    pub fn set_target(&self, target: &Arc<Mutex<dyn CommandHandler<ConductorCmd>>>) {
        self.0.set_target(target);
    }

    pub fn create_publication_image(&self, session_id: i32, stream_id: i32, correlation_id: u64) {
        self.0.offer(ConductorCmd::CreatePublicationImage {
            session_id,
            stream_id,
            correlation_id,
        });
    }

    pub fn record_loss(&self, session_id: i32, stream_id: i32, bytes_lost: u64) {
        self.0.offer(ConductorCmd::RecordLoss {
            session_id,
            stream_id,
            bytes_lost,
        });
    }

    pub fn release_counter(&self, counter_id: u32) {
        self.0.offer(ConductorCmd::ReleaseCounter { counter_id });
    }

    pub fn queue(&self) -> &Arc<ArrayQueue<ConductorCmd>> {
        self.0.queue()
    }
}
