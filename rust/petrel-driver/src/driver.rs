//! Driver assembly and lifecycle.
//!
//! `Driver::launch` arbitrates the state directory, concludes the context,
//! constructs the three worker agents, wires the proxies to their targets,
//! and starts runners according to the threading mode:
//!
//! | mode            | threads | hosting                                  |
//! |-----------------|--------:|------------------------------------------|
//! | INVOKER         | 0       | caller pumps Sender+Receiver+Conductor   |
//! | SHARED          | 1       | one runner, composite of all three       |
//! | SHARED_NETWORK  | 2       | Sender+Receiver runner, Conductor runner |
//! | DEDICATED       | 3       | one runner per agent                     |
//!
//! Close reverses the order: runners are stopped and joined, the invoker is
//! closed, the timer guard releases, and dropping the context unmaps every
//! file mapped by conclude.

use std::path::Path;
use std::sync::{Arc, Mutex};

use petrel_primitives::MmapRegion;

use crate::agent::{Agent, AgentInvoker, AgentRunner, CompositeAgent, ErrorHandler};
use crate::command::{ConductorCmd, ReceiverCmd, SenderCmd};
use crate::conductor::{Conductor, ConductorParams};
use crate::config::{self, ThreadingMode};
use crate::context::{ConcludedContext, Context};
use crate::directory::{DirectoryOptions, ensure_directory_is_recreated};
use crate::error::DriverError;
use crate::idle::Idler;
use crate::proxy::CommandHandler;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::system_counters::SystemCounterId;
use crate::timer::HighResTimerGuard;

/// A running media driver.
///
/// Closing (or dropping) the driver stops every runner, joins the threads,
/// and releases every resource the conclude step mapped.
pub struct Driver {
    // Runners first: they must stop before the agents and context unwind.
    conductor_runner: Option<AgentRunner>,
    sender_runner: Option<AgentRunner>,
    receiver_runner: Option<AgentRunner>,
    shared_runner: Option<AgentRunner>,
    shared_network_runner: Option<AgentRunner>,
    shared_invoker: Option<AgentInvoker>,
    timer_guard: Option<HighResTimerGuard>,

    conductor: Arc<Mutex<Conductor>>,
    sender: Arc<Mutex<Sender>>,
    receiver: Arc<Mutex<Receiver>>,

    // Keeps the loss-report mapping alive for the Conductor's writer.
    #[allow(dead_code)]
    loss_backing: Arc<MmapRegion>,

    ctx: ConcludedContext,
}

impl Driver {
    /// Launch a driver with default configuration.
    pub fn launch_default() -> Result<Self, DriverError> {
        Self::launch(Context::new())
    }

    /// Arbitrate the directory, conclude the context, and start the agents.
    pub fn launch(mut ctx: Context) -> Result<Self, DriverError> {
        let dir = ctx.configured_dir();
        let epoch_clock = ctx.epoch_clock_ref();

        ensure_directory_is_recreated(
            &dir,
            &DirectoryOptions {
                warn_if_exists: ctx.is_warn_if_directory_exists(),
                delete_on_start: ctx.is_dir_delete_on_start(),
                driver_timeout_ms: ctx.configured_driver_timeout_ms(),
                epoch_clock: epoch_clock.as_ref(),
            },
        )?;

        ctx.validate_socket_buffer_lengths()?;

        let concluded = ctx.dir(dir).conclude()?;
        Self::start(concluded)
    }

    /// Launch an embedded driver in a randomized private directory, unless
    /// one was configured explicitly.
    pub fn launch_embedded(ctx: Context) -> Result<Self, DriverError> {
        let ctx = if ctx.is_dir_configured() {
            ctx
        } else {
            let dir = config::random_dir();
            ctx.dir(dir)
        };
        Self::launch(ctx)
    }

    fn start(mut ctx: ConcludedContext) -> Result<Self, DriverError> {
        let timer_guard = if ctx.use_windows_high_res_timer() {
            Some(HighResTimerGuard::enable())
        } else {
            None
        };

        let cnc_backing = ctx.cnc().backing();
        let loss_backing = ctx.loss_backing();

        let conductor = Arc::new(Mutex::new(Conductor::new(ConductorParams {
            cnc: cnc_backing.clone(),
            to_driver: ctx.to_driver().clone(),
            client_proxy: ctx.take_client_proxy(),
            command_queue: ctx.conductor_queue().clone(),
            sender_proxy: ctx.sender_proxy().clone(),
            receiver_proxy: ctx.receiver_proxy().clone(),
            counters: ctx.take_counters(),
            system_counters: ctx.system_counters().clone(),
            error_handler: ctx.error_handler().clone(),
            loss_report: ctx.take_loss_report(),
            epoch_clock: ctx.epoch_clock().clone(),
            nano_clock: ctx.nano_clock().clone(),
            client_liveness_timeout_ns: ctx.client_liveness_timeout_ns(),
        })));
        let sender = Arc::new(Mutex::new(Sender::new(
            cnc_backing.clone(),
            ctx.sender_queue().clone(),
            ctx.conductor_proxy().clone(),
            ctx.system_counters().clone(),
        )));
        let receiver = Arc::new(Mutex::new(Receiver::new(
            cnc_backing,
            ctx.receiver_queue().clone(),
            ctx.conductor_proxy().clone(),
            ctx.system_counters().clone(),
        )));

        // Proxies learn their targets only now, after construction; this is
        // what breaks the Conductor <-> Sender <-> Receiver wiring cycle.
        {
            let target: Arc<Mutex<dyn CommandHandler<SenderCmd>>> = sender.clone();
            ctx.sender_proxy().set_target(&target);
            let target: Arc<Mutex<dyn CommandHandler<ReceiverCmd>>> = receiver.clone();
            ctx.receiver_proxy().set_target(&target);
            let target: Arc<Mutex<dyn CommandHandler<ConductorCmd>>> = conductor.clone();
            ctx.conductor_proxy().set_target(&target);
        }

        let error_handler: ErrorHandler = ctx.error_handler().clone();
        let error_counter = ctx.system_counters().get(SystemCounterId::Errors);

        let mut driver = Self {
            conductor_runner: None,
            sender_runner: None,
            receiver_runner: None,
            shared_runner: None,
            shared_network_runner: None,
            shared_invoker: None,
            timer_guard,
            conductor: conductor.clone(),
            sender: sender.clone(),
            receiver: receiver.clone(),
            loss_backing,
            ctx,
        };

        let conductor_agent: Arc<Mutex<dyn Agent>> = conductor;
        let sender_agent: Arc<Mutex<dyn Agent>> = sender;
        let receiver_agent: Arc<Mutex<dyn Agent>> = receiver;

        match driver.ctx.threading_mode() {
            ThreadingMode::Invoker => {
                let composite: Arc<Mutex<dyn Agent>> = Arc::new(Mutex::new(CompositeAgent::new(
                    vec![sender_agent, receiver_agent, conductor_agent],
                )));
                driver.shared_invoker =
                    Some(AgentInvoker::new(composite, error_handler, error_counter));
            }
            ThreadingMode::Shared => {
                let composite: Arc<Mutex<dyn Agent>> = Arc::new(Mutex::new(CompositeAgent::new(
                    vec![sender_agent, receiver_agent, conductor_agent],
                )));
                driver.shared_runner = Some(AgentRunner::start(
                    composite,
                    Idler::new(driver.ctx.shared_idle()),
                    error_handler,
                    error_counter,
                    &driver.ctx.shared_thread_factory(),
                )?);
            }
            ThreadingMode::SharedNetwork => {
                driver.conductor_runner = Some(AgentRunner::start(
                    conductor_agent,
                    Idler::new(driver.ctx.conductor_idle()),
                    error_handler.clone(),
                    error_counter,
                    &driver.ctx.conductor_thread_factory(),
                )?);
                let network: Arc<Mutex<dyn Agent>> = Arc::new(Mutex::new(CompositeAgent::new(
                    vec![sender_agent, receiver_agent],
                )));
                driver.shared_network_runner = Some(AgentRunner::start(
                    network,
                    Idler::new(driver.ctx.shared_network_idle()),
                    error_handler,
                    error_counter,
                    &driver.ctx.shared_network_thread_factory(),
                )?);
            }
            ThreadingMode::Dedicated => {
                driver.conductor_runner = Some(AgentRunner::start(
                    conductor_agent,
                    Idler::new(driver.ctx.conductor_idle()),
                    error_handler.clone(),
                    error_counter,
                    &driver.ctx.conductor_thread_factory(),
                )?);
                driver.sender_runner = Some(AgentRunner::start(
                    sender_agent,
                    Idler::new(driver.ctx.sender_idle()),
                    error_handler.clone(),
                    error_counter,
                    &driver.ctx.sender_thread_factory(),
                )?);
                driver.receiver_runner = Some(AgentRunner::start(
                    receiver_agent,
                    Idler::new(driver.ctx.receiver_idle()),
                    error_handler,
                    error_counter,
                    &driver.ctx.receiver_thread_factory(),
                )?);
            }
        }

        log_at!(
            info,
            "driver started in {} ({:?} mode)",
            driver.ctx.dir().display(),
            driver.ctx.threading_mode()
        );

        Ok(driver)
    }

    /// The concluded configuration backing this driver.
    pub fn context(&self) -> &ConcludedContext {
        &self.ctx
    }

    /// The driver state directory.
    pub fn dir(&self) -> &Path {
        self.ctx.dir()
    }

    /// The invoker for the composite agent, present only in INVOKER mode.
    pub fn shared_agent_invoker(&mut self) -> Option<&mut AgentInvoker> {
        self.shared_invoker.as_mut()
    }

    /// Number of runner threads backing this driver.
    pub fn runner_count(&self) -> usize {
        [
            &self.conductor_runner,
            &self.sender_runner,
            &self.receiver_runner,
            &self.shared_runner,
            &self.shared_network_runner,
        ]
        .iter()
        .filter(|runner| runner.is_some())
        .count()
    }

    /// Role names of the live runners, for diagnostics.
    pub fn runner_roles(&self) -> Vec<String> {
        [
            &self.conductor_runner,
            &self.sender_runner,
            &self.receiver_runner,
            &self.shared_runner,
            &self.shared_network_runner,
        ]
        .iter()
        .filter_map(|runner| runner.as_ref().map(|r| r.role_name().to_string()))
        .collect()
    }

    /// The control-plane agent, for embedded inspection.
    pub fn conductor(&self) -> &Arc<Mutex<Conductor>> {
        &self.conductor
    }

    /// The egress agent, for embedded inspection.
    pub fn sender(&self) -> &Arc<Mutex<Sender>> {
        &self.sender
    }

    /// The ingress agent, for embedded inspection.
    pub fn receiver(&self) -> &Arc<Mutex<Receiver>> {
        &self.receiver
    }

    fn close_internal(&mut self) {
        if let Some(mut runner) = self.shared_runner.take() {
            runner.close();
        }
        if let Some(mut runner) = self.shared_network_runner.take() {
            runner.close();
        }
        if let Some(mut runner) = self.receiver_runner.take() {
            runner.close();
        }
        if let Some(mut runner) = self.sender_runner.take() {
            runner.close();
        }
        if let Some(mut runner) = self.conductor_runner.take() {
            runner.close();
        }
        if let Some(mut invoker) = self.shared_invoker.take() {
            invoker.close();
        }
        // Releases the raised timer resolution if this driver owned it.
        self.timer_guard.take();
    }

    /// Stop all agents, join their threads, and release every mapping.
    pub fn close(mut self) {
        self.close_internal();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close_internal();
    }
}
