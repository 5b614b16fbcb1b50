//! Agents and their runtime.
//!
//! An agent is a cooperatively scheduled worker: `do_work` performs one duty
//! cycle and reports how much it achieved; the runner applies the agent's
//! idle strategy whenever a cycle comes back empty. A panic inside
//! `do_work` is contained: it is reported through the error handler, counted
//! in the ERRORS counter, and terminates only that agent's loop — the rest
//! of the driver keeps running.

use std::any::Any;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use petrel_primitives::counters::CounterHandle;

use crate::idle::Idler;

/// A cooperatively-scheduled worker.
pub trait Agent: Send {
    /// Name used for the hosting thread and diagnostics.
    fn role_name(&self) -> &str;

    /// Perform one duty cycle; returns the amount of work done.
    ///
    /// Must not block beyond what its idle strategy permits.
    fn do_work(&mut self) -> usize;

    /// Release resources. Called exactly once when the agent stops.
    fn on_close(&mut self) {}
}

/// Reports an error described by `msg`. Thread-safe.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Creates the OS thread hosting a runner.
pub type ThreadFactory =
    Arc<dyn Fn(String, Box<dyn FnOnce() + Send + 'static>) -> io::Result<JoinHandle<()>> + Send + Sync>;

/// Default thread factory: a plain named thread.
pub fn default_thread_factory() -> ThreadFactory {
    Arc::new(|name, body| std::thread::Builder::new().name(name).spawn(body))
}

fn lock_ignore_poison<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "agent panicked".to_string()
    }
}

/// Runs several agents as one, for the SHARED and SHARED_NETWORK modes.
pub struct CompositeAgent {
    agents: Vec<Arc<Mutex<dyn Agent>>>,
    role_name: String,
}

impl CompositeAgent {
    pub fn new(agents: Vec<Arc<Mutex<dyn Agent>>>) -> Self {
        let names: Vec<String> = agents
            .iter()
            .map(|a| lock_ignore_poison(a).role_name().to_string())
            .collect();
        Self {
            agents,
            role_name: format!("[{}]", names.join(",")),
        }
    }
}

impl Agent for CompositeAgent {
    fn role_name(&self) -> &str {
        &self.role_name
    }

    fn do_work(&mut self) -> usize {
        let mut work = 0;
        for agent in &self.agents {
            work += lock_ignore_poison(agent).do_work();
        }
        work
    }

    fn on_close(&mut self) {
        for agent in &self.agents {
            lock_ignore_poison(agent).on_close();
        }
    }
}

/// Hosts one agent on one OS thread.
pub struct AgentRunner {
    role_name: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AgentRunner {
    /// Spawn a thread running the agent's duty-cycle loop.
    pub fn start(
        agent: Arc<Mutex<dyn Agent>>,
        mut idler: Idler,
        error_handler: ErrorHandler,
        error_counter: CounterHandle,
        thread_factory: &ThreadFactory,
    ) -> io::Result<Self> {
        let role_name = lock_ignore_poison(&agent).role_name().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let body = move || {
            loop {
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }

                match catch_unwind(AssertUnwindSafe(|| lock_ignore_poison(&agent).do_work())) {
                    Ok(work_count) => idler.idle(work_count),
                    Err(payload) => {
                        error_counter.increment();
                        (*error_handler)(&panic_message(payload.as_ref()));
                        break;
                    }
                }
            }

            let _ = catch_unwind(AssertUnwindSafe(|| {
                lock_ignore_poison(&agent).on_close();
            }));
        };

        let thread = (thread_factory.as_ref())(role_name.clone(), Box::new(body))?;

        Ok(Self {
            role_name,
            stop,
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    /// Signal the loop to stop and join the thread. Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pumps an agent from the caller's thread (INVOKER mode).
pub struct AgentInvoker {
    agent: Arc<Mutex<dyn Agent>>,
    error_handler: ErrorHandler,
    error_counter: CounterHandle,
    closed: bool,
}

impl AgentInvoker {
    pub fn new(
        agent: Arc<Mutex<dyn Agent>>,
        error_handler: ErrorHandler,
        error_counter: CounterHandle,
    ) -> Self {
        Self {
            agent,
            error_handler,
            error_counter,
            closed: false,
        }
    }

    /// Run one duty cycle; returns the work done. Errors are reported and
    /// contained, and the invoker stays usable.
    pub fn invoke(&mut self) -> usize {
        if self.closed {
            return 0;
        }

        match catch_unwind(AssertUnwindSafe(|| {
            lock_ignore_poison(&self.agent).do_work()
        })) {
            Ok(work_count) => work_count,
            Err(payload) => {
                self.error_counter.increment();
                (*self.error_handler)(&panic_message(payload.as_ref()));
                0
            }
        }
    }

    /// Close the agent. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = catch_unwind(AssertUnwindSafe(|| {
                lock_ignore_poison(&self.agent).on_close();
            }));
        }
    }
}

impl Drop for AgentInvoker {
    fn drop(&mut self) {
        self.close();
    }
}
