//! Execution context: the two worker pools backing all asynchronous work.
//!
//! Transport tasks (resolve, connect, accept, handshake, read, write)
//! run on the I/O pool; consumer-visible work (stage transforms, endpoint
//! delivery) runs on the application pool. The split keeps a slow
//! consumer from starving accept/read progress and keeps reentrant
//! application code out of transport completions.

use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long `stop` waits for in-flight work before abandoning it.
/// Shutdown is cancellation, not a graceful drain.
const STOP_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("execution context is stopped")]
    Stopped,
    #[error("failed to build worker pool: {0}")]
    Build(#[from] std::io::Error),
}

/// Clonable pair of pool handles used by sessions, streams and stages to
/// place their work.
#[derive(Debug, Clone)]
pub struct RuntimeHandles {
    io: Handle,
    app: Handle,
}

impl RuntimeHandles {
    pub fn io(&self) -> &Handle {
        &self.io
    }

    pub fn app(&self) -> &Handle {
        &self.app
    }

    pub fn spawn_io<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.io.spawn(fut)
    }

    pub fn spawn_app<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.app.spawn(fut)
    }

    /// Handles pointing at the ambient runtime. Both pools collapse onto
    /// the caller's runtime; intended for tests and embedded use.
    pub fn current() -> Self {
        let h = Handle::current();
        Self {
            io: h.clone(),
            app: h,
        }
    }
}

enum ContextState {
    Idle,
    Running { io: Runtime, app: Runtime },
    Stopped,
}

/// Owns the I/O and application worker pools.
///
/// Lifecycle is `Idle -> Running -> Stopped` (terminal). `start` is
/// idempotent while running; `stop` is idempotent, cancels outstanding
/// work and joins the pool threads, and also runs from `Drop`.
pub struct ExecutionContext {
    state: Mutex<ContextState>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContextState::Idle),
        }
    }

    /// Spawn the worker pools. Calling `start` again while running returns
    /// the existing handles; starting a stopped context is an error.
    pub fn start(
        &self,
        nof_io_threads: usize,
        nof_app_threads: usize,
    ) -> Result<RuntimeHandles, ContextError> {
        let mut state = self.state.lock().expect("context state poisoned");
        match &*state {
            ContextState::Running { io, app } => Ok(RuntimeHandles {
                io: io.handle().clone(),
                app: app.handle().clone(),
            }),
            ContextState::Stopped => Err(ContextError::Stopped),
            ContextState::Idle => {
                let io = Builder::new_multi_thread()
                    .worker_threads(nof_io_threads.max(1))
                    .thread_name("seine-io")
                    .enable_all()
                    .build()?;
                let app = Builder::new_multi_thread()
                    .worker_threads(nof_app_threads.max(1))
                    .thread_name("seine-app")
                    .enable_all()
                    .build()?;
                info!(
                    io_threads = nof_io_threads.max(1),
                    app_threads = nof_app_threads.max(1),
                    "execution context started"
                );
                let handles = RuntimeHandles {
                    io: io.handle().clone(),
                    app: app.handle().clone(),
                };
                *state = ContextState::Running { io, app };
                Ok(handles)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            &*self.state.lock().expect("context state poisoned"),
            ContextState::Running { .. }
        )
    }

    pub fn handles(&self) -> Option<RuntimeHandles> {
        match &*self.state.lock().expect("context state poisoned") {
            ContextState::Running { io, app } => Some(RuntimeHandles {
                io: io.handle().clone(),
                app: app.handle().clone(),
            }),
            _ => None,
        }
    }

    /// Cancel outstanding work and join every pool thread. Completes even
    /// if a session still has a pending read: tasks are dropped at their
    /// next suspension point rather than drained.
    pub fn stop(&self) {
        let taken = {
            let mut state = self.state.lock().expect("context state poisoned");
            match std::mem::replace(&mut *state, ContextState::Stopped) {
                ContextState::Running { io, app } => Some((io, app)),
                _ => None,
            }
        };
        if let Some((io, app)) = taken {
            debug!("stopping execution context");
            io.shutdown_timeout(STOP_TIMEOUT);
            app.shutdown_timeout(STOP_TIMEOUT);
            info!("execution context stopped");
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.stop();
    }
}
