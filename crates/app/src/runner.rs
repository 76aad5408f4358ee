//! Program runner: executes one program against a cell on its own thread.
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted ──start──▶ Running ──▶ Completed | Failed | Stopped
//! ```
//!
//! [`ProgramRunner::start`] spawns a named OS thread hosting a private
//! current-thread tokio runtime. On that runtime the worker opens the cell,
//! runs the [`ProgramExecutor`], collects execution results, closes the cell
//! and only then writes the terminal fields of the [`ProgramRun`].
//!
//! [`ProgramRunner::stop`] can be called from any thread. It flips a
//! [`StopHandle`]; inside the worker a bridge task wakes up and calls
//! [`Cell::stop`] so hardware halts, while the body observes the same signal
//! through its [`ExecutionContext`]. Nothing is ever force-terminated.
//!
//! Panics raised by the body or by a device are caught on the worker and
//! recorded as [`CellError::Panicked`], so every started run reaches a
//! terminal state with its cell closed.

mod context;
mod executor;
mod output;
mod signal;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinError;

use cellrun_domain::error::CellError;
use cellrun_domain::id::RunId;
use cellrun_domain::motion::ExecutionResult;
use cellrun_domain::program::Program;
use cellrun_domain::run::{ProgramRun, ProgramRunState};
use cellrun_domain::time::{Timestamp, now};

use crate::cell::Cell;
use crate::sync::{lock, panic_message};

pub use context::ExecutionContext;
pub use executor::{FnExecutor, ProgramExecutor, executor_fn};
pub use output::{OutputBuffer, Tee};
pub use signal::{StopHandle, StopSignal, stop_channel};

/// Named arguments passed to a program.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// Invoked with a snapshot of the run after every state transition.
pub type StateChangeCallback = Arc<dyn Fn(&ProgramRun) + Send + Sync>;

/// Runs one program, once.
pub struct ProgramRunner {
    id: RunId,
    cell: Arc<Cell>,
    executor: Arc<dyn ProgramExecutor>,
    arguments: Arguments,
    echo_stdout: bool,
    run: Arc<Mutex<ProgramRun>>,
    stop: Mutex<Option<StopHandle>>,
    completion: Arc<Completion>,
}

impl ProgramRunner {
    pub fn new(
        cell: impl Into<Arc<Cell>>,
        program: Program,
        executor: impl ProgramExecutor,
    ) -> Self {
        let id = RunId::new();
        Self {
            id,
            cell: cell.into(),
            executor: Arc::new(executor),
            arguments: Arguments::new(),
            echo_stdout: true,
            run: Arc::new(Mutex::new(ProgramRun::new(id, program))),
            stop: Mutex::new(None),
            completion: Arc::new(Completion::default()),
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    /// Whether captured program output is also written to the process
    /// stdout. Defaults to `true`.
    #[must_use]
    pub fn echo_stdout(mut self, echo: bool) -> Self {
        self.echo_stdout = echo;
        self
    }

    #[must_use]
    pub fn id(&self) -> RunId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ProgramRunState {
        lock(&self.run).state
    }

    /// Snapshot of the run record.
    #[must_use]
    pub fn program_run(&self) -> ProgramRun {
        lock(&self.run).clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProgramRunState::Running
    }

    /// Whether a stop was requested for this run.
    #[must_use]
    pub fn stopped(&self) -> bool {
        lock(&self.stop).as_ref().is_some_and(StopHandle::is_stopped)
    }

    #[must_use]
    pub fn start_time(&self) -> Option<Timestamp> {
        lock(&self.run).start_time
    }

    #[must_use]
    pub fn execution_time(&self) -> Option<Duration> {
        lock(&self.run).execution_time()
    }

    #[must_use]
    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    /// Start the run on a dedicated thread.
    ///
    /// With `synchronous`, block until the run finished and return the
    /// program's error, if any. `on_state_change` sees every transition.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::InvalidState`] unless the run is `NotStarted`,
    /// [`CellError::ExecutionThread`] if the thread cannot be spawned, and
    /// with `synchronous` the error the program failed or stopped with.
    pub fn start(
        &self,
        synchronous: bool,
        on_state_change: Option<StateChangeCallback>,
    ) -> Result<(), CellError> {
        let (program, signal) = {
            let mut run = lock(&self.run);
            if run.state != ProgramRunState::NotStarted {
                return Err(CellError::InvalidState {
                    operation: "start",
                    state: run.state,
                });
            }
            let (handle, signal) = stop_channel();
            *lock(&self.stop) = Some(handle);
            run.state = ProgramRunState::Running;
            run.start_time = Some(now());
            (run.program.clone(), signal)
        };

        let ctx = Arc::new(ExecutionContext::new(
            self.id,
            program,
            self.arguments.clone(),
            Arc::clone(&self.cell),
            signal.clone(),
            self.echo_stdout,
        ));
        ctx.log_line(&format!("run {} started", self.id));
        tracing::info!(run = %self.id, "program run started");
        notify(on_state_change.as_ref(), &self.program_run());

        let worker = Arc::new(Worker {
            run: Arc::clone(&self.run),
            cell: Arc::clone(&self.cell),
            executor: Arc::clone(&self.executor),
            ctx,
            signal,
            completion: Arc::clone(&self.completion),
            on_state_change,
        });

        let spawned = thread::Builder::new()
            .name(format!("cellrun-{}", self.id.short()))
            .spawn({
                let worker = Arc::clone(&worker);
                move || worker.run()
            });
        if let Err(err) = spawned {
            tracing::error!(run = %self.id, %err, "failed to spawn execution thread");
            worker.finish(Outcome::failed(CellError::execution_thread(err)));
            self.completion.finish();
            return self.completion.error().map_or(Ok(()), Err);
        }

        if synchronous {
            self.completion.wait();
            if let Some(err) = self.completion.error() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Request a cooperative stop.
    ///
    /// With `synchronous`, block until the execution thread finished. The
    /// program's outcome stays in the run record and is not returned here.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::NotRunning`] unless the run is `Running`.
    pub fn stop(&self, synchronous: bool) -> Result<(), CellError> {
        if !self.is_running() {
            return Err(CellError::NotRunning);
        }
        if let Some(handle) = lock(&self.stop).as_ref() {
            handle.stop();
        }
        tracing::info!(run = %self.id, "stop requested");
        if synchronous {
            self.completion.wait();
        }
        Ok(())
    }

    /// Block until the execution thread finished.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::InvalidState`] before [`start`](Self::start),
    /// otherwise the error the program failed or stopped with, on every call.
    pub fn join(&self) -> Result<(), CellError> {
        let state = self.state();
        if state == ProgramRunState::NotStarted {
            return Err(CellError::InvalidState {
                operation: "join",
                state,
            });
        }
        self.completion.wait();
        self.completion.error().map_or(Ok(()), Err)
    }
}

impl fmt::Debug for ProgramRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramRunner")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cell", &self.cell)
            .finish_non_exhaustive()
    }
}

/// Run `program` to completion on a fresh runner.
///
/// Blocks the calling thread; from async code wrap it in
/// `tokio::task::spawn_blocking`.
///
/// # Errors
///
/// Returns the error the program failed or stopped with.
pub fn run_program(
    cell: impl Into<Arc<Cell>>,
    program: Program,
    arguments: Arguments,
    executor: impl ProgramExecutor,
) -> Result<ProgramRun, CellError> {
    let runner = ProgramRunner::new(cell, program, executor).with_arguments(arguments);
    runner.start(true, None)?;
    Ok(runner.program_run())
}

fn notify(callback: Option<&StateChangeCallback>, run: &ProgramRun) {
    if let Some(callback) = callback {
        callback(run);
    }
}

// ── Completion ─────────────────────────────────────────────────────

#[derive(Default)]
struct Completion {
    finished: Mutex<bool>,
    condvar: Condvar,
    error: Mutex<Option<CellError>>,
}

impl Completion {
    fn finish(&self) {
        *lock(&self.finished) = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut finished = lock(&self.finished);
        while !*finished {
            finished = self
                .condvar
                .wait(finished)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn error(&self) -> Option<CellError> {
        lock(&self.error).clone()
    }
}

/// Marks the run finished even if the worker unwinds.
struct FinishGuard<'a>(&'a Completion);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

// ── Worker ─────────────────────────────────────────────────────────

struct Outcome {
    result: Result<(), CellError>,
    execution_results: Vec<ExecutionResult>,
}

impl Outcome {
    fn failed(err: CellError) -> Self {
        Self {
            result: Err(err),
            execution_results: Vec::new(),
        }
    }
}

struct Worker {
    run: Arc<Mutex<ProgramRun>>,
    cell: Arc<Cell>,
    executor: Arc<dyn ProgramExecutor>,
    ctx: Arc<ExecutionContext>,
    signal: StopSignal,
    completion: Arc<Completion>,
    on_state_change: Option<StateChangeCallback>,
}

impl Worker {
    fn run(&self) {
        let _finished = FinishGuard(&self.completion);
        let outcome = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime
                .block_on(AssertUnwindSafe(self.execute()).catch_unwind())
                .unwrap_or_else(|panic| {
                    Outcome::failed(CellError::Panicked(panic_message(&*panic)))
                }),
            Err(err) => Outcome::failed(CellError::execution_thread(err)),
        };
        self.finish(outcome);
    }

    async fn execute(&self) -> Outcome {
        self.ctx.log_line("opening cell");
        if let Err(err) = self.cell.open().await {
            return Outcome::failed(err);
        }

        let bridge = tokio::spawn(stop_bridge(
            Arc::clone(&self.cell),
            self.signal.clone(),
            Arc::clone(&self.ctx),
        ));
        let body = tokio::spawn({
            let executor = Arc::clone(&self.executor);
            let ctx = Arc::clone(&self.ctx);
            async move { executor.execute(&ctx).await }
        });
        let result = body.await.unwrap_or_else(|err| Err(panicked(err)));
        bridge.abort();

        let (execution_results, collected) =
            match std::panic::catch_unwind(AssertUnwindSafe(|| self.cell.execution_results())) {
                Ok(results) => (results, Ok(())),
                Err(panic) => (Vec::new(), Err(CellError::Panicked(panic_message(&*panic)))),
            };
        let result = result.and(collected);
        self.ctx.log_line("closing cell");
        let closed = self.cell.close().await;

        let result = match (result, closed) {
            (Err(err), Err(close_err)) => {
                tracing::warn!(run = %self.ctx.run_id(), %close_err, "failed to close cell after program error");
                Err(err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        };
        Outcome {
            result,
            execution_results,
        }
    }

    /// Write the terminal fields, publish the error for joiners, then notify.
    fn finish(&self, outcome: Outcome) {
        let Outcome {
            result,
            execution_results,
        } = outcome;
        let state = match &result {
            Ok(()) => ProgramRunState::Completed,
            Err(err) if err.is_stop() => ProgramRunState::Stopped,
            Err(_) => ProgramRunState::Failed,
        };
        self.ctx.log_line(&format!("run finished: {state}"));

        let snapshot = {
            let mut run = lock(&self.run);
            run.stdout = Some(self.ctx.captured_stdout());
            run.logs = Some(self.ctx.captured_logs());
            run.store = self.ctx.store_snapshot();
            run.execution_results = execution_results;
            if let (ProgramRunState::Failed, Err(err)) = (state, &result) {
                run.record_error(err);
            }
            run.end_time = Some(now());
            run.state = state;
            run.clone()
        };
        *lock(&self.completion.error) = result.as_ref().err().cloned();

        match &result {
            Err(err) if state == ProgramRunState::Failed => {
                tracing::warn!(run = %snapshot.id, error = %err, "program run failed");
            }
            _ => tracing::info!(run = %snapshot.id, %state, "program run finished"),
        }
        notify(self.on_state_change.as_ref(), &snapshot);
    }
}

async fn stop_bridge(cell: Arc<Cell>, signal: StopSignal, ctx: Arc<ExecutionContext>) {
    signal.stopped().await;
    ctx.log_line("stop requested, halting devices");
    if let Err(err) = cell.stop().await {
        tracing::warn!(run = %ctx.run_id(), %err, "failed to halt devices");
    }
}

fn panicked(err: JoinError) -> CellError {
    let message = match err.try_into_panic() {
        Ok(payload) => panic_message(&*payload),
        Err(err) => err.to_string(),
    };
    CellError::Panicked(message)
}
