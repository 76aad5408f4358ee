//! What a program body sees while it runs.

use std::future::Future;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::SecondsFormat;

use cellrun_domain::error::CellError;
use cellrun_domain::id::RunId;
use cellrun_domain::program::Program;
use cellrun_domain::time::now;

use super::output::{OutputBuffer, Tee};
use super::signal::StopSignal;
use super::Arguments;
use crate::cell::Cell;
use crate::sync::lock;

/// Execution context handed to a [`ProgramExecutor`](super::ProgramExecutor).
pub struct ExecutionContext {
    run_id: RunId,
    program: Program,
    arguments: Arguments,
    cell: Arc<Cell>,
    stop: StopSignal,
    stdout: OutputBuffer,
    logs: OutputBuffer,
    echo_stdout: bool,
    store: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl ExecutionContext {
    pub(crate) fn new(
        run_id: RunId,
        program: Program,
        arguments: Arguments,
        cell: Arc<Cell>,
        stop: StopSignal,
        echo_stdout: bool,
    ) -> Self {
        Self {
            run_id,
            program,
            arguments,
            cell,
            stop,
            stdout: OutputBuffer::new(),
            logs: OutputBuffer::new(),
            echo_stdout,
            store: Mutex::new(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    #[must_use]
    pub fn argument(&self, key: &str) -> Option<&serde_json::Value> {
        self.arguments.get(key)
    }

    /// The opened cell.
    #[must_use]
    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    #[must_use]
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// # Errors
    ///
    /// Returns [`CellError::Stopped`] once a stop was requested.
    pub fn check_stop(&self) -> Result<(), CellError> {
        if self.is_stopped() {
            return Err(CellError::Stopped);
        }
        Ok(())
    }

    /// Drive `future` until it completes or a stop is requested.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::Stopped`] if the stop wins; `future` is dropped.
    pub async fn until_stopped<F: Future>(&self, future: F) -> Result<F::Output, CellError> {
        tokio::select! {
            biased;
            () = self.stop.stopped() => Err(CellError::Stopped),
            output = future => Ok(output),
        }
    }

    /// # Errors
    ///
    /// Returns [`CellError::Stopped`] if stopped before `duration` elapsed.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CellError> {
        self.until_stopped(tokio::time::sleep(duration)).await
    }

    /// A writer whose output is captured into the run's stdout.
    #[must_use]
    pub fn stdout(&self) -> Tee {
        Tee::new(self.stdout.clone(), self.echo_stdout)
    }

    /// Print one line to the captured stdout.
    pub fn println(&self, text: impl std::fmt::Display) {
        if let Err(err) = writeln!(self.stdout(), "{text}") {
            tracing::warn!(run = %self.run_id, %err, "failed to echo program output");
        }
    }

    /// Append a line to the run's log.
    pub fn log(&self, message: impl std::fmt::Display) {
        tracing::info!(run = %self.run_id, "{message}");
        self.log_line(&message.to_string());
    }

    pub(crate) fn log_line(&self, message: &str) {
        let timestamp = now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.logs.push_line(&format!("{timestamp} {message}"));
    }

    /// Store a runtime variable, reported in the run's `store`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        lock(&self.store).insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        lock(&self.store).get(key).cloned()
    }

    pub(crate) fn captured_stdout(&self) -> String {
        self.stdout.contents()
    }

    pub(crate) fn captured_logs(&self) -> String {
        self.logs.contents()
    }

    pub(crate) fn store_snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        lock(&self.store).clone()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("program", &self.program.kind)
            .field("cell", &self.cell)
            .field("stop", &self.stop)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::signal::stop_channel;

    fn context() -> (crate::runner::signal::StopHandle, ExecutionContext) {
        let (handle, signal) = stop_channel();
        let mut arguments = Arguments::new();
        arguments.insert("speed".to_string(), serde_json::json!(250));
        let ctx = ExecutionContext::new(
            RunId::new(),
            Program::waypoints("print hi"),
            arguments,
            Arc::new(Cell::new()),
            signal,
            false,
        );
        (handle, ctx)
    }

    #[test]
    fn should_capture_println() {
        let (_handle, ctx) = context();
        ctx.println("hello");
        ctx.println(42);
        assert_eq!(ctx.captured_stdout(), "hello\n42\n");
    }

    #[test]
    fn should_keep_store_values() {
        let (_handle, ctx) = context();
        ctx.set("count", 3);
        ctx.set("name", "left");
        assert_eq!(ctx.get("count"), Some(serde_json::json!(3)));
        assert_eq!(ctx.store_snapshot().len(), 2);
        assert!(ctx.get("missing").is_none());
    }

    #[test]
    fn should_timestamp_log_lines() {
        let (_handle, ctx) = context();
        ctx.log("picking part");
        let logs = ctx.captured_logs();
        assert!(logs.ends_with(" picking part\n"));
        assert!(ctx.captured_stdout().is_empty());
    }

    #[test]
    fn should_expose_arguments() {
        let (_handle, ctx) = context();
        assert_eq!(ctx.argument("speed"), Some(&serde_json::json!(250)));
        assert_eq!(ctx.program().content, "print hi");
    }

    #[tokio::test]
    async fn should_interrupt_sleep_on_stop() {
        let (handle, ctx) = context();
        assert!(ctx.check_stop().is_ok());
        handle.stop();
        let result = ctx.sleep(Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(CellError::Stopped)));
        assert!(matches!(ctx.check_stop(), Err(CellError::Stopped)));
    }

    #[tokio::test]
    async fn should_return_future_output_when_not_stopped() {
        let (_handle, ctx) = context();
        let value = ctx.until_stopped(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}
