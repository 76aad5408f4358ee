//! The execution function a runner delegates the program body to.

use async_trait::async_trait;
use futures::future::BoxFuture;

use cellrun_domain::error::CellError;

use super::context::ExecutionContext;

/// Interprets a [`Program`](cellrun_domain::program::Program) against the
/// context's cell.
///
/// Return [`CellError::Stopped`] to report a cooperative stop; any other
/// error fails the run.
#[async_trait]
pub trait ProgramExecutor: Send + Sync + 'static {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), CellError>;
}

/// Executor backed by a closure, see [`executor_fn`].
#[derive(Clone)]
pub struct FnExecutor<F> {
    f: F,
}

/// Wrap a closure as a [`ProgramExecutor`].
///
/// ```ignore
/// let executor = executor_fn(|ctx| Box::pin(async move {
///     ctx.println("hello");
///     Ok(())
/// }));
/// ```
pub fn executor_fn<F>(f: F) -> FnExecutor<F>
where
    F: for<'c> Fn(&'c ExecutionContext) -> BoxFuture<'c, Result<(), CellError>>
        + Send
        + Sync
        + 'static,
{
    FnExecutor { f }
}

#[async_trait]
impl<F> ProgramExecutor for FnExecutor<F>
where
    F: for<'c> Fn(&'c ExecutionContext) -> BoxFuture<'c, Result<(), CellError>>
        + Send
        + Sync
        + 'static,
{
    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), CellError> {
        (self.f)(ctx).await
    }
}
