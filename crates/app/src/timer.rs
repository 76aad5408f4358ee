//! Built-in timer device, present in every cell under [`TIMER`].

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use cellrun_domain::error::CellError;

use crate::ports::{Device, Stoppable};

/// Identifier of the built-in timer.
pub const TIMER: &str = "timer";

/// Waits that are interrupted when the cell is stopped.
pub struct Timer {
    active: AtomicBool,
    halted: watch::Sender<bool>,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(false),
            halted: watch::Sender::new(false),
        }
    }
}

impl Timer {
    /// Sleep for `duration`.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::Stopped`] if the timer is stopped before or
    /// during the wait.
    pub async fn wait(&self, duration: Duration) -> Result<(), CellError> {
        let mut halted = self.halted.subscribe();
        tokio::select! {
            biased;
            _ = halted.wait_for(|halted| *halted) => Err(CellError::Stopped),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[async_trait]
impl Device for Timer {
    fn identifier(&self) -> &str {
        TIMER
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), CellError> {
        self.halted.send_replace(false);
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), CellError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }
}

#[async_trait]
impl Stoppable for Timer {
    async fn stop(&self) -> Result<(), CellError> {
        self.halted.send_replace(true);
        Ok(())
    }
}
