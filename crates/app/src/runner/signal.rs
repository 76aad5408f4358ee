//! Stop signalling between the caller's thread and the execution thread.
//!
//! [`StopHandle::stop`] may be called from any thread, with or without a
//! tokio runtime. The execution side observes it either by polling
//! [`StopSignal::is_stopped`] or by awaiting [`StopSignal::stopped`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

struct Shared {
    flag: AtomicBool,
    notify: watch::Sender<bool>,
}

/// Create a connected handle/signal pair.
#[must_use]
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let shared = Arc::new(Shared {
        flag: AtomicBool::new(false),
        notify: watch::Sender::new(false),
    });
    (
        StopHandle {
            shared: Arc::clone(&shared),
        },
        StopSignal { shared },
    )
}

/// Caller side of a stop request.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Request a stop. Repeated calls are harmless.
    pub fn stop(&self) {
        self.shared.flag.store(true, Ordering::SeqCst);
        self.shared.notify.send_replace(true);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.flag.load(Ordering::SeqCst)
    }
}

/// Execution side of a stop request.
#[derive(Clone)]
pub struct StopSignal {
    shared: Arc<Shared>,
}

impl StopSignal {
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.flag.load(Ordering::SeqCst)
    }

    /// Resolve once a stop was requested, immediately if it already was.
    pub async fn stopped(&self) {
        let mut notify = self.shared.notify.subscribe();
        // The sender lives in `shared`, so the channel cannot close here.
        let _ = notify.wait_for(|stopped| *stopped).await;
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
