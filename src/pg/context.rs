//! Deadline and cancellation token passed to every suspending call.
//!
//! A [`Ctx`] is cheap to clone. The only places that wait on it are pool
//! acquisition, network reads/flushes and COPY source/sink I/O.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::error::{PgError, PgResult};

/// Why a [`Ctx`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Deadline,
    Cancelled,
}

impl From<Interrupt> for PgError {
    fn from(i: Interrupt) -> Self {
        match i {
            Interrupt::Deadline => PgError::Timeout,
            Interrupt::Cancelled => PgError::Cancelled,
        }
    }
}

/// Deadline and cancellation signal for one logical operation.
#[derive(Debug, Clone, Default)]
pub struct Ctx {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Handle that cancels every [`Ctx`] derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Fire the cancellation signal.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Ctx {
    /// A context that never fires.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that fires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// A context that fires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().deadline(deadline)
    }

    /// A cancellable context and the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        Self::background().cancellable()
    }

    /// Narrow the deadline to at most `timeout` from now.
    ///
    /// A timeout too large to represent as an instant adds no deadline.
    pub fn timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.deadline(deadline),
            None => self,
        }
    }

    /// Narrow the deadline to at most `deadline`.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a context that can additionally be cancelled through the returned handle.
    ///
    /// A context can carry one cancellation source; deriving again replaces it.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx: Arc::new(tx) })
    }

    /// The current deadline, if any.
    pub fn get_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Return the interrupt if this context has already fired.
    pub fn err(&self) -> Option<Interrupt> {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(Interrupt::Deadline),
            _ => None,
        }
    }

    /// Fail fast if the context has already fired.
    pub fn check(&self) -> PgResult<()> {
        match self.err() {
            Some(i) => Err(i.into()),
            None => Ok(()),
        }
    }

    /// Resolve when the context fires. Never resolves for a background context.
    pub async fn done(&self) -> Interrupt {
        let cancelled = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    // A dropped handle can never cancel.
                    if rx.wait_for(|c| *c).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Interrupt::Cancelled,
            _ = expired => Interrupt::Deadline,
        }
    }

    /// Run `fut` unless the context fires first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        if let Some(i) = self.err() {
            return Err(i);
        }
        tokio::select! {
            out = fut => Ok(out),
            i = self.done() => Err(i),
        }
    }
}
