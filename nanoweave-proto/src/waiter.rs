//! Completion handles shared by the blocking and async calling conventions.
//!
//! An operation that cannot finish right away registers a waiter in the
//! socket core and gets back a [`Pending`]. Blocking callers park on its
//! channel with [`Pending::wait`]; async callers await it with
//! [`Pending::wait_async`]. Both observe the same completion, so the two
//! conventions share one state machine and one deadline.

use std::fmt;
use std::sync::Weak;

use flume::Receiver;
use nanoweave_core::error::{Result, WeaveError};

use crate::socket_core::SocketCore;

/// How an operation behaves when it cannot complete immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fail with `TryAgain`.
    Poll,
    /// Register a waiter, bounded by the socket's timeout option.
    Wait,
}

/// Outcome of starting an operation.
#[derive(Debug)]
pub enum Ticket<T> {
    /// Finished without waiting.
    Done(Result<T>),
    /// Completes later.
    Waiting(Pending<T>),
}

impl<T> Ticket<T> {
    /// Block the calling thread until the operation completes.
    pub fn wait(self) -> Result<T> {
        match self {
            Self::Done(result) => result,
            Self::Waiting(pending) => pending.wait(),
        }
    }

    /// Suspend the calling task until the operation completes.
    pub async fn wait_async(self) -> Result<T> {
        match self {
            Self::Done(result) => result,
            Self::Waiting(pending) => pending.wait_async().await,
        }
    }
}

type Unclaimed<T> = Box<dyn FnOnce(&SocketCore, T) + Send + Sync>;

/// A registered waiter. Dropping it before completion deregisters it.
///
/// A value that completed the operation but was never collected goes to
/// the [`on_unclaimed`](Self::on_unclaimed) hook; a receive uses it to put
/// the message back.
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
    key: u64,
    core: Weak<SocketCore>,
    done: bool,
    unclaimed: Option<Unclaimed<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn new(rx: Receiver<Result<T>>, key: u64, core: Weak<SocketCore>) -> Self {
        Self {
            rx,
            key,
            core,
            done: false,
            unclaimed: None,
        }
    }

    pub(crate) fn on_unclaimed(mut self, hook: impl FnOnce(&SocketCore, T) + Send + Sync + 'static) -> Self {
        self.unclaimed = Some(Box::new(hook));
        self
    }

    pub fn wait(mut self) -> Result<T> {
        let result = self.rx.recv().unwrap_or(Err(WeaveError::Closed));
        self.done = true;
        result
    }

    pub async fn wait_async(mut self) -> Result<T> {
        let result = self.rx.recv_async().await.unwrap_or(Err(WeaveError::Closed));
        self.done = true;
        result
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(core) = self.core.upgrade() else {
            return;
        };
        // Deregister first so nothing completes after the check below
        core.cancel_waiter(self.key);
        if let Ok(Ok(value)) = self.rx.try_recv() {
            if let Some(hook) = self.unclaimed.take() {
                hook(&core, value);
            }
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("key", &self.key)
            .field("done", &self.done)
            .finish()
    }
}
