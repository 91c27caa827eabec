//! Error types for the handshake runtime.

use std::any::Any;
use std::error::Error;
use std::fmt;

use thiserror::Error;

use crate::safepoint::WorkerId;

/// Error type handshake actions may return.
///
/// Actions run arbitrary user code, so the error is fully opaque to the
/// runtime; it is only carried through the drain and handed back to the
/// worker that executed the action.
pub type ActionError = Box<dyn Error + Send + Sync + 'static>;

/// Errors surfaced to the coordinator posting or awaiting a handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The host reported that thread-local handshakes cannot be delivered
    /// on this platform. Raised before anything is queued.
    #[error("thread-local handshakes are not supported by this host")]
    Unsupported,
    /// One of the listed workers was gone at post time. Nothing was queued
    /// to any worker.
    #[error("worker {0} is no longer alive with a pending handshake")]
    WorkerNotAlive(WorkerId),
    /// The deadline passed while waiting for completion. The handshake
    /// itself is left intact and may still complete later.
    #[error("timed out waiting for handshake completion")]
    Timeout,
}

/// A cooperative blocking call was woken by an [`Interrupter`].
///
/// Returned by the interruptible closure handed to
/// [`SafepointState::set_blocked`]; the wakeup may be spurious, so callers
/// re-enter the blocking call after servicing handshakes.
///
/// [`Interrupter`]: crate::interrupt::Interrupter
/// [`SafepointState::set_blocked`]: crate::safepoint::SafepointState::set_blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("blocking call was interrupted")]
pub struct Interrupted;

/// A single failed action execution.
#[derive(Debug)]
pub enum ActionFailure {
    /// The action returned an error.
    Error(ActionError),
    /// The action panicked; the payload is reduced to its message.
    Panic(String),
}

impl ActionFailure {
    pub fn is_panic(&self) -> bool {
        matches!(self, ActionFailure::Panic(_))
    }
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionFailure::Error(error) => write!(f, "{}", error),
            ActionFailure::Panic(message) => write!(f, "action panicked: {}", message),
        }
    }
}

/// All action failures collected during one drain of a worker's queue.
///
/// The first failure becomes the primary; later failures are attached as
/// suppressed. A panic is never demoted: it always takes over as primary
/// and pushes the previous primary into the suppressed list.
#[derive(Debug)]
pub struct AggregateError {
    pub primary: ActionFailure,
    pub suppressed: Vec<ActionFailure>,
}

impl AggregateError {
    pub(crate) fn new(primary: ActionFailure) -> Self {
        Self {
            primary,
            suppressed: Vec::new(),
        }
    }

    /// Folds one more failure into an aggregate under the promotion rule.
    pub(crate) fn combine(current: Option<AggregateError>, failure: ActionFailure) -> Self {
        match current {
            None => AggregateError::new(failure),
            Some(mut aggregate) => {
                if failure.is_panic() {
                    let demoted = std::mem::replace(&mut aggregate.primary, failure);
                    aggregate.suppressed.push(demoted);
                } else {
                    aggregate.suppressed.push(failure);
                }
                aggregate
            }
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handshake action failed: {}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl Error for AggregateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.primary {
            ActionFailure::Error(error) => {
                let source: &(dyn Error + 'static) = &**error;
                Some(source)
            }
            ActionFailure::Panic(_) => None,
        }
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<opaque panic payload>".to_owned()
    }
}
