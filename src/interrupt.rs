//! Wakeup capabilities for cooperative blocking calls.
//!
//! A worker that parks itself in a blocking primitive cannot poll for
//! handshakes. The [`Interrupter`] capability lets the runtime wake such a
//! call promptly so the worker can service its queue and then re-enter the
//! blocking call. Different primitives need different wakeup mechanisms
//! (condvar signal, socket shutdown, OS signal), so the capability is chosen
//! by the code entering the blocking call.

use std::thread::Thread;

use parking_lot::{Condvar, Mutex};

use crate::error::Interrupted;

/// Capability that can unblock one specific cooperative blocking call.
///
/// `interrupt` is invoked by a posting thread while the target worker's
/// state lock is held, so implementations must not call back into the
/// safepoint machinery. `reset_interrupted` clears the accumulated signal
/// so later blocking calls are not spuriously woken; it may run
/// concurrently with `interrupt`.
pub trait Interrupter: Send + Sync {
    /// Wake the blocking call the given worker thread is parked in.
    fn interrupt(&self, thread: &Thread);

    /// Clear any residual wakeup signal.
    fn reset_interrupted(&self);
}

/// A stock [`Interrupter`] built from a flag and a condvar.
///
/// Blocking calls built on [`InterruptSignal::block_until`] observe
/// interrupts raised through the `Interrupter` impl and also wake on
/// [`InterruptSignal::notify_all`] when the awaited condition may have
/// changed.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use shakepoint::InterruptSignal;
///
/// let signal = InterruptSignal::new();
/// let ready = AtomicBool::new(true);
/// signal
///     .block_until(|| ready.load(Ordering::Acquire))
///     .expect("not interrupted");
/// ```
#[derive(Debug, Default)]
pub struct InterruptSignal {
    interrupted: Mutex<bool>,
    cond: Condvar,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the caller until `condition` holds or an interrupt arrives.
    ///
    /// The condition is re-evaluated after every wakeup; a pending
    /// interrupt wins over a satisfied condition so the caller drains its
    /// handshake queue before making progress. Returning [`Interrupted`]
    /// consumes the signal, like a blocking call that throws on interrupt;
    /// [`InterruptSignal::reset_interrupted`] only clears signals that
    /// arrived after the blocking call already returned.
    pub fn block_until(&self, mut condition: impl FnMut() -> bool) -> Result<(), Interrupted> {
        let mut interrupted = self.interrupted.lock();
        loop {
            if *interrupted {
                *interrupted = false;
                return Err(Interrupted);
            }
            if condition() {
                return Ok(());
            }
            self.cond.wait(&mut interrupted);
        }
    }

    /// Wakes blocked callers so they re-evaluate their condition.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupted.lock()
    }
}

impl Interrupter for InterruptSignal {
    fn interrupt(&self, _thread: &Thread) {
        *self.interrupted.lock() = true;
        self.cond.notify_all();
    }

    fn reset_interrupted(&self) {
        *self.interrupted.lock() = false;
    }
}
