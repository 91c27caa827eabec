//! Handshake requests and their future-like completion handle.
//!
//! A [`Handshake`] is created when a coordinator posts an action to a set of
//! workers. Each targeted worker carries one queue entry for it; the
//! handshake itself tracks completion through its [`Phaser`]. In
//! asynchronous mode a worker runs the action at its next safepoint and
//! deregisters. In synchronous mode all workers first rendezvous (phase 0),
//! run the action, then rendezvous again (phase 1) so no worker resumes
//! user code before every action has finished.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::Mutex;

use crate::error::{self, ActionError, ActionFailure, HandshakeError};
use crate::phaser::{Phaser, Registration};
use crate::safepoint::WorkerId;

/// Program point at which a worker services a safepoint.
///
/// Carried through to actions purely for diagnostics; the runtime never
/// interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location(pub &'static str);

impl Location {
    pub const UNKNOWN: Location = Location("<unknown>");
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Work executed on each targeted worker, at that worker's safepoint.
pub type HandshakeAction = Box<dyn Fn(Location) -> Result<(), ActionError> + Send + Sync>;

/// Invoked exactly once when a handshake reaches its terminal state.
pub type DoneCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct Handshake {
    action: HandshakeAction,
    on_done: Mutex<Option<DoneCallback>>,
    pub(crate) side_effecting: bool,
    sync: bool,
    cancelled: AtomicBool,
    pub(crate) phaser: Phaser,
    /// Workers that have ever carried an entry for this handshake; guards
    /// against re-activation on a worker that already processed it.
    pub(crate) threads: DashSet<WorkerId>,
}

impl Handshake {
    pub(crate) fn new(
        action: HandshakeAction,
        on_done: DoneCallback,
        side_effecting: bool,
        sync: bool,
        initial_workers: &[WorkerId],
    ) -> Self {
        Self {
            action,
            on_done: Mutex::new(Some(on_done)),
            side_effecting,
            sync,
            cancelled: AtomicBool::new(false),
            phaser: Phaser::new(initial_workers.len()),
            threads: initial_workers.iter().copied().collect(),
        }
    }

    /// Runs this handshake's share of work on the calling worker.
    ///
    /// The phaser bookkeeping runs even when the action fails or panics,
    /// so the handshake always reaches its terminal state.
    pub(crate) fn perform(&self, location: Location) -> Result<(), ActionFailure> {
        if self.sync {
            self.phaser.arrive_and_await_advance();
        }
        let result = if self.is_cancelled() {
            Ok(())
        } else {
            match panic::catch_unwind(AssertUnwindSafe(|| (self.action)(location))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(cause)) => Err(ActionFailure::Error(cause)),
                Err(payload) => Err(ActionFailure::Panic(error::panic_message(payload))),
            }
        };
        if self.sync {
            if self.phaser.arrive_and_deregister() {
                self.fire_on_done();
            }
            self.phaser.await_advance(1);
            debug_assert!(self.phaser.is_terminated());
        } else if self.phaser.arrive_and_deregister() {
            self.fire_on_done();
        }
        result
    }

    /// Registers a late-joining worker. Returns `true` iff the worker made
    /// it into phase 0 and should queue an entry.
    pub(crate) fn activate(&self) -> bool {
        match self.phaser.register() {
            Registration::Registered { phase: 0 } => true,
            Registration::Registered { .. } => {
                // Joined too late to contribute; back out immediately.
                if self.phaser.arrive_and_deregister() {
                    self.fire_on_done();
                }
                false
            }
            Registration::Terminated => false,
        }
    }

    /// A worker opts out without performing.
    pub(crate) fn deactivate(&self) {
        if self.phaser.arrive_and_deregister() {
            self.fire_on_done();
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        if self.phaser.unarrived_parties() > 0 {
            self.cancelled.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.is_cancelled() || self.phaser.is_terminated()
    }

    pub(crate) fn fire_on_done(&self) {
        if let Some(on_done) = self.on_done.lock().take() {
            on_done();
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("side_effecting", &self.side_effecting)
            .field("sync", &self.sync)
            .field("cancelled", &self.is_cancelled())
            .field("phase", &self.phaser.phase())
            .field("terminated", &self.phaser.is_terminated())
            .finish()
    }
}

/// Completion handle returned from posting a handshake.
///
/// Clones share the same underlying handshake; any clone may be handed to
/// another worker for [`SafepointState::activate`].
///
/// [`SafepointState::activate`]: crate::safepoint::SafepointState::activate
#[derive(Clone, Debug)]
pub struct HandshakeFuture {
    inner: Arc<Handshake>,
}

impl HandshakeFuture {
    pub(crate) fn new(inner: Arc<Handshake>) -> Self {
        Self { inner }
    }

    pub(crate) fn handshake(&self) -> &Arc<Handshake> {
        &self.inner
    }

    /// Blocks until every targeted worker has started the action, and in
    /// synchronous mode also finished it.
    pub fn get(&self) {
        self.inner.phaser.await_advance(0);
        if self.inner.sync {
            self.inner.phaser.await_advance(1);
        }
    }

    /// Timed variant of [`HandshakeFuture::get`]. On [`HandshakeError::Timeout`]
    /// the handshake stays intact and may still complete later.
    pub fn get_timeout(&self, timeout: Duration) -> Result<(), HandshakeError> {
        self.inner
            .phaser
            .await_advance_timeout(0, timeout)
            .map_err(|_| HandshakeError::Timeout)?;
        if self.inner.sync {
            self.inner
                .phaser
                .await_advance_timeout(1, timeout)
                .map_err(|_| HandshakeError::Timeout)?;
        }
        Ok(())
    }

    /// Suppresses the action on every worker that has not started it yet.
    /// Returns whether the cancellation took effect. Already-running
    /// actions are unaffected, and the terminal state is still reached.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }
}
