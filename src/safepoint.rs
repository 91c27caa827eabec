//! Per-worker safepoint state: pending flag, handshake queue, side-effect
//! gating, and blocking-call interception.
//!
//! Every worker owns one [`SafepointState`]. The polling hot path reads a
//! single atomic flag; everything else lives behind the state's mutex. A
//! poster raises the flag after queueing an entry and, when the worker is
//! parked in a cooperative blocking call, fires the installed
//! [`Interrupter`] so the worker wakes up and drains promptly.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use parking_lot::Mutex;
use tracing::trace;

use crate::engine::{EngineCounters, HandshakeHooks};
use crate::error::{AggregateError, Interrupted};
use crate::handshake::{Handshake, HandshakeFuture, Location};
use crate::interrupt::Interrupter;

/// Identity of a worker registered with a [`HandshakeEngine`].
///
/// [`HandshakeEngine`]: crate::engine::HandshakeEngine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One queued (worker, handshake) pairing.
pub(crate) struct HandshakeEntry {
    handshake: Arc<Handshake>,
    active: bool,
}

struct SafepointInner {
    queue: VecDeque<HandshakeEntry>,
    side_effects_enabled: bool,
    blocked_action: Option<Arc<dyn Interrupter>>,
}

impl SafepointInner {
    fn entry_eligible(&self, entry: &HandshakeEntry) -> bool {
        entry.active && (self.side_effects_enabled || !entry.handshake.side_effecting)
    }

    /// Is an eligible entry really queued?
    fn is_pending(&self) -> bool {
        self.queue.iter().any(|entry| self.entry_eligible(entry))
    }

    fn eligible_handshakes(&self) -> Vec<Arc<Handshake>> {
        self.queue
            .iter()
            .filter(|entry| self.entry_eligible(entry))
            .map(|entry| Arc::clone(&entry.handshake))
            .collect()
    }
}

/// Per-worker safepoint state.
///
/// Obtained through [`HandshakeEngine::current`]; all methods except the
/// poster-facing internals must be called on the owning worker thread.
///
/// [`HandshakeEngine::current`]: crate::engine::HandshakeEngine::current
pub struct SafepointState {
    id: WorkerId,
    thread: Thread,
    /// Fast-path advisory read by [`SafepointState::poll`]. Written under
    /// the mutex; the mutex re-checks eligibility on the slow path.
    fast_pending: AtomicBool,
    /// Written under the mutex. Read outside it because some interrupters
    /// need `reset_interrupted` concurrent with `interrupt`.
    interrupted: AtomicBool,
    inner: Mutex<SafepointInner>,
    hooks: Arc<dyn HandshakeHooks>,
    counters: Arc<EngineCounters>,
}

impl SafepointState {
    pub(crate) fn new(
        id: WorkerId,
        hooks: Arc<dyn HandshakeHooks>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            id,
            thread: thread::current(),
            fast_pending: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            inner: Mutex::new(SafepointInner {
                queue: VecDeque::new(),
                side_effects_enabled: true,
                blocked_action: None,
            }),
            hooks,
            counters,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the fast-path pending flag is currently raised.
    pub fn has_fast_pending(&self) -> bool {
        self.fast_pending.load(Ordering::Acquire)
    }

    /// Services pending handshakes, if any.
    ///
    /// The fast path is a single atomic load. The slow path drains every
    /// eligible entry in insertion order, executing each action outside the
    /// state mutex, and re-raises collected action failures at the end.
    pub fn poll(&self, location: Location) -> Result<(), AggregateError> {
        self.assert_owning_thread();
        self.counters.record_poll();
        if !self.fast_pending.load(Ordering::Acquire) {
            return Ok(());
        }
        self.counters.record_slow_path();
        let to_process = self.take_handshakes();
        self.process_handshakes(location, to_process)
    }

    /// Snapshot the eligible entries and acknowledge a delivered interrupt.
    fn take_handshakes(&self) -> Vec<Arc<Handshake>> {
        let inner = self.inner.lock();
        if self.interrupted.load(Ordering::Acquire) {
            if let Some(blocked) = &inner.blocked_action {
                blocked.reset_interrupted();
            }
            self.interrupted.store(false, Ordering::Release);
        }
        inner.eligible_handshakes()
    }

    fn process_handshakes(
        &self,
        location: Location,
        to_process: Vec<Arc<Handshake>>,
    ) -> Result<(), AggregateError> {
        if !to_process.is_empty() {
            trace!(worker = %self.id, count = to_process.len(), %location, "draining handshakes");
        }
        let mut aggregate: Option<AggregateError> = None;
        for handshake in to_process {
            if self.claim_entry(&handshake) {
                if let Err(failure) = handshake.perform(location) {
                    aggregate = Some(AggregateError::combine(aggregate, failure));
                }
            }
        }
        self.reset_pending();
        match aggregate {
            Some(aggregate) => Err(aggregate),
            None => Ok(()),
        }
    }

    /// Removes the first queued entry for `handshake`; fails when another
    /// path (drain or deactivation) already claimed it.
    fn claim_entry(&self, handshake: &Arc<Handshake>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(position) = inner
            .queue
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.handshake, handshake))
        {
            inner.queue.remove(position);
            true
        } else {
            false
        }
    }

    fn reset_pending(&self) {
        let inner = self.inner.lock();
        self.reset_pending_locked(&inner);
    }

    fn reset_pending_locked(&self, inner: &SafepointInner) {
        if self.fast_pending.load(Ordering::Relaxed) && !inner.is_pending() {
            self.fast_pending.store(false, Ordering::Release);
            self.hooks.clear_fast_pending(self.id);
        }
    }

    /// Poster-side entry: queue the handshake, raise the flag, wake the
    /// worker if it is blocked.
    pub(crate) fn add_handshake(&self, handshake: Arc<Handshake>) {
        let mut inner = self.inner.lock();
        self.add_handshake_locked(&mut inner, handshake);
    }

    fn add_handshake_locked(&self, inner: &mut SafepointInner, handshake: Arc<Handshake>) {
        inner.queue.push_back(HandshakeEntry {
            handshake,
            active: true,
        });
        if inner.is_pending() {
            self.raise_pending_and_interrupt(inner);
        }
    }

    fn raise_pending_and_interrupt(&self, inner: &SafepointInner) {
        if !self.fast_pending.load(Ordering::Relaxed) {
            self.fast_pending.store(true, Ordering::Release);
            self.hooks.set_fast_pending(self.id);
        }
        if let Some(blocked) = &inner.blocked_action {
            self.interrupted.store(true, Ordering::Release);
            trace!(worker = %self.id, "interrupting blocked worker");
            blocked.interrupt(&self.thread);
        }
    }

    /// Joins an already-posted handshake on this worker.
    ///
    /// A no-op when the handshake is done, already queued here, was already
    /// processed here, or closed its rendezvous before we could register.
    pub fn activate(&self, future: &HandshakeFuture) {
        self.assert_owning_thread();
        let handshake = future.handshake();
        if handshake.is_done() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner
            .queue
            .iter()
            .any(|entry| Arc::ptr_eq(&entry.handshake, handshake))
        {
            return;
        }
        if !handshake.threads.insert(self.id) {
            // Already processed on this worker; never run an action twice.
            return;
        }
        if handshake.activate() {
            trace!(worker = %self.id, "late-activated on handshake");
            self.add_handshake_locked(&mut inner, Arc::clone(handshake));
        }
    }

    /// Voluntarily opts this worker out of a pending handshake.
    pub fn deactivate(&self, future: &HandshakeFuture) {
        self.assert_owning_thread();
        let handshake = future.handshake();
        let mut inner = self.inner.lock();
        if let Some(position) = inner
            .queue
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.handshake, handshake) && entry.active)
        {
            if let Some(mut entry) = inner.queue.remove(position) {
                entry.active = false;
                trace!(worker = %self.id, "deactivated from handshake");
                handshake.deactivate();
                self.reset_pending_locked(&inner);
            }
        }
    }

    /// Flips side-effect gating and returns the prior value.
    ///
    /// Disabling hides side-effecting entries from the drain; re-enabling
    /// re-raises the pending flag (and re-interrupts a blocked worker) when
    /// suppressed work is waiting.
    pub fn set_allow_side_effects(&self, enabled: bool) -> bool {
        self.assert_owning_thread();
        let mut inner = self.inner.lock();
        let previous = inner.side_effects_enabled;
        inner.side_effects_enabled = enabled;
        if inner.is_pending() {
            self.raise_pending_and_interrupt(&inner);
        } else {
            self.reset_pending_locked(&inner);
        }
        previous
    }

    /// Whether side effects are currently disallowed while side-effecting
    /// work sits in the queue.
    pub fn has_pending_side_effecting_actions(&self) -> bool {
        self.assert_owning_thread();
        let inner = self.inner.lock();
        !inner.side_effects_enabled
            && inner
                .queue
                .iter()
                .any(|entry| entry.active && entry.handshake.side_effecting)
    }

    /// Runs a cooperative blocking call, servicing handshakes whenever the
    /// installed `interrupter` wakes it.
    ///
    /// The loop is deliberate: the interrupter may fire without any
    /// handshake being pending (post/drain races), and new handshakes may
    /// arrive while one is being serviced, so the blocking call is simply
    /// re-entered after every drain. `before_interrupt` and
    /// `after_interrupt` bracket each drain. Action failures raised during
    /// a drain propagate out after the previously installed interrupter has
    /// been restored.
    pub fn set_blocked<T>(
        &self,
        location: Location,
        interrupter: Arc<dyn Interrupter>,
        mut interruptible: impl FnMut(&T) -> Result<(), Interrupted>,
        arg: &T,
        before_interrupt: Option<&dyn Fn()>,
        after_interrupt: Option<&dyn Fn()>,
    ) -> Result<(), AggregateError> {
        self.assert_owning_thread();
        let previous = self.inner.lock().blocked_action.clone();
        let result = loop {
            if let Err(failure) =
                self.install_blocked(location, Some(Arc::clone(&interrupter)), false)
            {
                break Err(failure);
            }
            match interruptible(arg) {
                Ok(()) => break Ok(()),
                Err(Interrupted) => {
                    if let Some(before) = before_interrupt {
                        before();
                    }
                    let drained = self.install_blocked(location, previous.clone(), true);
                    if let Some(after) = after_interrupt {
                        after();
                    }
                    if let Err(failure) = drained {
                        break Err(failure);
                    }
                }
            }
        };
        // Restore the outer blocked state; never processes, so infallible.
        let _ = self.install_blocked(location, previous, false);
        result
    }

    /// Installs `interrupter` as the blocked action, optionally draining
    /// first, and re-arms the interrupt when work is still pending so the
    /// next blocking attempt returns promptly. `None` removes the blocked
    /// state and suppresses re-arming.
    fn install_blocked(
        &self,
        location: Location,
        interrupter: Option<Arc<dyn Interrupter>>,
        process_pending: bool,
    ) -> Result<(), AggregateError> {
        let to_process = {
            let mut inner = self.inner.lock();
            let taken = if process_pending && inner.is_pending() {
                inner.eligible_handshakes()
            } else {
                Vec::new()
            };
            if self.interrupted.load(Ordering::Acquire) {
                if let Some(blocked) = &inner.blocked_action {
                    blocked.reset_interrupted();
                }
                self.interrupted.store(false, Ordering::Release);
            }
            inner.blocked_action = interrupter.clone();
            taken
        };

        self.process_handshakes(location, to_process)?;

        if let Some(current) = &interrupter {
            // A drain can only happen once per wakeup; anything queued
            // since must interrupt the upcoming blocking attempt itself.
            self.interrupt_if_pending(current);
        }
        Ok(())
    }

    fn interrupt_if_pending(&self, interrupter: &Arc<dyn Interrupter>) {
        let do_interrupt = self.inner.lock().is_pending();
        if do_interrupt {
            self.interrupted.store(true, Ordering::Release);
            interrupter.interrupt(&self.thread);
        }
    }

    fn assert_owning_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.thread.id(),
            "safepoint state used from a foreign thread"
        );
    }
}

impl fmt::Debug for SafepointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SafepointState")
            .field("id", &self.id)
            .field("fast_pending", &self.has_fast_pending())
            .field("queued", &inner.queue.len())
            .field("side_effects_enabled", &inner.side_effects_enabled)
            .field("blocked", &inner.blocked_action.is_some())
            .finish()
    }
}
