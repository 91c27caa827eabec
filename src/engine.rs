//! Process-wide handshake engine: worker registry and posting entry point.
//!
//! The engine maps worker identities to their [`SafepointState`]. The map
//! holds weak references only; the owning strong reference lives in the
//! worker's thread-local slot, so a worker that exits leaves a dead entry
//! behind that the next sweep drops. Posting resolves every target up
//! front, queues one entry per worker, and wakes blocked workers.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::{ActionError, AggregateError, HandshakeError};
use crate::handshake::{Handshake, HandshakeFuture, Location};
use crate::safepoint::{SafepointState, WorkerId};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(0);
static GLOBAL_ENGINE: OnceLock<HandshakeEngine> = OnceLock::new();

thread_local! {
    /// Safepoint states of this thread, one per engine it participates in.
    static CURRENT_STATES: RefCell<Vec<(u64, Arc<SafepointState>)>> =
        const { RefCell::new(Vec::new()) };
}

/// Host integration points the engine calls outward.
///
/// `set_fast_pending` runs on the posting thread; `clear_fast_pending`
/// runs on the worker itself. Hosts use them to mirror the pending flag
/// into a location their compiled code polls. `is_supported` gates posting
/// entirely.
pub trait HandshakeHooks: Send + Sync {
    fn is_supported(&self) -> bool {
        true
    }

    fn set_fast_pending(&self, _worker: WorkerId) {}

    fn clear_fast_pending(&self, _worker: WorkerId) {}
}

/// Default hooks: supported, no fast-pending mirror.
#[derive(Debug, Default)]
pub(crate) struct NoopHooks;

impl HandshakeHooks for NoopHooks {}

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    polls: AtomicUsize,
    slow_path_hits: AtomicUsize,
    handshakes_posted: AtomicUsize,
}

impl EngineCounters {
    pub(crate) fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_slow_path(&self) {
        self.slow_path_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_post(&self) {
        self.handshakes_posted.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HandshakeStats {
        HandshakeStats {
            polls: self.polls.load(Ordering::Relaxed),
            slow_path_hits: self.slow_path_hits.load(Ordering::Relaxed),
            handshakes_posted: self.handshakes_posted.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate polling statistics for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeStats {
    /// Total polls across all workers.
    pub polls: usize,
    /// Polls that found the pending flag raised.
    pub slow_path_hits: usize,
    /// Handshakes posted through this engine.
    pub handshakes_posted: usize,
}

/// Entry point for posting and polling thread-local handshakes.
///
/// Most hosts use the process-wide [`HandshakeEngine::global`]; tests
/// create private engines freely, and a single thread may participate in
/// several engines at once.
///
/// # Examples
///
/// ```
/// use shakepoint::{HandshakeEngine, Location};
///
/// let engine = HandshakeEngine::new();
/// let me = engine.current().id();
///
/// let future = engine
///     .run_thread_local(&[me], |_| Ok(()), || (), true, false)
///     .unwrap();
///
/// engine.poll(Location("example")).unwrap();
/// assert!(future.is_done());
/// ```
pub struct HandshakeEngine {
    id: u64,
    states: DashMap<WorkerId, Weak<SafepointState>>,
    hooks: Arc<dyn HandshakeHooks>,
    counters: Arc<EngineCounters>,
    next_worker: AtomicU64,
}

impl HandshakeEngine {
    pub fn new() -> Self {
        Self::with_hooks(Arc::new(NoopHooks))
    }

    /// Creates an engine with host-supplied hooks.
    pub fn with_hooks(hooks: Arc<dyn HandshakeHooks>) -> Self {
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            states: DashMap::new(),
            hooks,
            counters: Arc::new(EngineCounters::default()),
            next_worker: AtomicU64::new(0),
        }
    }

    /// The process-wide engine.
    pub fn global() -> &'static HandshakeEngine {
        GLOBAL_ENGINE.get_or_init(HandshakeEngine::new)
    }

    /// Returns the calling worker's state, registering it on first use.
    pub fn current(&self) -> Arc<SafepointState> {
        CURRENT_STATES.with(|cell| {
            let mut states = cell.borrow_mut();
            if let Some((_, state)) = states.iter().find(|(engine, _)| *engine == self.id) {
                return Arc::clone(state);
            }
            let worker = WorkerId::new(self.next_worker.fetch_add(1, Ordering::Relaxed));
            let state = Arc::new(SafepointState::new(
                worker,
                Arc::clone(&self.hooks),
                Arc::clone(&self.counters),
            ));
            self.states.insert(worker, Arc::downgrade(&state));
            states.push((self.id, Arc::clone(&state)));
            trace!(worker = %worker, "registered worker");
            state
        })
    }

    /// Safepoint poll for the calling worker. Hot paths that already hold
    /// their [`SafepointState`] can call [`SafepointState::poll`] directly.
    pub fn poll(&self, location: Location) -> Result<(), AggregateError> {
        self.current().poll(location)
    }

    /// Surfaces [`HandshakeError::Unsupported`] without posting anything.
    pub fn test_support(&self) -> Result<(), HandshakeError> {
        if self.hooks.is_supported() {
            Ok(())
        } else {
            Err(HandshakeError::Unsupported)
        }
    }

    /// Posts `action` to every listed worker, to run at each worker's next
    /// safepoint.
    ///
    /// All workers are resolved before anything is queued, so a dead worker
    /// fails the post without partial delivery. `on_done` fires exactly
    /// once when the handshake reaches its terminal state. With `sync` the
    /// workers rendezvous before and after the action; an empty worker
    /// list yields an already-completed handshake.
    pub fn run_thread_local(
        &self,
        workers: &[WorkerId],
        action: impl Fn(Location) -> Result<(), ActionError> + Send + Sync + 'static,
        on_done: impl FnOnce() + Send + 'static,
        side_effecting: bool,
        sync: bool,
    ) -> Result<HandshakeFuture, HandshakeError> {
        self.test_support()?;
        self.sweep();

        let mut targets = Vec::with_capacity(workers.len());
        for &worker in workers {
            let state = self
                .states
                .get(&worker)
                .and_then(|weak| weak.upgrade())
                .ok_or(HandshakeError::WorkerNotAlive(worker))?;
            targets.push(state);
        }

        let handshake = Arc::new(Handshake::new(
            Box::new(action),
            Box::new(on_done),
            side_effecting,
            sync,
            workers,
        ));
        self.counters.record_post();
        debug!(
            workers = workers.len(),
            side_effecting, sync, "posting thread-local handshake"
        );

        if targets.is_empty() {
            handshake.fire_on_done();
            return Ok(HandshakeFuture::new(handshake));
        }
        for state in &targets {
            state.add_handshake(Arc::clone(&handshake));
        }
        Ok(HandshakeFuture::new(handshake))
    }

    /// Late-joins the given worker to an already-posted handshake.
    pub fn activate_thread(&self, state: &SafepointState, handshake: &HandshakeFuture) {
        state.activate(handshake);
    }

    /// Opts the given worker out of a pending handshake.
    pub fn deactivate_thread(&self, state: &SafepointState, handshake: &HandshakeFuture) {
        state.deactivate(handshake);
    }

    /// Workers whose state is still alive.
    pub fn live_workers(&self) -> Vec<WorkerId> {
        self.states
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Drops registry entries of workers that no longer exist.
    pub fn sweep(&self) {
        self.states.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn stats(&self) -> HandshakeStats {
        self.counters.snapshot()
    }
}

impl Default for HandshakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("id", &self.id)
            .field("registered_workers", &self.states.len())
            .finish()
    }
}
