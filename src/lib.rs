//! Cooperative thread-local handshakes for multi-threaded runtimes.
//!
//! A coordinator posts a small action to a set of worker threads; each
//! worker runs it at its next *safepoint*, a self-chosen point where it is
//! willing to interrupt itself. This is the coordination primitive behind
//! stack inspection, deoptimization, GC phase changes, and cooperative
//! cancellation of blocking calls in managed runtimes.
//!
//! ## Architecture
//!
//! - **Fast path**: [`SafepointState::poll`] reads one per-worker atomic
//!   flag and branches, cheap enough for interpreter hot loops.
//! - **Slow path**: a mutex-guarded per-worker queue is drained in FIFO
//!   order; actions run on the worker, outside the lock.
//! - **Rendezvous**: each handshake owns a two-phase [`Phaser`] so
//!   synchronous handshakes hold every worker until all actions finished,
//!   while parties may still join late or opt out early.
//! - **Blocked workers**: an [`Interrupter`] capability wakes a worker
//!   parked in a cooperative blocking call so it can service its queue and
//!   re-enter the call ([`SafepointState::set_blocked`]).
//!
//! ```
//! use shakepoint::{HandshakeEngine, Location};
//!
//! let engine = HandshakeEngine::new();
//! let me = engine.current().id();
//!
//! // Post to ourselves and service it at the next poll.
//! let future = engine
//!     .run_thread_local(&[me], |_| Ok(()), || (), true, false)
//!     .unwrap();
//! engine.poll(Location("doc-example")).unwrap();
//! assert!(future.is_done());
//! ```

pub mod engine;
pub mod error;
pub mod handshake;
pub mod interrupt;
pub mod phaser;
pub mod safepoint;

pub use engine::{HandshakeEngine, HandshakeHooks, HandshakeStats};
pub use error::{ActionError, ActionFailure, AggregateError, HandshakeError, Interrupted};
pub use handshake::{DoneCallback, HandshakeAction, HandshakeFuture, Location};
pub use interrupt::{InterruptSignal, Interrupter};
pub use phaser::{AdvanceTimedOut, Phaser, Registration};
pub use safepoint::{SafepointState, WorkerId};
