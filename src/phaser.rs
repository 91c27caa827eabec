//! Two-phase barrier with dynamic party registration.
//!
//! Every handshake owns one phaser. Phase 0 closes when all parties have
//! started (the synchronous rendezvous); phase 1 closes when all parties
//! have finished and deregistered, which terminates the phaser. Parties may
//! join late through [`Phaser::register`] and leave early through
//! [`Phaser::arrive_and_deregister`]; termination happens on the advance
//! that finds no registered parties left.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// The deadline passed before the awaited phase closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out waiting for phase advance")]
pub struct AdvanceTimedOut;

/// Outcome of a late [`Phaser::register`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The party was added; `phase` is the phase it joined in.
    Registered { phase: u32 },
    /// The phaser already terminated; nothing was registered.
    Terminated,
}

#[derive(Debug)]
struct PhaserState {
    registered: usize,
    arrived: usize,
    phase: u32,
    terminated: bool,
}

/// Multi-party barrier over two phases.
///
/// # Examples
///
/// ```
/// use shakepoint::Phaser;
///
/// let phaser = Phaser::new(1);
/// phaser.arrive_and_await_advance(); // sole party: advances immediately
/// assert!(phaser.arrive_and_deregister()); // last party out terminates
/// assert!(phaser.is_terminated());
/// ```
#[derive(Debug)]
pub struct Phaser {
    state: Mutex<PhaserState>,
    cond: Condvar,
}

impl Phaser {
    /// Creates a phaser with `parties` initial parties. A phaser with zero
    /// parties starts out terminated.
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(PhaserState {
                registered: parties,
                arrived: 0,
                phase: 0,
                terminated: parties == 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Adds one party, reporting the phase it joined in.
    pub fn register(&self) -> Registration {
        let mut state = self.state.lock();
        if state.terminated {
            return Registration::Terminated;
        }
        state.registered += 1;
        Registration::Registered { phase: state.phase }
    }

    /// Arrives in the current phase and blocks until that phase closes.
    pub fn arrive_and_await_advance(&self) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        let phase = state.phase;
        state.arrived += 1;
        if state.arrived == state.registered {
            self.advance(&mut state);
        } else {
            while state.phase == phase && !state.terminated {
                self.cond.wait(&mut state);
            }
        }
    }

    /// Arrives in the current phase and leaves the party set without
    /// waiting. Returns `true` iff this call terminated the phaser.
    pub fn arrive_and_deregister(&self) -> bool {
        let mut state = self.state.lock();
        if state.terminated || state.registered == 0 {
            return false;
        }
        state.registered -= 1;
        if state.arrived == state.registered {
            self.advance(&mut state);
            return state.terminated;
        }
        false
    }

    /// Blocks until the given phase has closed (or the phaser terminated).
    pub fn await_advance(&self, phase: u32) {
        let mut state = self.state.lock();
        while state.phase <= phase && !state.terminated {
            self.cond.wait(&mut state);
        }
    }

    /// Timed variant of [`Phaser::await_advance`].
    pub fn await_advance_timeout(&self, phase: u32, timeout: Duration) -> Result<(), AdvanceTimedOut> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.phase <= phase && !state.terminated {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.phase <= phase && !state.terminated {
                    return Err(AdvanceTimedOut);
                }
                break;
            }
        }
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn phase(&self) -> u32 {
        self.state.lock().phase
    }

    pub fn registered_parties(&self) -> usize {
        self.state.lock().registered
    }

    pub fn unarrived_parties(&self) -> usize {
        let state = self.state.lock();
        state.registered - state.arrived
    }

    // The phase closes: reset arrivals, terminate if nobody is left.
    fn advance(&self, state: &mut PhaserState) {
        state.phase += 1;
        state.arrived = 0;
        if state.registered == 0 {
            state.terminated = true;
        }
        self.cond.notify_all();
    }
}
