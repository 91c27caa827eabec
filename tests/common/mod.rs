//! Command-driven worker threads for exercising the handshake runtime.
//!
//! Each test worker registers with the engine, reports its id, then
//! executes closures sent over a channel against its own safepoint state.
//! Keeping workers command-driven makes the interleavings deterministic:
//! a worker only polls when the test tells it to.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Sender};
use shakepoint::{AggregateError, HandshakeEngine, Location, SafepointState, WorkerId};

pub const TEST_SITE: Location = Location("test-worker");
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&Arc<SafepointState>) + Send>;

enum Cmd {
    Run(Job),
    Stop,
}

pub struct TestWorker {
    pub id: WorkerId,
    commands: Sender<Cmd>,
    handle: Option<JoinHandle<()>>,
}

impl TestWorker {
    pub fn spawn(engine: &Arc<HandshakeEngine>) -> Self {
        let engine = Arc::clone(engine);
        let (commands, inbox) = unbounded::<Cmd>();
        let (id_tx, id_rx) = bounded(1);
        let handle = std::thread::spawn(move || {
            let state = engine.current();
            id_tx.send(state.id()).unwrap();
            while let Ok(command) = inbox.recv() {
                match command {
                    Cmd::Run(job) => job(&state),
                    Cmd::Stop => break,
                }
            }
        });
        let id = id_rx
            .recv_timeout(ACK_TIMEOUT)
            .expect("worker failed to start");
        Self {
            id,
            commands,
            handle: Some(handle),
        }
    }

    /// Queues a job without waiting for it.
    pub fn run(&self, job: impl FnOnce(&Arc<SafepointState>) + Send + 'static) {
        self.commands
            .send(Cmd::Run(Box::new(job)))
            .expect("worker inbox closed");
    }

    /// Runs a job and waits for it to finish.
    pub fn run_ack(&self, job: impl FnOnce(&Arc<SafepointState>) + Send + 'static) {
        let (done_tx, done_rx) = bounded(1);
        self.run(move |state| {
            job(state);
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(ACK_TIMEOUT)
            .expect("worker did not finish job in time");
    }

    /// Queues a poll without waiting (needed for synchronous rendezvous,
    /// where the poll blocks until every targeted worker arrives).
    pub fn poll(&self) {
        self.run(|state| {
            state.poll(TEST_SITE).expect("poll failed");
        });
    }

    pub fn poll_ack(&self) {
        self.run_ack(|state| {
            state.poll(TEST_SITE).expect("poll failed");
        });
    }

    pub fn poll_result(&self) -> Result<(), AggregateError> {
        let (result_tx, result_rx) = bounded(1);
        self.run(move |state| {
            let _ = result_tx.send(state.poll(TEST_SITE));
        });
        result_rx
            .recv_timeout(ACK_TIMEOUT)
            .expect("worker did not poll in time")
    }

    /// A shared handle to the worker's state, for cross-thread reads like
    /// the pending flag.
    pub fn state(&self) -> Arc<SafepointState> {
        let (state_tx, state_rx) = bounded(1);
        self.run(move |state| {
            let _ = state_tx.send(Arc::clone(state));
        });
        state_rx
            .recv_timeout(ACK_TIMEOUT)
            .expect("worker did not report its state")
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        let _ = self.commands.send(Cmd::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
