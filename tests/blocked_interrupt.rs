//! Blocking-call interception: a worker parked in a cooperative blocking
//! call services handshakes and then re-enters the call.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::Duration;

use common::TestWorker;
use crossbeam::channel::bounded;
use shakepoint::{HandshakeEngine, InterruptSignal, Interrupter, Location};

const GET_TIMEOUT: Duration = Duration::from_secs(5);

struct CountingInterrupter {
    inner: Arc<InterruptSignal>,
    interrupts: AtomicUsize,
    resets: AtomicUsize,
}

impl CountingInterrupter {
    fn new(inner: Arc<InterruptSignal>) -> Self {
        Self {
            inner,
            interrupts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }
}

impl Interrupter for CountingInterrupter {
    fn interrupt(&self, thread: &Thread) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.inner.interrupt(thread);
    }

    fn reset_interrupted(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.inner.reset_interrupted();
    }
}

/// Acquire `lock` through the signal, handshake-interruptibly.
fn interruptible_acquire(
    signal: &InterruptSignal,
    lock: &AtomicBool,
) -> Result<(), shakepoint::Interrupted> {
    signal.block_until(|| {
        lock.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    })
}

#[test]
fn blocked_worker_services_handshake_then_reacquires() {
    let engine = Arc::new(HandshakeEngine::new());
    let worker = TestWorker::spawn(&engine);

    let locked = Arc::new(AtomicBool::new(true)); // held by the test
    let signal = Arc::new(InterruptSignal::new());
    let interrupter = Arc::new(CountingInterrupter::new(Arc::clone(&signal)));
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (acquired_tx, acquired_rx) = bounded(1);

    {
        let signal = Arc::clone(&signal);
        let locked = Arc::clone(&locked);
        let interrupter = Arc::clone(&interrupter);
        let events = Arc::clone(&events);
        worker.run(move |state| {
            let events_before = Arc::clone(&events);
            let events_after = Arc::clone(&events);
            let before = move || events_before.lock().unwrap().push("before");
            let after = move || events_after.lock().unwrap().push("after");
            state
                .set_blocked(
                    Location("interruptible-lock"),
                    interrupter,
                    |lock: &Arc<AtomicBool>| interruptible_acquire(&signal, lock),
                    &locked,
                    Some(&before),
                    Some(&after),
                )
                .expect("drain failed");
            events.lock().unwrap().push("acquired");
            let _ = acquired_tx.send(());
        });
    }

    // Let the worker park in the blocking call, then post.
    thread::sleep(Duration::from_millis(50));
    let events_in_action = Arc::clone(&events);
    let future = engine
        .run_thread_local(
            &[worker.id],
            move |_| {
                events_in_action.lock().unwrap().push("action");
                Ok(())
            },
            || (),
            true,
            false,
        )
        .unwrap();

    // The action runs in bounded time even though the worker never
    // acquires the lock the test is still holding.
    future.get_timeout(GET_TIMEOUT).unwrap();
    {
        let log = events.lock().unwrap();
        assert!(
            log.starts_with(&["before", "action"]),
            "the action must run while the worker is still blocked: {:?}",
            *log
        );
    }
    assert!(interrupter.interrupts.load(Ordering::SeqCst) >= 1);
    assert!(
        interrupter.resets.load(Ordering::SeqCst) >= 1,
        "the interrupt must be acknowledged before the retry"
    );

    // Hand over the lock; the worker's retry succeeds.
    locked.store(false, Ordering::Release);
    signal.notify_all();
    acquired_rx
        .recv_timeout(GET_TIMEOUT)
        .expect("worker never reacquired the lock");

    assert_eq!(
        *events.lock().unwrap(),
        vec!["before", "action", "after", "acquired"]
    );
    assert!(locked.load(Ordering::Acquire), "worker holds the lock now");
}

#[test]
fn handshake_posted_before_blocking_interrupts_immediately() {
    let engine = Arc::new(HandshakeEngine::new());
    let worker = TestWorker::spawn(&engine);

    let counter = Arc::new(AtomicUsize::new(0));
    let counter_in_action = Arc::clone(&counter);
    let future = engine
        .run_thread_local(
            &[worker.id],
            move |_| {
                counter_in_action.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            || (),
            true,
            false,
        )
        .unwrap();

    let locked = Arc::new(AtomicBool::new(true));
    let signal = Arc::new(InterruptSignal::new());
    let (acquired_tx, acquired_rx) = bounded(1);

    {
        let signal = Arc::clone(&signal);
        let locked = Arc::clone(&locked);
        worker.run(move |state| {
            state
                .set_blocked(
                    Location("interruptible-lock"),
                    Arc::clone(&signal) as Arc<dyn Interrupter>,
                    |lock: &Arc<AtomicBool>| interruptible_acquire(&signal, lock),
                    &locked,
                    None,
                    None,
                )
                .expect("drain failed");
            let _ = acquired_tx.send(());
        });
    }

    // The pending handshake interrupts the very first blocking attempt.
    future.get_timeout(GET_TIMEOUT).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    locked.store(false, Ordering::Release);
    signal.notify_all();
    acquired_rx
        .recv_timeout(GET_TIMEOUT)
        .expect("worker never acquired the lock");
}

#[test]
fn spurious_wakeup_reenters_the_blocking_call() {
    let engine = Arc::new(HandshakeEngine::new());
    let worker = TestWorker::spawn(&engine);

    let locked = Arc::new(AtomicBool::new(true));
    let signal = Arc::new(InterruptSignal::new());
    let (acquired_tx, acquired_rx) = bounded(1);

    {
        let signal = Arc::clone(&signal);
        let locked = Arc::clone(&locked);
        worker.run(move |state| {
            state
                .set_blocked(
                    Location("interruptible-lock"),
                    Arc::clone(&signal) as Arc<dyn Interrupter>,
                    |lock: &Arc<AtomicBool>| interruptible_acquire(&signal, lock),
                    &locked,
                    None,
                    None,
                )
                .expect("drain failed");
            let _ = acquired_tx.send(());
        });
    }

    // Wake the blocking call with no handshake pending; the worker must
    // drain nothing and simply block again.
    thread::sleep(Duration::from_millis(50));
    signal.interrupt(&thread::current());
    thread::sleep(Duration::from_millis(50));
    assert!(
        acquired_rx.try_recv().is_err(),
        "worker must re-enter the blocking call after a spurious wakeup"
    );

    locked.store(false, Ordering::Release);
    signal.notify_all();
    acquired_rx
        .recv_timeout(GET_TIMEOUT)
        .expect("worker never acquired the lock");
    assert!(locked.load(Ordering::Acquire));
}
