//! Scan state machine storage (§4.3, §5, §9 "State encoded as an enum with
//! atomic read/write, transitions only in one thread"). This module owns
//! the state cell itself and the condition variable callers wait on; the
//! orchestration that decides *when* to transition lives in
//! [`crate::device`] because it needs the job tracker, queue and protocol
//! binding alongside the state.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// One node of §4.3's state diagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ScanState {
    Closed = 0,
    Idle = 1,
    Scanning = 2,
    CancelReq = 3,
    CancelWait = 4,
    Cancelling = 5,
    Cleanup = 6,
    Done = 7,
}

impl ScanState {
    /// Any state strictly between `Idle` and `Done` (GLOSSARY "working
    /// state"); `close`/readiness waits key off this.
    pub fn is_working(self) -> bool {
        matches!(
            self,
            ScanState::Scanning
                | ScanState::CancelReq
                | ScanState::CancelWait
                | ScanState::Cancelling
                | ScanState::Cleanup
        )
    }
}

/// Atomic state cell plus the condvar waiters re-check after a wake. The
/// mutex guards nothing but the condvar's wait contract; the authoritative
/// value is the atomic (§5 "`stm_state` is read and written with
/// sequential-consistency atomics").
pub struct StateCell {
    state: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StateCell {
    pub fn new(initial: ScanState) -> StateCell {
        StateCell { state: AtomicU8::new(initial.into()), lock: Mutex::new(()), cond: Condvar::new() }
    }

    pub fn get(&self) -> ScanState {
        ScanState::try_from_primitive(self.state.load(Ordering::SeqCst))
            .expect("state cell holds a value outside ScanState's range")
    }

    /// Event-loop-thread-only: set a new state and wake every waiter. The
    /// store happens-before the broadcast (§5 ordering guarantee; `SeqCst`
    /// plus taking the condvar's mutex around the broadcast is enough to
    /// make the new value visible to anyone woken by it).
    pub fn set(&self, state: ScanState) {
        let _guard = self.lock.lock().unwrap();
        self.state.store(state.into(), Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Wake every waiter without changing the state (§4.3 rule 2: an image
    /// landing in the queue is a broadcast-worthy event even when the state
    /// itself stays `Scanning`).
    pub fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    /// Compare-and-set used for the one legitimate concurrent transition in
    /// the whole machine: frontend `cancel` racing the event loop out of
    /// `Scanning` (§4.3).
    pub fn compare_and_set(&self, from: ScanState, to: ScanState) -> bool {
        let _guard = self.lock.lock().unwrap();
        let cur = self.state.load(Ordering::SeqCst);
        if cur == u8::from(from) {
            self.state.store(to.into(), Ordering::SeqCst);
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Block the calling thread until `predicate` holds or `timeout`
    /// elapses. Used by `start`/`read` (bounded only by the absence of a
    /// deadline in practice) and `open` (bounded by the 5 s readiness
    /// timeout, §4.1).
    pub fn wait_while<F: FnMut(ScanState) -> bool>(&self, timeout: Option<Duration>, mut predicate: F) {
        let guard = self.lock.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = guard;
        loop {
            if !predicate(self.get()) {
                return;
            }
            guard = match deadline {
                None => self.cond.wait(guard).unwrap(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return;
                    }
                    let (guard, result) = self.cond.wait_timeout(guard, remaining).unwrap();
                    if result.timed_out() && predicate(self.get()) {
                        return;
                    }
                    guard
                }
            };
        }
    }
}
