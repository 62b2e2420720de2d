//! The event loop (§4.11): a dedicated thread owning a current-thread
//! Tokio runtime. Exposes `call` (marshal work onto the loop thread,
//! "eloop_call" in the spec's vocabulary) and `schedule_timer` (one-shot,
//! cancellable retry timers, §4.3 rule 6).
//!
//! Grounded in the teacher's `backend::run_capture` pattern of spawning a
//! worker thread that `block_on`s an async future while control messages
//! arrive over a channel (`greatscottgadgets-packetry/src/backend/mod.rs`).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::warn;
use tokio::sync::mpsc::{self, UnboundedSender};

type Task = BoxFuture<'static, ()>;

/// A dedicated async executor thread. All state-machine transitions (§5)
/// happen on tasks run through this loop.
pub struct EventLoop {
    tx: UnboundedSender<Task>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EventLoop {
    pub fn start() -> EventLoop {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("failed to start event loop runtime");
            runtime.block_on(async move {
                while let Some(task) = rx.recv().await {
                    tokio::spawn(task);
                }
            });
        });
        EventLoop { tx, thread: Some(thread) }
    }

    /// Marshal a unit of work onto the event-loop thread ("eloop_call",
    /// §4.11, §5). Silently dropped if the loop has already shut down.
    pub fn call<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(fut)).is_err() {
            warn!("event loop call dropped: loop has shut down");
        }
    }

    /// Schedule a one-shot timer (§4.3 rule 6). Returns a handle that can
    /// cancel the timer before it fires; cancelling after it has already
    /// fired is a no-op.
    pub fn schedule_timer<F>(&self, delay: Duration, fut: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        self.call(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                fut.await;
            }
        });
        TimerHandle { cancelled }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            // Dropping `tx` (implicit once all senders referencing this
            // EventLoop are gone) lets the loop's recv return None and the
            // thread exit on its own; join defensively so shutdown is
            // deterministic from the caller's point of view.
            if let Err(e) = crate::util::handle_thread_panic(thread.join()) {
                warn!("event loop thread: {e}");
            }
        }
    }
}

/// Handle to a pending one-shot timer.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn call_runs_on_the_loop_thread() {
        let eloop = EventLoop::start();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        eloop.call(async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // Give the loop thread a moment to process the marshalled task.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let eloop = EventLoop::start();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = eloop.schedule_timer(Duration::from_millis(20), async move {
            f.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        std::thread::sleep(Duration::from_millis(60));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn uncancelled_timer_fires() {
        let eloop = EventLoop::start();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let _handle = eloop.schedule_timer(Duration::from_millis(10), async move {
            f.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(60));
        assert!(fired.load(Ordering::SeqCst));
    }
}
