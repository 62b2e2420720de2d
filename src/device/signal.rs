//! The read pipeline's non-blocking wake signal (§3, §4.6 "get select fd").
//!
//! A classic self-pipe: writing a byte makes the read end readable, so a
//! caller driving its own `select`/`poll` loop can multiplex on the
//! returned descriptor exactly like any other socket.

#[cfg(unix)]
mod unix_impl {
    use std::io;
    use std::os::fd::RawFd;

    pub struct PollableSignal {
        read_fd: RawFd,
        write_fd: RawFd,
    }

    impl PollableSignal {
        pub fn new() -> io::Result<PollableSignal> {
            let mut fds = [0; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let (read_fd, write_fd) = (fds[0], fds[1]);
            for fd in [read_fd, write_fd] {
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            Ok(PollableSignal { read_fd, write_fd })
        }

        /// Make the descriptor readable. Idempotent: signalling twice before
        /// a drain still leaves the fd readable exactly once semantically
        /// (callers drain fully, not byte-by-byte).
        pub fn signal(&self) {
            let byte = 1u8;
            unsafe {
                libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }

        /// Drain all pending wake bytes so the descriptor goes back to
        /// not-readable until the next `signal`.
        pub fn drain(&self) {
            let mut buf = [0u8; 64];
            loop {
                let n = unsafe {
                    libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n <= 0 {
                    break;
                }
            }
        }

        pub fn as_raw_fd(&self) -> RawFd {
            self.read_fd
        }
    }

    impl Drop for PollableSignal {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
        }
    }

    // Safety: the two file descriptors are not aliased by any other owner
    // and all operations on them are self-contained syscalls.
    unsafe impl Send for PollableSignal {}
    unsafe impl Sync for PollableSignal {}
}

#[cfg(unix)]
pub use unix_impl::PollableSignal;

#[cfg(not(unix))]
mod fallback_impl {
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Non-unix fallback: tracks readiness without a real descriptor.
    /// `get_select_fd` has no portable equivalent off Unix; callers on
    /// these platforms should poll `Device::queue_is_ready` instead.
    pub struct PollableSignal {
        ready: AtomicBool,
    }

    impl PollableSignal {
        pub fn new() -> std::io::Result<PollableSignal> {
            Ok(PollableSignal { ready: AtomicBool::new(false) })
        }

        pub fn signal(&self) {
            self.ready.store(true, Ordering::SeqCst);
        }

        pub fn drain(&self) {
            self.ready.store(false, Ordering::SeqCst);
        }

        pub fn as_raw_fd(&self) -> i32 {
            -1
        }

        pub fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }
}

#[cfg(not(unix))]
pub use fallback_impl::PollableSignal;

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn signal_then_drain_round_trips() {
        let signal = PollableSignal::new().unwrap();
        signal.signal();
        signal.drain();
        // A second drain with nothing pending must not block or panic.
        signal.drain();
    }
}
