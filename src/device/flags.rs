//! The device flags bitset (§3), stored atomically so the caller thread can
//! read it without taking any lock.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// Present in the registry.
        const LISTED    = 1 << 0;
        /// Capabilities known and a protocol handler bound.
        const READY     = 1 << 1;
        /// Removed from the registry; no new I/O may start.
        const HALTED    = 1 << 2;
        /// Endpoint probing in progress; counts against the readiness barrier.
        const INIT_WAIT = 1 << 3;
        /// Between frontend `start` and the final terminal `read`.
        const SCANNING  = 1 << 4;
        /// The caller may currently call `read`.
        const READING   = 1 << 5;
    }
}

/// Atomic storage for a [`DeviceFlags`] value.
#[derive(Debug, Default)]
pub struct AtomicFlags(AtomicU32);

impl AtomicFlags {
    pub fn new(flags: DeviceFlags) -> Self {
        AtomicFlags(AtomicU32::new(flags.bits()))
    }

    pub fn load(&self) -> DeviceFlags {
        DeviceFlags::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, flag: DeviceFlags) {
        self.0.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub fn clear(&self, flag: DeviceFlags) {
        self.0.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    pub fn contains(&self, flag: DeviceFlags) -> bool {
        self.load().contains(flag)
    }
}
