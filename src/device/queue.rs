//! The producer/consumer image queue (§3, §5, §9 "Queue between producer
//! and consumer"). The event-loop thread pushes encoded buffers; the
//! frontend's read path pulls them. Never holds a decoded image — decoding
//! is strictly pull-driven (§3 invariant).

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use crate::device::signal::PollableSignal;

/// One encoded page as returned by a `LOAD` reply (§6 payload).
#[derive(Clone, Debug)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// FIFO of encoded images plus the wake signal that lets a caller block on
/// `get_select_fd` until either the queue or the state machine changes.
pub struct ImageQueue {
    buffer: Mutex<VecDeque<EncodedImage>>,
    signal: PollableSignal,
}

impl ImageQueue {
    pub fn new() -> io::Result<ImageQueue> {
        Ok(ImageQueue { buffer: Mutex::new(VecDeque::new()), signal: PollableSignal::new()? })
    }

    /// Push a decoded-from-the-wire page (event-loop thread only). Ordered
    /// before the wake signal per §5's ordering guarantee.
    pub fn push(&self, image: EncodedImage) {
        self.buffer.lock().unwrap().push_back(image);
        self.signal.signal();
    }

    pub fn pop(&self) -> Option<EncodedImage> {
        self.buffer.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Drop every buffered image. Only `CANCELLED` triggers this (§3, §4.4).
    /// Returns the number of images discarded, for logging.
    pub fn purge(&self) -> usize {
        let mut buffer = self.buffer.lock().unwrap();
        let n = buffer.len();
        buffer.clear();
        n
    }

    pub fn signal(&self) -> &PollableSignal {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_preserves_order() {
        let queue = ImageQueue::new().unwrap();
        queue.push(EncodedImage { bytes: vec![1], content_type: "image/jpeg".into() });
        queue.push(EncodedImage { bytes: vec![2], content_type: "image/jpeg".into() });
        assert_eq!(queue.pop().unwrap().bytes, vec![1]);
        assert_eq!(queue.pop().unwrap().bytes, vec![2]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn purge_empties_the_queue_and_reports_count() {
        let queue = ImageQueue::new().unwrap();
        queue.push(EncodedImage { bytes: vec![1], content_type: "image/jpeg".into() });
        queue.push(EncodedImage { bytes: vec![2], content_type: "image/jpeg".into() });
        assert_eq!(queue.purge(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn is_empty_tracks_length() {
        let queue = ImageQueue::new().unwrap();
        assert!(queue.is_empty());
        queue.push(EncodedImage { bytes: vec![1], content_type: "image/jpeg".into() });
        assert!(!queue.is_empty());
        assert_eq!(queue.len(), 1);
    }
}
