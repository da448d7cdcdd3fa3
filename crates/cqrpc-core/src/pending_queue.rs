//! Bounded outbound queue for per-call write backpressure
//!
//! While a call has a Write in flight, further outbound operations wait
//! here in FIFO order. `emplace` returning false is the only backpressure
//! signal; what to do about it is the caller's decision.
//!
//! Lock-free: a crossbeam `ArrayQueue` when bounded, `SegQueue` when not.

use crossbeam_queue::{ArrayQueue, SegQueue};

use crate::status::Status;

enum Backing<T> {
    /// `max == 0`: nothing is ever buffered
    Rejecting,
    Bounded(ArrayQueue<T>),
    Unbounded(SegQueue<T>),
}

pub struct PendingQueue<T> {
    backing: Backing<T>,
    max: Option<usize>,
}

impl<T> PendingQueue<T> {
    /// `None` means unbounded.
    pub fn new(max: Option<usize>) -> Self {
        let backing = match max {
            Some(0) => Backing::Rejecting,
            Some(n) => Backing::Bounded(ArrayQueue::new(n)),
            None => Backing::Unbounded(SegQueue::new()),
        };
        Self { backing, max }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Append `item`. False (item dropped) if the queue is already at its
    /// maximum.
    #[inline]
    pub fn emplace(&self, item: T) -> bool {
        match &self.backing {
            Backing::Rejecting => false,
            Backing::Bounded(q) => q.push(item).is_ok(),
            Backing::Unbounded(q) => {
                q.push(item);
                true
            }
        }
    }

    /// Oldest entry, if any.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        match &self.backing {
            Backing::Rejecting => None,
            Backing::Bounded(q) => q.pop(),
            Backing::Unbounded(q) => q.pop(),
        }
    }

    /// Drop everything queued. Returns how many entries were discarded.
    pub fn clear(&self) -> usize {
        let mut n = 0;
        while self.pop().is_some() {
            n += 1;
        }
        n
    }

    #[inline]
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Rejecting => 0,
            Backing::Bounded(q) => q.len(),
            Backing::Unbounded(q) => q.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn max_size(&self) -> Option<usize> {
        self.max
    }
}

/// Kind of a deferred outbound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Write,
    /// Client half-close
    WritesDone,
    /// Server final status
    Finish,
}

/// One deferred outbound operation.
#[derive(Debug)]
pub struct PendingEntry<M> {
    pub kind: PendingKind,
    pub message: Option<M>,
    pub status: Option<Status>,
}

impl<M> PendingEntry<M> {
    pub fn write(message: M) -> Self {
        Self {
            kind: PendingKind::Write,
            message: Some(message),
            status: None,
        }
    }

    pub fn writes_done() -> Self {
        Self {
            kind: PendingKind::WritesDone,
            message: None,
            status: None,
        }
    }

    pub fn finish(status: Status) -> Self {
        Self {
            kind: PendingKind::Finish,
            message: None,
            status: Some(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bound_rejects_sixth() {
        let q = PendingQueue::new(Some(5));
        for i in 0..5 {
            assert!(q.emplace(PendingEntry::write(i)));
        }
        assert!(!q.emplace(PendingEntry::write(5)));
        assert_eq!(q.len(), 5);

        let first = q.pop().unwrap();
        assert_eq!(first.kind, PendingKind::Write);
        assert_eq!(first.message, Some(0));
        assert!(q.emplace(PendingEntry::finish(Status::ok())));
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn test_fifo_and_clear() {
        let q = PendingQueue::unbounded();
        for i in 0..100 {
            assert!(q.emplace(i));
        }
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.clear(), 98);
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
        assert_eq!(q.max_size(), None);
    }

    #[test]
    fn test_zero_max_rejects_everything() {
        let q = PendingQueue::new(Some(0));
        assert!(!q.emplace(1u8));
        assert_eq!(q.len(), 0);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_concurrent_producers_respect_bound() {
        let q = Arc::new(PendingQueue::<usize>::new(Some(64)));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || (0..100).filter(|i| q.emplace(t * 1000 + i)).count())
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 64);
        assert_eq!(q.len(), 64);

        // Per-producer order survives interleaving
        let mut last = [None::<usize>; 4];
        while let Some(v) = q.pop() {
            let t = v / 1000;
            if let Some(prev) = last[t] {
                assert!(v > prev);
            }
            last[t] = Some(v);
        }
    }
}
