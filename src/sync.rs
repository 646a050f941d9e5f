//! Counting semaphore and worker-failure flag shared by both rings.

use std::sync::{Condvar, Mutex};

use crate::error::StreamError;

/// A very small counting semaphore built from a mutex-guarded counter and a
/// condvar. `post` wakes one waiter; `wait` blocks while the count is zero.
///
/// Both rings use these in a binary fashion: `free` gates slot reuse,
/// `complete` hands a finished slot to exactly one successor, and on the read
/// side `ready` releases a worker to exit. The write ordering of the whole
/// container hangs off waiting on the predecessor slot's `complete`, so this
/// must stay a per-slot primitive and never collapse into one shared lock.
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut guard = self.count.lock().unwrap();
        *guard += 1;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut guard = self.count.lock().unwrap();
        while *guard == 0 {
            guard = self.cv.wait(guard).unwrap();
        }
        *guard -= 1;
    }

    /// Non-blocking variant of [`wait`](Self::wait); true if a unit was taken.
    pub fn try_wait(&self) -> bool {
        let mut guard = self.count.lock().unwrap();
        if *guard == 0 {
            return false;
        }
        *guard -= 1;
        true
    }
}

enum PoisonState {
    Clean,
    /// The original error, until some caller claims it.
    Failed(Option<StreamError>),
}

/// First-failure latch for a container. Workers cannot unwind a half-written
/// chunk chain, so the first error is parked here and every subsequent
/// operation on the container reports it (the original once, then
/// [`StreamError::Poisoned`]).
pub(crate) struct PoisonFlag(Mutex<PoisonState>);

impl PoisonFlag {
    pub fn new() -> Self {
        PoisonFlag(Mutex::new(PoisonState::Clean))
    }

    /// Record a worker failure; only the first error is kept.
    pub fn set(&self, err: StreamError) {
        let mut guard = self.0.lock().unwrap();
        if let PoisonState::Clean = *guard {
            *guard = PoisonState::Failed(Some(err));
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(*self.0.lock().unwrap(), PoisonState::Clean)
    }

    /// Ok while the container is healthy; otherwise the parked error, or
    /// `Poisoned` if it was already claimed.
    pub fn check(&self) -> Result<(), StreamError> {
        let mut guard = self.0.lock().unwrap();
        match &mut *guard {
            PoisonState::Clean => Ok(()),
            PoisonState::Failed(slot) => Err(slot.take().unwrap_or(StreamError::Poisoned)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn semaphore_hands_off_between_threads() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let h = thread::spawn(move || {
            sem2.wait();
            true
        });
        sem.post();
        assert!(h.join().unwrap());
    }

    #[test]
    fn try_wait_does_not_block() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        assert!(sem.try_wait());
    }

    #[test]
    fn poison_reports_original_error_once() {
        let flag = PoisonFlag::new();
        assert!(flag.check().is_ok());
        flag.set(StreamError::Codec("boom".into()));
        flag.set(StreamError::Codec("second, ignored".into()));
        match flag.check() {
            Err(StreamError::Codec(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected first error, got {:?}", other),
        }
        assert!(matches!(flag.check(), Err(StreamError::Poisoned)));
    }
}
