use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounds the number of concurrently handled connections.
///
/// Cloning shares the same counter.
#[derive(Debug, Clone)]
pub struct Admission {
    capacity: usize,
    active: Arc<AtomicUsize>,
}

impl Admission {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Atomically takes a slot, or returns `None` at capacity.
    ///
    /// The slot is released when the returned permit is dropped.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| AdmissionPermit {
                active: Arc::clone(&self.active),
            })
    }

    /// Connections currently holding a slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One admitted connection. Dropping it frees the slot exactly once.
#[derive(Debug)]
pub struct AdmissionPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity() {
        let admission = Admission::new(2);
        let a = admission.try_admit();
        let b = admission.try_admit();
        assert!(a.is_some() && b.is_some());
        assert_eq!(admission.active(), 2);

        assert!(admission.try_admit().is_none());
        assert_eq!(admission.active(), 2, "rejected connection is not counted");
    }

    #[test]
    fn dropping_permit_frees_slot() {
        let admission = Admission::new(1);
        let permit = admission.try_admit().unwrap();
        assert!(admission.try_admit().is_none());

        drop(permit);
        assert_eq!(admission.active(), 0);
        assert!(admission.try_admit().is_some());
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let admission = Admission::new(0);
        assert!(admission.try_admit().is_none());
    }

    #[test]
    fn clones_share_the_counter() {
        let admission = Admission::new(3);
        let other = admission.clone();
        let _p = other.try_admit().unwrap();
        assert_eq!(admission.active(), 1);
    }

    #[test]
    fn concurrent_admission_never_exceeds_capacity() {
        let admission = Admission::new(5);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let admission = admission.clone();
                std::thread::spawn(move || admission.try_admit())
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 5);
        assert_eq!(admission.active(), 5);

        drop(permits);
        assert_eq!(admission.active(), 0);
    }
}
