//! Admission control for concurrent collection jobs.

use parking_lot::{Condvar, Mutex};

/// Blocking counting semaphore.
///
/// A slot is held for as long as the returned [`Permit`] lives; dropping the
/// permit gives the slot back, including while unwinding from a panic.
#[derive(Debug)]
pub struct Semaphore {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

impl Semaphore {
    /// Create a semaphore with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            available: Mutex::new(capacity),
            released: Condvar::new(),
            capacity,
        }
    }

    /// Block until a slot is free and take it.
    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
        Permit { semaphore: self }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit { semaphore: self })
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        self.released.notify_one();
    }
}

/// A held semaphore slot.
#[derive(Debug)]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let semaphore = Semaphore::new(0);
        assert_eq!(semaphore.capacity(), 1);
        let permit = semaphore.try_acquire();
        assert!(permit.is_some());
        assert!(semaphore.try_acquire().is_none());
        drop(permit);
        assert_eq!(semaphore.available(), 1);
    }

    #[test]
    fn test_permit_released_on_panic() {
        let semaphore = Semaphore::new(1);
        std::thread::scope(|s| {
            let permit = semaphore.acquire();
            let handle = s.spawn(move || {
                let _permit = permit;
                panic!("job failed");
            });
            assert!(handle.join().is_err());
        });
        assert_eq!(semaphore.available(), 1);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let semaphore = Semaphore::new(3);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..20 {
                let permit = semaphore.acquire();
                let running = &running;
                let peak = &peak;
                s.spawn(move || {
                    let _permit = permit;
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(semaphore.available(), 3);
    }
}
