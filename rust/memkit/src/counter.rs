use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe byte counter.
///
/// Used both as a running total (`add`/`sub`) and as a budget from which
/// callers withdraw and to which they deposit, never going below zero.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new(amount: u64) -> Counter {
        Counter(AtomicU64::new(amount))
    }

    /// Withdraws `amount` if the counter holds at least that much.
    ///
    /// Returns `false` and leaves the counter unchanged otherwise.
    pub fn withdraw(&self, amount: u64) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        while current >= amount {
            match self.0.compare_exchange_weak(
                current,
                current - amount,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(updated) => current = updated,
            }
        }
        false
    }

    pub fn deposit(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Release);
    }

    #[inline]
    pub fn add(&self, amount: usize) {
        self.0.fetch_add(amount as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, amount: usize) {
        let prev = self.0.fetch_sub(amount as u64, Ordering::Relaxed);
        debug_assert!(prev >= amount as u64, "counter underflow");
    }

    /// Current value (possibly stale by the time the caller observes it).
    #[inline]
    pub fn read(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_withdraw_deposit() {
        let c = Counter::new(100);
        assert!(c.withdraw(60));
        assert!(!c.withdraw(41));
        assert_eq!(c.read(), 40);
        c.deposit(10);
        assert!(c.withdraw(50));
        assert_eq!(c.read(), 0);
    }

    #[test]
    fn test_add_sub() {
        let c = Counter::default();
        c.add(4096);
        c.add(64);
        c.sub(4096);
        assert_eq!(c.read(), 64);
    }

    #[test]
    fn test_concurrent_withdraw_never_overdraws() {
        let c = Arc::new(Counter::new(1000));
        let threads = (0..8)
            .map(|_| {
                let c = c.clone();
                std::thread::spawn(move || (0..200).filter(|_| c.withdraw(1)).count())
            })
            .collect::<Vec<_>>();
        let total: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(total, 1000);
        assert_eq!(c.read(), 0);
    }
}
