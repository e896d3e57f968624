use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

/// Shared count of live connections, decremented through RAII guards so
/// a connection task can never leak an increment.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicI64>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter, returning a guard that decrements it on
    /// drop.
    pub fn guard(&self) -> CounterGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        CounterGuard(self.0.clone())
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct CounterGuard(Arc<AtomicI64>);

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counter() {
        let counter = Counter::new();

        let guard = counter.guard();
        let guard2 = counter.guard();

        assert_eq!(counter.get(), 2);

        drop(guard2);
        assert_eq!(counter.get(), 1);

        drop(guard);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn counter_across_threads() {
        let counter = Counter::new();
        let guards = (0..8).map(|_| counter.guard()).collect::<Vec<_>>();

        let handles = guards
            .into_iter()
            .map(|g| std::thread::spawn(move || drop(g)))
            .collect::<Vec<_>>();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.get(), 0);
    }
}
