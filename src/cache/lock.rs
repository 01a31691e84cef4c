use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

/// Lock a cache-internal mutex, recovering the guard if a holder panicked.
///
/// Cached state is disposable: a poisoned guard is logged and used as-is.
pub(crate) fn lock_recovering<'a, T>(
    lock: &'a Mutex<T>,
    component: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned: PoisonError<MutexGuard<'a, T>>| {
        warn!(
            op,
            component,
            result = "poisoned_recovered",
            hint = "state may be stale after panic in another thread",
            "Recovered from poisoned cache lock"
        );
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn recovers_after_panic_while_locked() {
        let lock = Mutex::new(vec![1]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison the lock");
        }));

        assert!(lock.is_poisoned());
        lock_recovering(&lock, "test", "push").push(2);
        assert_eq!(*lock_recovering(&lock, "test", "read"), vec![1, 2]);
    }
}
