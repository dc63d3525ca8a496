//! Memoizing cell shared by every pool entry.

use std::future::Future;

use tokio::sync::OnceCell;

/// Value computed at most once, observed by every concurrent caller.
///
/// While an initializer runs, other callers wait for it instead of starting
/// their own. If the running initializer is dropped before finishing, the
/// next waiter takes over, so an abandoned request never wedges the cell.
#[derive(Debug)]
pub struct Once<T> {
    cell: OnceCell<T>,
}

impl<T: Clone> Once<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Cell that already holds `value`.
    pub fn ready(value: T) -> Self {
        Self {
            cell: OnceCell::new_with(Some(value)),
        }
    }

    /// Returns the memoized value, running `init` if nobody has produced one yet.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.cell.get_or_init(init).await.clone()
    }

    /// Returns the value if the initializer already finished.
    pub fn get(&self) -> Option<T> {
        self.cell.get().cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }
}

impl<T: Clone> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let once = Arc::new(Once::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let once = Arc::clone(&once);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                once.get_or_init(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    42
                })
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_initializer_lets_next_caller_retry() {
        let once = Arc::new(Once::<u32>::new());

        let stalled = {
            let once = Arc::clone(&once);
            tokio::spawn(async move {
                once.get_or_init(|| std::future::pending::<u32>()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        stalled.abort();
        let _ = stalled.await;

        assert!(!once.is_ready());
        assert_eq!(once.get_or_init(|| async { 7 }).await, 7);
        assert_eq!(once.get(), Some(7));
    }

    #[test]
    fn test_ready_cell() {
        let once = Once::ready("value".to_string());
        assert!(once.is_ready());
        assert_eq!(once.get().as_deref(), Some("value"));
    }
}
