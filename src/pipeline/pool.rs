//! Bounded worker pool driving one round of a phase.

use futures::stream::{self, StreamExt};
use std::future::Future;
use tracing::debug;

/// Named, fixed-size pool.
///
/// A round is a barrier: [`WorkerPool::run_round`] returns only once every
/// item has finished. The futures belong to the round's stream, so dropping
/// the round (or returning early from the caller) drops everything still in
/// flight; no worker outlives its phase.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
}

impl WorkerPool {
    /// `size` is coerced to at least 1.
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `work` over `items` with at most `size` in flight, calling
    /// `on_done` in completion order as each finishes.
    ///
    /// Outputs are returned in completion order; callers that care about
    /// position must carry their own key in `O`.
    pub async fn run_round<I, O, W, Fut, D>(&self, items: Vec<I>, work: W, mut on_done: D) -> Vec<O>
    where
        W: Fn(I) -> Fut,
        Fut: Future<Output = O>,
        D: FnMut(&O, usize, usize),
    {
        let total = items.len();
        debug!("{} pool: {} item(s), {} worker(s)", self.name, total, self.size);
        let mut in_flight = stream::iter(items.into_iter().map(work)).buffer_unordered(self.size);
        let mut outputs = Vec::with_capacity(total);
        while let Some(out) = in_flight.next().await {
            on_done(&out, outputs.len() + 1, total);
            outputs.push(out);
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn size_is_coerced() {
        assert_eq!(WorkerPool::new("upload", 0).size(), 1);
        assert_eq!(WorkerPool::new("upload", 4).size(), 4);
    }

    #[tokio::test]
    async fn round_respects_bound_and_waits_for_all() {
        let pool = WorkerPool::new("test", 3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut seen = Vec::new();

        let outputs = pool
            .run_round(
                (0..10).collect(),
                |i: u64| {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5 + (i % 3) * 4)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        i
                    }
                },
                |_, done, total| seen.push((done, total)),
            )
            .await;

        assert_eq!(outputs.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(seen.last(), Some(&(10, 10)));
        let mut sorted = outputs.clone();
        sorted.sort();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }
}
