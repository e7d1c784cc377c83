use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

/// Single-flight lane for requests. Waiters are admitted in arrival order.
#[derive(Debug, Default)]
pub struct RequestQueue {
    lane: Mutex<()>,
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
}

struct Count<'a>(&'a AtomicUsize);

impl<'a> Count<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Count<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let waiting = Count::enter(&self.waiting);
        let _lane = self.lane.lock().await;
        drop(waiting);
        let _running = Count::enter(&self.in_flight);
        task.await
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn one_at_a_time_in_arrival_order() {
        let queue = Arc::new(RequestQueue::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let (queue, order, peak) = (queue.clone(), order.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                queue
                    .run(async {
                        peak.fetch_max(queue.in_flight(), Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        order.lock().unwrap().push(i);
                    })
                    .await
            }));
            // Let each task reach the lane before the next one starts.
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.waiting(), 3);

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.waiting(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_not_counted() {
        let queue = Arc::new(RequestQueue::new());
        let q = queue.clone();
        let holder = tokio::spawn(async move {
            q.run(tokio::time::sleep(Duration::from_millis(200))).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waited = tokio::time::timeout(Duration::from_millis(20), queue.run(async { 1 })).await;
        assert!(waited.is_err());
        assert_eq!(queue.waiting(), 0);
        holder.await.unwrap();
        assert_eq!(queue.run(async { 7 }).await, 7);
    }
}
