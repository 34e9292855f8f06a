//! Per-backend admission control. Each backend instance gets one scheduler
//! that bounds concurrent in-flight translations, queues the overflow FIFO,
//! and sheds load once the queue is full or the wait too long.
//!
//! Entries move Idle -> Admitted -> Running -> Completed/Failed; an entry
//! that cannot be admitted in time fails with `Overloaded` instead of
//! waiting forever.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::error::TranslateError;

pub struct Scheduler {
    backend: String,
    slots: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    queue_capacity: usize,
    max_queue_wait: Duration,
}

/// Decrements the queued count even when the waiting future is dropped
/// through client cancellation.
struct QueueGuard(Arc<AtomicUsize>);

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(backend: &str, config: &SchedulerConfig) -> Self {
        Self {
            backend: backend.to_string(),
            slots: Arc::new(Semaphore::new(config.max_concurrency)),
            queued: Arc::new(AtomicUsize::new(0)),
            queue_capacity: config.queue_capacity,
            max_queue_wait: Duration::from_millis(config.max_queue_wait_ms),
        }
    }

    /// Admit and run one translation under a concurrency slot.
    ///
    /// The work runs in its own task that owns the slot, so a caller that
    /// stops waiting (client disconnect, deadline) never aborts an engine
    /// call already in flight; the slot is released only when the
    /// underlying call actually returns and the orphaned result is dropped.
    pub async fn run<F, T>(&self, deadline: Option<Duration>, work: F) -> Result<T, TranslateError>
    where
        F: Future<Output = Result<T, TranslateError>> + Send + 'static,
        T: Send + 'static,
    {
        let admitted_at = tokio::time::Instant::now();
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Saturated: join the FIFO queue if there is room.
                if self.queued.fetch_add(1, Ordering::SeqCst) >= self.queue_capacity {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    debug!("queue full on '{}', shedding request", self.backend);
                    return Err(TranslateError::Overloaded(self.backend.clone()));
                }
                let _guard = QueueGuard(Arc::clone(&self.queued));

                let mut wait = self.max_queue_wait;
                if let Some(deadline) = deadline {
                    wait = wait.min(deadline);
                }
                match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(TranslateError::BackendUnavailable {
                            backend: self.backend.clone(),
                            cause: "scheduler shut down".to_string(),
                        })
                    }
                    Err(_) => {
                        debug!("queue wait exceeded on '{}'", self.backend);
                        return Err(TranslateError::Overloaded(self.backend.clone()));
                    }
                }
            }
        };

        let handle = tokio::spawn(async move {
            let _permit = permit;
            work.await
        });

        let joined = match deadline {
            // Time spent queueing counts against the overall deadline.
            Some(deadline) => {
                let remaining = deadline.saturating_sub(admitted_at.elapsed());
                match tokio::time::timeout(remaining, handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        // The spawned task keeps running and releases the slot
                        // when the real call returns; its result is discarded.
                        return Err(TranslateError::Timeout(self.backend.clone()));
                    }
                }
            }
            None => handle.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) => Err(TranslateError::BackendUnavailable {
                backend: self.backend.clone(),
                cause: format!("translation task failed: {e}"),
            }),
        }
    }

    #[cfg(test)]
    fn queued_now(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    fn scheduler(max_concurrency: usize, queue_capacity: usize, wait_ms: u64) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            "test",
            &SchedulerConfig {
                max_concurrency,
                queue_capacity,
                max_queue_wait_ms: wait_ms,
            },
        ))
    }

    /// Tracks the peak number of concurrently running jobs.
    #[derive(Default)]
    struct ConcurrencyProbe {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ConcurrencyProbe {
        fn enter(&self) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn running_jobs_never_exceed_max_concurrency() {
        let scheduler = scheduler(3, 64, 10_000);
        let probe = Arc::new(ConcurrencyProbe::default());

        let mut tasks = Vec::new();
        let mut rng = rand::thread_rng();
        for i in 0..40 {
            let scheduler = Arc::clone(&scheduler);
            let probe = Arc::clone(&probe);
            let arrival = Duration::from_millis(rng.gen_range(0..20));
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(arrival).await;
                scheduler
                    .run(None, async move {
                        probe.enter();
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        probe.exit();
                        Ok::<_, TranslateError>(i)
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(
            probe.peak.load(Ordering::SeqCst) <= 3,
            "peak concurrency {} exceeded limit",
            probe.peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn queued_requests_dispatch_in_fifo_order() {
        let scheduler = scheduler(1, 16, 10_000);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single slot so every subsequent request queues.
        let blocker = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .run(None, async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, TranslateError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut tasks = Vec::new();
        for i in 0..5 {
            let scheduler = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                scheduler
                    .run(None, async move {
                        order.lock().await.push(i);
                        Ok::<_, TranslateError>(())
                    })
                    .await
            }));
            // Distinct enqueue times make the expected order unambiguous.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        blocker.await.unwrap().unwrap();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn saturated_queue_sheds_immediately() {
        // queue capacity 2, one slot: 4 simultaneous requests -> 1 running,
        // 2 queued, 1 rejected outright.
        let scheduler = scheduler(1, 2, 10_000);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let scheduler = Arc::clone(&scheduler);
            tasks.push(tokio::spawn(async move {
                scheduler
                    .run(None, async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, TranslateError>(())
                    })
                    .await
            }));
            // Deterministic arrival order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.queued_now(), 2);

        let mut overloaded = 0;
        let mut completed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => completed += 1,
                Err(TranslateError::Overloaded(_)) => overloaded += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(completed, 3);
        assert_eq!(overloaded, 1);
    }

    #[tokio::test]
    async fn queue_wait_bound_produces_overloaded() {
        let scheduler = scheduler(1, 8, 50);

        let blocker = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .run(None, async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok::<_, TranslateError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = scheduler.run(None, async { Ok::<_, TranslateError>(()) }).await;
        assert!(matches!(err, Err(TranslateError::Overloaded(_))));
        assert_eq!(scheduler.queued_now(), 0, "queue count must be released");

        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn deadline_abandons_wait_but_work_completes() {
        let scheduler = scheduler(1, 8, 10_000);
        let finished = Arc::new(AtomicUsize::new(0));

        let marker = Arc::clone(&finished);
        let result = scheduler
            .run(Some(Duration::from_millis(30)), async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                marker.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TranslateError>(())
            })
            .await;
        assert!(matches!(result, Err(TranslateError::Timeout(_))));

        // The slot is released only when the real call returns.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1, "work must run to completion");
        let reused = scheduler.run(None, async { Ok::<_, TranslateError>(1) }).await;
        assert_eq!(reused.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_queued_entry_leaves_no_residue() {
        let scheduler = scheduler(1, 8, 10_000);

        let blocker = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .run(None, async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, TranslateError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler.run(None, async { Ok::<_, TranslateError>(()) }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.queued_now(), 1);

        // Client disconnect while queued: entry removed, never dispatched.
        queued.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.queued_now(), 0);

        blocker.await.unwrap().unwrap();
    }
}
