//! Fan-Out Executor: bounded concurrent branches, joined in submission order

use crate::error::{Error, Result};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default worker ceiling, matching the canonical group count plus one
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Runs independent branches concurrently under a worker ceiling
#[derive(Debug, Clone)]
pub struct FanOutExecutor {
    max_parallel: usize,
}

impl Default for FanOutExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARALLEL)
    }
}

impl FanOutExecutor {
    /// Create an executor; zero is raised to one
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    /// Worker ceiling
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Run every task and wait for all of them.
    ///
    /// The returned vector has one entry per task, at the task's submission
    /// index. A failing or panicking branch yields an `Err` in its own slot
    /// and never disturbs its siblings.
    pub async fn run_all<T, F, Fut>(&self, tasks: Vec<F>) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = tasks.len();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel.min(total.max(1))));
        let mut join_set = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Err(Error::other("fan-out semaphore closed"))),
                };
                let outcome = AssertUnwindSafe(async move { task().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(Error::BranchPanicked {
                            index,
                            message: panic_message(panic.as_ref()),
                        })
                    });
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Err(e) = &outcome {
                        tracing::warn!(branch = index, error = %e, "fan-out branch failed");
                    }
                    slots[index] = Some(outcome);
                }
                Err(e) => tracing::error!(error = %e, "fan-out branch was cancelled"),
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| Err(Error::other(format!("branch {} did not complete", index))))
            })
            .collect()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Branch = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<usize>> + Send>;

    fn delayed(value: usize, delay_ms: u64) -> Branch {
        Box::new(move || {
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(value)
            }
            .boxed()
        })
    }

    fn exploding(message: &'static str) -> Branch {
        Box::new(move || {
            async move {
                if !message.is_empty() {
                    panic!("{}", message);
                }
                Ok(0)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_results_follow_submission_order() {
        let delays = [40u64, 5, 25, 0, 15];
        let tasks: Vec<Branch> = delays
            .iter()
            .enumerate()
            .map(|(i, delay)| delayed(i * 10, *delay))
            .collect();

        let results = FanOutExecutor::new(3).run_all(tasks).await;
        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn test_one_failure_keeps_siblings() {
        for failing in 0..4 {
            let tasks: Vec<Branch> = (0..4)
                .map(|i| -> Branch {
                    if i == failing {
                        Box::new(|| async { Err::<usize, _>(Error::completion("quota exceeded")) }.boxed())
                    } else {
                        delayed(i, (4 - i as u64) * 5)
                    }
                })
                .collect();

            let results = FanOutExecutor::default().run_all(tasks).await;
            assert_eq!(results.len(), 4);
            assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
            assert!(matches!(results[failing], Err(Error::Completion(_))));
            for (i, result) in results.iter().enumerate().filter(|(i, _)| *i != failing) {
                assert_eq!(*result.as_ref().unwrap(), i);
            }
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let tasks: Vec<Branch> = vec![
            delayed(1, 0),
            exploding("branch exploded"),
            delayed(3, 0),
        ];
        let results = FanOutExecutor::new(2).run_all(tasks).await;
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(matches!(
            &results[1],
            Err(Error::BranchPanicked { index: 1, message }) if message == "branch exploded"
        ));
        assert_eq!(*results[2].as_ref().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_worker_ceiling_is_respected() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();

        let results = FanOutExecutor::new(2).run_all(tasks).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let results = FanOutExecutor::default().run_all(Vec::<Branch>::new()).await;
        assert!(results.is_empty());
    }
}
