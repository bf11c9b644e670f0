use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::models::{CoreError, CoreErrorKind, CoreResult};

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
/// Largest bound a scheduler accepts; tokio semaphores cannot hold more permits.
pub const MAX_CONCURRENCY: usize = Semaphore::MAX_PERMITS;

#[derive(Debug)]
pub struct ScheduleOutcome<T> {
    /// Unit outputs in completion order.
    pub outputs: Vec<T>,
    /// Units that panicked outside their own error handling.
    pub panicked: usize,
}

/// Runs independent units of work with at most `max_concurrency` in flight
/// and returns only after every unit has finished.
#[derive(Clone, Debug)]
pub struct BoundedScheduler {
    max_concurrency: usize,
    permits: Arc<Semaphore>,
}

impl BoundedScheduler {
    pub fn new(max_concurrency: usize) -> CoreResult<Self> {
        if max_concurrency == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "maximum concurrency must be at least 1",
            ));
        }
        if max_concurrency > MAX_CONCURRENCY {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("maximum concurrency must not exceed {MAX_CONCURRENCY}"),
            ));
        }

        Ok(Self {
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub async fn run_all<F, T>(&self, units: impl IntoIterator<Item = F>) -> CoreResult<ScheduleOutcome<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut join_set = JoinSet::new();
        let mut outputs = Vec::new();
        let mut panicked = 0;

        for unit in units {
            // A unit only starts once a slot is free, so the number of live
            // units never exceeds the permit count.
            let permit = self.permits.clone().acquire_owned().await.map_err(|_| {
                CoreError::new(CoreErrorKind::Internal, "scheduler permits were closed")
            })?;

            join_set.spawn(async move {
                let output = unit.await;
                drop(permit);
                output
            });

            while let Some(joined) = join_set.try_join_next() {
                collect(joined, &mut outputs, &mut panicked);
            }
        }

        while let Some(joined) = join_set.join_next().await {
            collect(joined, &mut outputs, &mut panicked);
        }

        Ok(ScheduleOutcome { outputs, panicked })
    }
}

fn collect<T>(
    joined: Result<T, tokio::task::JoinError>,
    outputs: &mut Vec<T>,
    panicked: &mut usize,
) {
    match joined {
        Ok(output) => outputs.push(output),
        Err(join_error) => {
            *panicked += 1;
            tracing::error!(error = %join_error, "scheduled unit terminated abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BoundedScheduler, MAX_CONCURRENCY};
    use crate::models::CoreErrorKind;

    fn explode() -> u32 {
        panic!("unit blew up")
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let error = BoundedScheduler::new(0).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    }

    #[test]
    fn bound_above_semaphore_capacity_is_rejected() {
        assert!(BoundedScheduler::new(MAX_CONCURRENCY).is_ok());

        let error = BoundedScheduler::new(usize::MAX).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert!(error.message.contains("must not exceed"));
    }

    #[tokio::test]
    async fn panicking_unit_does_not_stop_siblings() {
        let scheduler = BoundedScheduler::new(2).unwrap();
        let units: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = u32> + Send>>> = vec![
            Box::pin(async { 1 }),
            Box::pin(async { explode() }),
            Box::pin(async { 3 }),
        ];

        let mut outcome = scheduler.run_all(units).await.unwrap();
        outcome.outputs.sort_unstable();

        assert_eq!(outcome.outputs, vec![1, 3]);
        assert_eq!(outcome.panicked, 1);
    }
}
