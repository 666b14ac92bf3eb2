//! Fixed-interval repetition of the acquisition-to-inference leg.

use std::future::Future;
use std::time::Duration;

use burnwatch_shared::PipelineObserver;
use serde::Serialize;
use tracing::instrument;

use crate::pipeline::{Pipeline, StageSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    pub iterations: usize,
    pub failures: usize,
}

/// Run `stages` every `interval` until `shutdown` resolves. The first run
/// starts one interval after the call.
///
/// A failed iteration is logged and reported to the observer; the loop
/// keeps going.
#[instrument(skip_all, fields(interval_secs = interval.as_secs()))]
pub async fn run_every<F>(
    pipeline: &Pipeline,
    stages: &StageSet,
    interval: Duration,
    shutdown: F,
    observer: &dyn PipelineObserver,
) -> ScheduleReport
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut report = ScheduleReport::default();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(iterations = report.iterations, "scheduler stopped");
                return report;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        report.iterations += 1;
        tracing::info!(iteration = report.iterations, "scheduled run starting");
        match pipeline.run(stages, observer).await {
            Ok(summary) => tracing::info!(
                iteration = report.iterations,
                elapsed_ms = summary.elapsed.as_millis(),
                "scheduled run finished"
            ),
            Err(e) => {
                report.failures += 1;
                tracing::error!(iteration = report.iterations, error = %e, "scheduled run failed");
                observer.warning(&format!("scheduled run {} failed: {e}", report.iterations));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;
    use crate::pipeline::tests::config_in;
    use burnwatch_shared::SilentObserver;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn failed_iterations_do_not_stop_the_loop() {
        let root = std::env::temp_dir().join(format!("burnwatch_schedule_{}", Uuid::now_v7()));
        // No catalog: every iteration fails at the download stage.
        let pipeline = Pipeline::new(config_in(&root));
        let stages = StageSet::new().with(Stage::Download);

        let report = run_every(
            &pipeline,
            &stages,
            Duration::from_secs(60),
            tokio::time::sleep(Duration::from_secs(60 * 3 + 30)),
            &SilentObserver,
        )
        .await;

        assert_eq!(report, ScheduleReport { iterations: 3, failures: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_first_interval_runs_nothing() {
        let pipeline = Pipeline::new(config_in(&std::env::temp_dir()));
        let report = run_every(
            &pipeline,
            &StageSet::scheduled(),
            Duration::from_secs(3600),
            std::future::ready(()),
            &SilentObserver,
        )
        .await;
        assert_eq!(report.iterations, 0);
    }
}
