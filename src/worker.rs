use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::grading::{GradingResult, GradingStatus};
use crate::scheduler::{Pool, Scheduler};

/// Worker loop of one pool slot
///
/// Takes a slot, then the oldest ticket of the pool whose submission and
/// configuration are not already being graded, and runs it to completion.
/// The grading itself runs in its own task so that a panic still ends in a
/// persisted result and a released sandbox.
pub async fn worker(
    id: String,
    pool: Arc<Pool>,
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized for pool {}", pool.name());

    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = pool.slots().clone().acquire_owned() => permit?,
        };

        // Tickets whose key is running stay queued in place
        let job = tokio::select! {
            _ = token.cancelled() => break,
            job = pool.queue().pop_where(|job| scheduler.claim_key(job.key())) => job,
        };
        log::info!("Worker {id} got ticket {} from queue", job.ticket);

        let Some(cancel) = scheduler.try_start(job.ticket) else {
            log::info!(
                "Ticket {} was cancelled or expired before it started",
                job.ticket
            );
            scheduler.release_key(&pool, job.key());
            continue;
        };

        let run = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(job, permit, cancel).await }
        });
        let result = match run.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Grading of ticket {} failed on worker {id}: {e}", job.ticket);
                GradingResult::without_steps(
                    job.submission_id,
                    job.grading_config_id,
                    job.attempt,
                    job.max_points,
                    GradingStatus::InfrastructureError,
                    Some(format!("grading task failed: {e}")),
                )
            }
        };
        log::info!(
            "Ticket {} finished on worker {id} with status {}",
            job.ticket,
            result.status
        );

        scheduler.complete(&pool, job, result).await;
        scheduler.release_key(&pool, job.key());
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}
