// Scheduler - runs the reconciliation job on a cron schedule, apart from
// request traffic

use super::{ReconciliationJob, ReconciliationScope};
use crate::error::{Result, WalletError};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Daily at 03:00 UTC (seconds-first cron)
pub const DEFAULT_SCHEDULE: &str = "0 0 3 * * *";

pub struct ReconciliationScheduler {
    scheduler: JobScheduler,
    job: Arc<ReconciliationJob>,
    schedule: String,
    auto_fix: bool,
    job_id: Option<Uuid>,
}

impl ReconciliationScheduler {
    pub async fn new(job: Arc<ReconciliationJob>, schedule: &str, auto_fix: bool) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| WalletError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            job,
            schedule: schedule.to_string(),
            auto_fix,
            job_id: None,
        })
    }

    /// Register the sweep and start ticking
    pub async fn start(&mut self) -> Result<()> {
        info!(schedule = %self.schedule, auto_fix = self.auto_fix, "Starting reconciliation scheduler");

        let job = self.job.clone();
        let auto_fix = self.auto_fix;
        let sweep = Job::new_async(self.schedule.as_str(), move |_uuid, _lock| {
            let job = job.clone();
            Box::pin(async move {
                info!("Scheduled wallet reconciliation triggered");
                match job.run(ReconciliationScope::All, auto_fix).await {
                    Ok(report) if report.alarms.is_empty() => {
                        info!(
                            run_id = %report.run_id,
                            discrepancies = report.discrepancies.len(),
                            "Scheduled reconciliation completed"
                        );
                    }
                    Ok(report) => {
                        warn!(
                            run_id = %report.run_id,
                            alarms = ?report.alarms,
                            "Scheduled reconciliation completed with sustained mismatches"
                        );
                    }
                    Err(e) => {
                        error!("Scheduled reconciliation failed: {}", e);
                    }
                }
            })
        })
        .map_err(|e| WalletError::Scheduler(e.to_string()))?;

        let job_id = self
            .scheduler
            .add(sweep)
            .await
            .map_err(|e| WalletError::Scheduler(e.to_string()))?;
        self.job_id = Some(job_id);

        self.scheduler
            .start()
            .await
            .map_err(|e| WalletError::Scheduler(e.to_string()))?;

        info!("Reconciliation scheduler started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| WalletError::Scheduler(e.to_string()))?;
        info!("Reconciliation scheduler stopped");
        Ok(())
    }

    /// Next planned sweep, once started
    pub async fn next_run(&mut self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let Some(job_id) = self.job_id else {
            return Ok(None);
        };
        self.scheduler
            .next_tick_for_job(job_id)
            .await
            .map_err(|e| WalletError::Scheduler(e.to_string()))
    }
}
