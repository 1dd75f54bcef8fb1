//! Process-wide engine context: one explicit handle over the pool, the user
//! directory, the mail transport and dispatch options, constructed once at
//! startup and passed around by reference.
use crate::db::Pool;
use crate::directory::UserDirectory;
use crate::dispatch::{self, DispatchOptions};
use crate::model::CampaignRun;
use crate::scheduler;
use crate::transport::MailTransport;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct Engine {
    pool: Pool,
    directory: Arc<dyn UserDirectory>,
    transport: Arc<dyn MailTransport>,
    opts: DispatchOptions,
    cancel: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(
        pool: Pool,
        directory: Arc<dyn UserDirectory>,
        transport: Arc<dyn MailTransport>,
        opts: DispatchOptions,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            directory,
            transport,
            opts,
            cancel,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// One sweep-and-dispatch pass: claim every due letter, then run each
    /// claimed campaign to finalization. Returns the completed runs.
    pub async fn sweep_and_dispatch(&self) -> Result<Vec<CampaignRun>> {
        let claimed = scheduler::sweep_once(&self.pool, Utc::now()).await?;
        let mut runs = Vec::with_capacity(claimed.len());
        for id in claimed {
            match dispatch::run_letter(
                &self.pool,
                self.directory.as_ref(),
                self.transport.as_ref(),
                id,
                &self.opts,
                &self.cancel,
            )
            .await
            {
                Ok(run) => runs.push(run),
                // Run-fatal errors are already finalized; keep sweeping.
                Err(err) => error!(letter_id = id, ?err, "campaign run failed"),
            }
        }
        Ok(runs)
    }

    /// Recurring sweep loop; exits after the stop signal, once the current
    /// pass has committed its results.
    pub async fn run(&self, interval: Duration) {
        info!(interval_ms = interval.as_millis() as u64, "scheduler sweep loop started");
        let mut cancel = self.cancel.clone();
        loop {
            match self.sweep_and_dispatch().await {
                Ok(runs) if !runs.is_empty() => {
                    info!(runs = runs.len(), "sweep pass dispatched letters");
                }
                Ok(_) => {}
                Err(err) => error!(?err, "sweep pass failed"),
            }

            if *cancel.borrow() {
                info!("stop signal received; scheduler sweep loop exiting");
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.changed() => {
                    info!("stop signal received; scheduler sweep loop exiting");
                    return;
                }
            }
        }
    }
}
