//! Parallel delivery of staged shards to the participant hosts.
//!
//! Every site is served by its own task. A task makes up to `retry_limit` attempts; one attempt
//! prepares the destination directory, uploads each file under a site-specific `.partial` name,
//! verifies its SHA-256 remotely and only then renames it into place, so a site never observes a
//! truncated shard under its final name. Failed attempts remove their partial files and are retried after
//! an exponential backoff. At most `parallelism` tasks run at a time.
//!
//! A failure of one site never affects another one: its outcome is recorded in the site's slot
//! of the result table and the fan-out carries on.
//!
//! Several sites may resolve to the same host. Their tasks share one destination per
//! `(address, port)`: the remote directory is replaced at most once per run, before the first
//! upload to it, so no site removes the shards delivered to another one.

pub mod transport;


use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use serde::Serialize;
use tokio::{
    sync::Mutex,
    time::{delay_for, timeout_at, Instant},
};
use tracing::{debug, error, info, warn};
use tracing_futures::Instrument;

pub use self::transport::{OpenSshTransport, TransferError, Transport};
use crate::{
    inventory::Participant,
    settings::DistributionSettings,
    shard::ShardArtifact,
    utils::ConcurrentFutures,
};

/// Suffix of files still being uploaded.
pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Ok,
    Failed,
    /// Written to staging by a dry run, never transferred.
    Staged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// The outcome of delivering one site's shard.
pub struct TransferResult {
    pub site_name: String,
    pub status: TransferStatus,
    pub error_detail: Option<String>,
    /// Number of attempts started. `0` when the site was never tried.
    pub attempts: u32,
}

impl TransferResult {
    pub fn ok(site_name: impl Into<String>, attempts: u32) -> Self {
        Self {
            site_name: site_name.into(),
            status: TransferStatus::Ok,
            error_detail: None,
            attempts,
        }
    }

    pub fn failed(site_name: impl Into<String>, attempts: u32, detail: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            status: TransferStatus::Failed,
            error_detail: Some(detail.into()),
            attempts,
        }
    }

    pub fn staged(site_name: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            status: TransferStatus::Staged,
            error_detail: None,
            attempts: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == TransferStatus::Ok
    }

    pub fn is_failed(&self) -> bool {
        self.status == TransferStatus::Failed
    }
}

/// A site to serve and the slot its result goes to.
#[derive(Debug, Clone)]
pub struct Job {
    pub slot: usize,
    pub participant: Participant,
    pub artifact: ShardArtifact,
}

/// A remote destination directory, shared by every site on the same host.
struct Destination {
    /// Whether the directory was prepared. Once it is, it is never replaced again.
    prepared: Mutex<bool>,
}

impl Destination {
    fn new() -> Self {
        Self {
            prepared: Mutex::new(false),
        }
    }
}

/// Fans the shards out to the hosts over a [`Transport`].
pub struct Distributor<T> {
    transport: Arc<T>,
    settings: DistributionSettings,
}

impl<T> Distributor<T>
where
    T: Transport,
{
    pub fn new(transport: T, settings: DistributionSettings) -> Self {
        Self {
            transport: Arc::new(transport),
            settings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> &DistributionSettings {
        &self.settings
    }

    /// Delivers every job and stores its result at `results[job.slot]`.
    ///
    /// No attempt is started after `deadline`, and attempts still running at the deadline are
    /// cancelled. Their sites are reported as failed.
    pub async fn distribute(
        &self,
        jobs: Vec<Job>,
        results: &mut [Option<TransferResult>],
        deadline: Option<Instant>,
    ) {
        info!(
            "distributing shards to {} sites, {} at a time",
            jobs.len(),
            self.settings.parallelism
        );
        let mut site_names = vec![String::new(); results.len()];
        let mut destinations: HashMap<(String, Option<u16>), Arc<Destination>> = HashMap::new();
        let mut tasks = ConcurrentFutures::new(self.settings.parallelism);
        for job in jobs {
            let span = tracing::info_span!(
                "deliver",
                site = %job.participant.site_name,
                host = %job.participant.host_address
            );
            site_names[job.slot] = job.participant.site_name.clone();
            let destination = destinations
                .entry((job.participant.host_address.clone(), job.participant.port))
                .or_insert_with(|| Arc::new(Destination::new()))
                .clone();
            let delivery = Delivery {
                transport: self.transport.clone(),
                settings: self.settings.clone(),
                destination,
                participant: job.participant,
                artifact: job.artifact,
                deadline,
            };
            tasks.push(job.slot, delivery.run().instrument(span));
        }

        while let Some((slot, result)) = tasks.next().await {
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    error!("delivery task of {} aborted: {}", site_names[slot], err);
                    TransferResult::failed(
                        site_names[slot].clone(),
                        0,
                        format!("delivery task aborted: {}", err),
                    )
                }
            };
            results[slot] = Some(result);
        }
    }
}

/// Everything a single site's task owns.
struct Delivery<T> {
    transport: Arc<T>,
    settings: DistributionSettings,
    destination: Arc<Destination>,
    participant: Participant,
    artifact: ShardArtifact,
    deadline: Option<Instant>,
}

impl<T> Delivery<T>
where
    T: Transport,
{
    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    async fn run(self) -> TransferResult {
        let site_name = self.participant.site_name.clone();
        let retry_limit = self.settings.retry_limit.max(1);
        let mut attempts = 0;
        let mut last_error: Option<String> = None;

        loop {
            if self.deadline_passed() {
                let detail = match &last_error {
                    None => "timeout: run deadline elapsed before the first attempt".to_string(),
                    Some(err) => format!(
                        "timeout: run deadline elapsed after {} attempts, last error: {}",
                        attempts, err
                    ),
                };
                warn!("{}", detail);
                return TransferResult::failed(site_name, attempts, detail);
            }

            attempts += 1;
            debug!("attempt {}/{}", attempts, retry_limit);
            let outcome = match self.deadline {
                Some(deadline) => timeout_at(deadline, self.attempt())
                    .await
                    .unwrap_or(Err(TransferError::Deadline)),
                None => self.attempt().await,
            };

            let err = match outcome {
                Ok(()) => {
                    info!("delivered shard after {} attempt(s)", attempts);
                    return TransferResult::ok(site_name, attempts);
                }
                Err(err) => err,
            };
            warn!("attempt {}/{} failed: {}", attempts, retry_limit, err);
            self.clean_up().await;

            if let TransferError::Deadline = err {
                return TransferResult::failed(
                    site_name,
                    attempts,
                    format!("timeout: run deadline elapsed during attempt {}", attempts),
                );
            }
            if attempts >= retry_limit {
                error!("giving up after {} attempts", attempts);
                return TransferResult::failed(site_name, attempts, err.to_string());
            }
            last_error = Some(err.to_string());

            let backoff = self.settings.backoff(attempts);
            match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        delay_for(backoff.min(deadline - now)).await;
                    }
                }
                None => delay_for(backoff).await,
            }
        }
    }

    async fn attempt(&self) -> Result<(), TransferError> {
        let host = &self.participant;
        let dest = &self.settings.remote_dest_path;
        self.prepare_destination().await?;

        let mut staged = Vec::with_capacity(2);
        for file in &self.artifact.files() {
            let remote = remote_path(dest, &file.remote_name);
            let partial = partial_path(&remote, &host.site_name);
            self.transport
                .upload(host, &file.local_path, &partial)
                .await?;
            let actual = self.transport.checksum(host, &partial).await?;
            if !actual.eq_ignore_ascii_case(&file.sha256) {
                return Err(TransferError::ChecksumMismatch {
                    path: partial,
                    expected: file.sha256.clone(),
                    actual,
                });
            }
            debug!("verified {} ({} bytes)", partial, file.size);
            staged.push((partial, remote));
        }

        for (partial, remote) in &staged {
            self.transport.promote(host, partial, remote).await?;
        }
        Ok(())
    }

    /// Creates the destination directory. Only the first site to get here on a host replaces
    /// it, the others wait for that and then keep its content.
    async fn prepare_destination(&self) -> Result<(), TransferError> {
        let mut prepared = self.destination.prepared.lock().await;
        let replace = self.settings.replace_remote_dir && !*prepared;
        self.transport
            .prepare_dir(&self.participant, &self.settings.remote_dest_path, replace)
            .await?;
        *prepared = true;
        Ok(())
    }

    /// Removes whatever partial files the failed attempt may have left. Errors are ignored, the
    /// next attempt overwrites them anyway.
    async fn clean_up(&self) {
        if self.deadline_passed() {
            return;
        }
        for file in &self.artifact.files() {
            let partial = partial_path(
                &remote_path(&self.settings.remote_dest_path, &file.remote_name),
                &self.participant.site_name,
            );
            let discard = self.transport.discard(&self.participant, &partial);
            let discarded = match self.deadline {
                Some(deadline) => timeout_at(deadline, discard)
                    .await
                    .unwrap_or(Err(TransferError::Deadline)),
                None => discard.await,
            };
            if let Err(err) = discarded {
                debug!("could not remove {}: {}", partial, err);
            }
        }
    }
}

/// Joins a destination directory and a file name.
pub fn remote_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// The name a site uploads `remote` under before it is verified. Sites sharing a host upload the
/// shared evaluation file to separate partials.
pub fn partial_path(remote: &str, site_name: &str) -> String {
    format!("{}.{}{}", remote, site_name, PARTIAL_SUFFIX)
}
