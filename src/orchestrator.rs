//! End-to-end sequencing of a distribution run.
//!
//! inventory -> plan -> write -> distribute -> staging cleanup -> [`RunSummary`]
//!
//! Inventory and partition errors abort the run before anything is written. Everything after
//! that is isolated per site and ends up in the summary.

use std::{
    fs,
    path::{Path, PathBuf},
};

use derive_more::From;
use displaydoc::Display;
use serde::Serialize;
use tempfile::TempDir;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    dataset::Dataset,
    distributor::{Distributor, Job, TransferResult, Transport},
    inventory::{self, InventoryError},
    partition::{self, PartitionError, SplitMethod},
    settings::{InventorySettings, PartitionSettings, Settings, StagingSettings},
    shard::{self, ShardArtifact, ShardWriter, WriteError},
};

/// Errors that abort a run before any shard is shipped.
#[derive(Debug, Display, Error)]
pub enum PipelineError {
    /// Inventory resolution failed: {0}.
    Inventory(#[from] InventoryError),
    /// Partitioning failed: {0}.
    Partition(#[from] PartitionError),
    /// Failed to prepare the staging directory: {0}.
    Staging(#[from] WriteError),
}

/// How a completed run went.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// success
    Success,
    /// partial success
    PartialSuccess,
    /// below the success threshold
    BelowThreshold,
}

impl RunOutcome {
    /// The process exit status of the outcome. Hard failures exit with `1`.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::PartialSuccess => 2,
            RunOutcome::BelowThreshold => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub split_method: SplitMethod,
    pub seed: u64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Sites whose shard a dry run staged without transferring it.
    pub staged: usize,
    pub outcome: RunOutcome,
    /// No transfer was made, shards were only staged.
    pub dry_run: bool,
    /// Staging directory left behind for inspection, if any.
    pub retained_staging: Option<PathBuf>,
    /// One entry per site, in inventory order.
    pub per_site_detail: Vec<TransferResult>,
}

impl RunSummary {
    fn new(
        split_method: SplitMethod,
        seed: u64,
        per_site_detail: Vec<TransferResult>,
        min_successful: Option<usize>,
    ) -> Self {
        let total = per_site_detail.len();
        let succeeded = per_site_detail.iter().filter(|r| r.is_ok()).count();
        let failed = per_site_detail.iter().filter(|r| r.is_failed()).count();
        let staged = total - succeeded - failed;
        let outcome = match min_successful {
            Some(min) if succeeded < min => RunOutcome::BelowThreshold,
            _ if failed > 0 => RunOutcome::PartialSuccess,
            _ => RunOutcome::Success,
        };
        Self {
            split_method,
            seed,
            total,
            succeeded,
            failed,
            staged,
            outcome,
            dry_run: false,
            retained_staging: None,
            per_site_detail,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Where shards are staged before shipping.
#[derive(From)]
enum Staging {
    Dir(PathBuf),
    Temp(TempDir),
}

impl Staging {
    fn open(settings: &StagingSettings) -> Result<Self, WriteError> {
        match &settings.dir {
            Some(dir) => Ok(Staging::from(dir.clone())),
            None => tempfile::Builder::new()
                .prefix("shards-")
                .tempdir()
                .map(Staging::from)
                .map_err(|source| WriteError::Io {
                    path: std::env::temp_dir(),
                    source,
                }),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Staging::Dir(dir) => dir,
            Staging::Temp(dir) => dir.path(),
        }
    }

    /// Keeps the directory on disk and returns its path.
    fn retain(self) -> PathBuf {
        match self {
            Staging::Dir(dir) => dir,
            Staging::Temp(dir) => dir.into_path(),
        }
    }
}

/// Drives a run over a [`Transport`].
pub struct Orchestrator<T> {
    inventory: InventorySettings,
    partition: PartitionSettings,
    staging: StagingSettings,
    distributor: Distributor<T>,
    dry_run: bool,
}

impl<T> Orchestrator<T>
where
    T: Transport,
{
    pub fn new(
        inventory: InventorySettings,
        partition: PartitionSettings,
        staging: StagingSettings,
        distributor: Distributor<T>,
    ) -> Self {
        Self {
            inventory,
            partition,
            staging,
            distributor,
            dry_run: false,
        }
    }

    pub fn from_settings(settings: &Settings, transport: T) -> Self {
        Self::new(
            settings.inventory.clone(),
            settings.partition.clone(),
            settings.staging.clone(),
            Distributor::new(transport, settings.distribution.clone()),
        )
    }

    /// Stops after staging the shards.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Runs the pipeline on a loaded training and evaluation set.
    ///
    /// # Errors
    /// Fails on inventory or partition errors and when the staging directory cannot be created.
    /// Per-site failures are reported in the summary instead.
    pub async fn run(&self, train: &Dataset, eval: &Dataset) -> Result<RunSummary, PipelineError> {
        let deadline = self
            .distributor
            .settings()
            .run_timeout()
            .map(|timeout| Instant::now() + timeout);

        let participants = inventory::select(
            inventory::resolve(&self.inventory.path, &self.inventory.group)?,
            self.partition.participant_count,
        )?;
        let site_names: Vec<String> = participants.iter().map(|p| p.site_name.clone()).collect();

        let policy = self.partition.policy();
        let plan = partition::plan(
            train,
            eval,
            &site_names,
            &policy,
            self.partition.eval_mode,
            self.partition.seed,
        )?;

        let staging = Staging::open(&self.staging)?;
        let writer = ShardWriter::new(staging.path())?;
        let written = writer.write_plan(&plan, train, eval);

        let mut results: Vec<Option<TransferResult>> = vec![None; participants.len()];
        let mut artifacts: Vec<Option<ShardArtifact>> = vec![None; participants.len()];
        let mut jobs = Vec::with_capacity(participants.len());
        for (slot, (participant, written)) in participants.into_iter().zip(written).enumerate() {
            match written {
                Ok(artifact) => {
                    artifacts[slot] = Some(artifact.clone());
                    jobs.push(Job {
                        slot,
                        participant,
                        artifact,
                    });
                }
                Err(err) => {
                    error!("failed to write shard of {}: {}", participant.site_name, err);
                    results[slot] = Some(TransferResult::failed(
                        participant.site_name,
                        0,
                        format!("write failed: {}", err),
                    ));
                }
            }
        }

        if self.dry_run {
            info!(
                "dry run: {} shards staged in {}",
                jobs.len(),
                staging.path().display()
            );
            for job in jobs {
                results[job.slot] = Some(TransferResult::staged(job.participant.site_name));
            }
        } else {
            self.distributor.distribute(jobs, &mut results, deadline).await;
        }

        let per_site_detail: Vec<TransferResult> = results
            .into_iter()
            .zip(site_names)
            .map(|(result, site_name)| {
                result.unwrap_or_else(|| TransferResult::failed(site_name, 0, "not attempted"))
            })
            .collect();

        // a dry run delivers nothing, the threshold only applies to real transfers
        let min_successful = if self.dry_run {
            None
        } else {
            self.distributor.settings().min_successful
        };
        let mut summary = RunSummary::new(plan.method, plan.seed, per_site_detail, min_successful);
        summary.dry_run = self.dry_run;
        summary.retained_staging = self.clean_up(staging, &artifacts, &summary.per_site_detail);

        info!(
            "distribution finished: {} of {} sites succeeded",
            summary.succeeded, summary.total
        );
        for failed in summary.per_site_detail.iter().filter(|r| r.is_failed()) {
            warn!(
                "{} failed after {} attempt(s): {}",
                failed.site_name,
                failed.attempts,
                failed.error_detail.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(summary)
    }

    /// Removes the staged files of delivered sites. Returns the staging directory if anything
    /// was kept in it.
    fn clean_up(
        &self,
        staging: Staging,
        artifacts: &[Option<ShardArtifact>],
        results: &[TransferResult],
    ) -> Option<PathBuf> {
        if self.dry_run || self.staging.keep_artifacts {
            return Some(staging.retain());
        }

        let mut shared_eval = None;
        for (artifact, result) in artifacts.iter().zip(results) {
            if let Some(artifact) = artifact {
                if artifact.shared_eval {
                    shared_eval = Some(artifact.eval.local_path.clone());
                }
                if result.is_ok() {
                    shard::discard(artifact);
                }
            }
        }

        if results.iter().all(TransferResult::is_ok) {
            if let Some(path) = shared_eval {
                if let Err(err) = fs::remove_file(&path) {
                    debug!("could not remove {}: {}", path.display(), err);
                }
            }
            // a temporary staging directory is deleted on drop
            None
        } else {
            let retained = staging.retain();
            info!(
                "shards of failed sites retained in {}",
                retained.display()
            );
            Some(retained)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::{
        distributor::{transport::MockTransport, TransferError, TransferStatus, PARTIAL_SUFFIX},
        partition::EvalMode,
        settings::{DistributionSettings, ExponentialSettings, LabelRestrictedSettings},
    };

    fn inventory_file(hosts: usize) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        writeln!(file, "[clients]").unwrap();
        for i in 1..=hosts {
            writeln!(file, "hospital-{} ansible_host=10.0.0.{}", i, i).unwrap();
        }
        file
    }

    fn partition_settings(participant_count: Option<usize>) -> PartitionSettings {
        PartitionSettings {
            split_method: SplitMethod::Uniform,
            participant_count,
            seed: 3,
            eval_mode: EvalMode::Shared,
            exponential: ExponentialSettings::default(),
            label_restricted: LabelRestrictedSettings::default(),
        }
    }

    fn dataset(len: usize) -> Dataset {
        Dataset::new(
            2,
            (0..2 * len).map(|i| i as f32).collect(),
            (0..len).map(|i| i as u32 % 4).collect(),
        )
        .unwrap()
    }

    fn build(
        inventory: &NamedTempFile,
        staging: &Path,
        participant_count: Option<usize>,
        transport: MockTransport,
        min_successful: Option<usize>,
    ) -> Orchestrator<MockTransport> {
        Orchestrator::new(
            InventorySettings {
                path: inventory.path().to_path_buf(),
                group: "clients".to_string(),
            },
            partition_settings(participant_count),
            StagingSettings {
                dir: Some(staging.to_path_buf()),
                keep_artifacts: false,
            },
            Distributor::new(
                transport,
                DistributionSettings {
                    retry_limit: 2,
                    retry_backoff_base: 1,
                    min_successful,
                    ..DistributionSettings::default()
                },
            ),
        )
    }

    /// Fails every operation against the hosts in `unreachable`. Checksums are taken from the
    /// staged files, there is no remote side.
    fn transport(staging: &Path, unreachable: &'static [&'static str]) -> MockTransport {
        let staging = staging.to_path_buf();
        let mut transport = MockTransport::new();
        transport.expect_prepare_dir().returning(move |host, _, _| {
            if unreachable.contains(&host.site_name.as_str()) {
                Err(TransferError::Unreachable {
                    host: host.host_address.clone(),
                    stderr: "Connection timed out".to_string(),
                })
            } else {
                Ok(())
            }
        });
        transport.expect_upload().returning(|_, _, _| Ok(()));
        transport.expect_checksum().returning(move |host, remote| {
            let name = remote
                .trim_end_matches(&format!(".{}{}", host.site_name, PARTIAL_SUFFIX))
                .rsplit('/')
                .next()
                .unwrap()
                .to_string();
            Ok(shard::sha256_hex(&fs::read(staging.join(name)).unwrap()))
        });
        transport.expect_promote().returning(|_, _, _| Ok(()));
        transport.expect_discard().returning(|_, _| Ok(()));
        transport
    }

    #[tokio::test]
    async fn test_successful_run_cleans_staging() {
        let inventory = inventory_file(3);
        let staging = tempfile::tempdir().unwrap();

        let transport = transport(staging.path(), &[]);
        let orchestrator = build(&inventory, staging.path(), None, transport, None);
        let summary = orchestrator.run(&dataset(60), &dataset(12)).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Success);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!((summary.total, summary.succeeded, summary.failed), (3, 3, 0));
        assert_eq!(summary.retained_staging, None);
        assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_retains_failed_shards() {
        let inventory = inventory_file(4);
        let staging = tempfile::tempdir().unwrap();

        let orchestrator = build(
            &inventory,
            staging.path(),
            None,
            transport(staging.path(), &["hospital-2"]),
            None,
        );
        let summary = orchestrator.run(&dataset(60), &dataset(12)).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::PartialSuccess);
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(summary.failed, 1);
        let failed = &summary.per_site_detail[1];
        assert_eq!(failed.site_name, "hospital-2");
        assert_eq!(failed.status, TransferStatus::Failed);
        assert_eq!(failed.attempts, 2);

        assert_eq!(summary.retained_staging.as_deref(), Some(staging.path()));
        let mut left: Vec<String> = fs::read_dir(staging.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["hospital-2_train.shard", "test_data.shard"]);
    }

    #[tokio::test]
    async fn test_min_successful_threshold() {
        let inventory = inventory_file(3);
        let staging = tempfile::tempdir().unwrap();

        let orchestrator = build(
            &inventory,
            staging.path(),
            None,
            transport(staging.path(), &["hospital-1", "hospital-3"]),
            Some(2),
        );
        let summary = orchestrator.run(&dataset(60), &dataset(12)).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::BelowThreshold);
        assert_eq!(summary.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_transfers_nothing() {
        let inventory = inventory_file(2);
        let staging = tempfile::tempdir().unwrap();

        let orchestrator =
            build(&inventory, staging.path(), None, MockTransport::new(), Some(2))
                .dry_run(true);
        let summary = orchestrator.run(&dataset(20), &dataset(4)).await.unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.outcome, RunOutcome::Success);
        assert_eq!((summary.succeeded, summary.failed, summary.staged), (0, 0, 2));
        assert!(summary
            .per_site_detail
            .iter()
            .all(|r| r.status == TransferStatus::Staged && r.attempts == 0));
        let staged = shard::read_shard(staging.path().join("hospital-1_train.shard")).unwrap();
        assert_eq!(staged.data.len(), 10);
    }

    #[tokio::test]
    async fn test_planning_errors_abort_before_writing() {
        let inventory = inventory_file(3);
        let staging = tempfile::tempdir().unwrap();
        let missing = staging.path().join("not-created");

        let orchestrator = build(&inventory, &missing, None, MockTransport::new(), None);
        assert!(matches!(
            orchestrator.run(&dataset(2), &dataset(2)).await,
            Err(PipelineError::Partition(PartitionError::TooManyParticipants { .. }))
        ));
        assert!(!missing.exists());

        let orchestrator = build(&inventory, &missing, Some(5), MockTransport::new(), None);
        assert!(matches!(
            orchestrator.run(&dataset(20), &dataset(4)).await,
            Err(PipelineError::Inventory(InventoryError::TooFewHosts { .. }))
        ));
    }

    #[test]
    fn test_outcome_rules() {
        let ok = |site: &str| TransferResult::ok(site, 1);
        let failed = |site: &str| TransferResult::failed(site, 3, "unreachable");
        let outcome = |results, min| RunSummary::new(SplitMethod::Uniform, 0, results, min).outcome;

        assert_eq!(outcome(vec![ok("a"), ok("b")], None), RunOutcome::Success);
        assert_eq!(
            outcome(vec![ok("a"), failed("b")], None),
            RunOutcome::PartialSuccess
        );
        assert_eq!(
            outcome(vec![ok("a"), failed("b")], Some(1)),
            RunOutcome::PartialSuccess
        );
        assert_eq!(
            outcome(vec![failed("a"), failed("b")], None),
            RunOutcome::PartialSuccess
        );
        assert_eq!(
            outcome(vec![ok("a"), failed("b")], Some(2)),
            RunOutcome::BelowThreshold
        );
    }
}
