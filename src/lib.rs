//! Prepares the training data of a federated learning cluster.
//!
//! A centrally held dataset is partitioned across the sites listed in an Ansible inventory,
//! following one of several skew policies, and every site's shard is shipped to its host over
//! SSH. The run ends with a per-site summary.
//!
//! The pipeline, leaves first:
//! - [`inventory`] resolves the participant hosts.
//! - [`partition`] computes a deterministic, disjoint split of the sample indices.
//! - [`shard`] serializes each site's samples into a versioned file.
//! - [`distributor`] delivers the files with bounded parallelism, retries and integrity checks.
//! - [`orchestrator`] sequences the above and aggregates the results.
//!
//! # Split methods
//! - `uniform`: shuffled, sizes differ by at most one sample.
//! - `exponential`: site `i` receives a share proportional to `ratio^i`.
//! - `linear` and `square`: shares proportional to `i + 1` and `(i + 1)^2`.
//! - `label_restricted`: every site only holds samples of `k` labels, assigned round-robin.

pub mod dataset;
pub mod distributor;
pub mod inventory;
pub mod orchestrator;
pub mod partition;
pub mod settings;
pub mod shard;
pub(crate) mod utils;

pub use self::{
    dataset::Dataset,
    orchestrator::{Orchestrator, PipelineError, RunOutcome, RunSummary},
};
