//! Computation of disjoint per-site sample assignments.
//!
//! # Policies
//!
//! **uniform**
//!
//! The sample indices are shuffled and cut into contiguous chunks whose sizes differ by at most
//! one. The first `n % N` sites receive the extra samples.
//!
//! **exponential**, **linear**, **square**
//!
//! The shuffled indices are cut into chunks sized by weight: `ratio^i` for `exponential`
//! (non-increasing, `0 < ratio < 1`), `i + 1` for `linear` and `(i + 1)^2` for `square`. Every
//! site first receives one sample, the rest is handed out proportionally to the weights by
//! largest remainder, so the sizes sum exactly to the dataset size.
//!
//! **label_restricted**
//!
//! Site `i` holds the `k` labels `L[(i * k + j) mod T]` for `j` in `0..k`, where `L` are the `T`
//! distinct labels in ascending order. The samples of a label are shuffled and split evenly
//! between the sites holding it, which keeps the plan disjoint. An optional cap draws a site's
//! samples round-robin across its labels.
//!
//! # Determinism
//!
//! All randomness comes from a [`ChaCha20Rng`] seeded with the run seed and passed down
//! explicitly. The training split uses stream `0`, the evaluation split stream `1`. The same
//! inputs always produce the same plan.

use std::{cmp::Ordering, collections::BTreeMap, fmt, str::FromStr};

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::dataset::Dataset;

/// Errors raised while planning. All of them abort the run before anything is written.
#[derive(Debug, Error, PartialEq)]
pub enum PartitionError {
    #[error("at least one participant is required")]
    NoParticipants,
    #[error("{participants} participants exceed the {samples} available samples")]
    TooManyParticipants { participants: usize, samples: usize },
    #[error("exponential ratio must lie in (0, 1), got {0}")]
    InvalidRatio(f64),
    #[error("k = {k} labels per site is invalid for a dataset with {labels} labels")]
    InvalidLabelCount { k: usize, labels: usize },
    #[error("{participants} participants x {k} labels cannot cover all {labels} labels")]
    UncoveredLabels {
        participants: usize,
        k: usize,
        labels: usize,
    },
    #[error("a cap of {cap} samples per site cannot hold {k} labels")]
    CapBelowLabels { cap: usize, k: usize },
    #[error("participant {participant} receives no samples of its label {label}")]
    EmptyLabelShare { participant: usize, label: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
/// The selectable partition policies.
pub enum SplitMethod {
    Uniform,
    Exponential,
    LabelRestricted,
    Linear,
    Square,
}

impl SplitMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitMethod::Uniform => "uniform",
            SplitMethod::Exponential => "exponential",
            SplitMethod::LabelRestricted => "label_restricted",
            SplitMethod::Linear => "linear",
            SplitMethod::Square => "square",
        }
    }
}

impl fmt::Display for SplitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(SplitMethod::Uniform),
            "exponential" => Ok(SplitMethod::Exponential),
            "label_restricted" => Ok(SplitMethod::LabelRestricted),
            "linear" => Ok(SplitMethod::Linear),
            "square" => Ok(SplitMethod::Square),
            other => Err(format!("unknown split method: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
/// Whether the evaluation set is shipped whole to every site or partitioned like the training set.
pub enum EvalMode {
    Shared,
    Partitioned,
}

impl Default for EvalMode {
    fn default() -> Self {
        EvalMode::Shared
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// A split method together with its parameters.
pub enum Policy {
    Uniform,
    Exponential {
        ratio: f64,
    },
    Linear,
    Square,
    LabelRestricted {
        k: usize,
        max_samples_per_site: Option<usize>,
    },
}

impl Policy {
    pub fn method(&self) -> SplitMethod {
        match self {
            Policy::Uniform => SplitMethod::Uniform,
            Policy::Exponential { .. } => SplitMethod::Exponential,
            Policy::Linear => SplitMethod::Linear,
            Policy::Square => SplitMethod::Square,
            Policy::LabelRestricted { .. } => SplitMethod::LabelRestricted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// The evaluation samples a site receives.
pub enum EvalShare {
    /// The whole evaluation set, shipped as one shared artifact.
    Shared,
    /// The site's own evaluation indices.
    Own(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteAssignment {
    pub site_name: String,
    /// Indices into the training dataset.
    pub train: Vec<usize>,
    pub eval: EvalShare,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// The per-site assignment of one run. Index sets are pairwise disjoint.
pub struct PartitionPlan {
    pub method: SplitMethod,
    pub seed: u64,
    pub eval_mode: EvalMode,
    /// One assignment per site, in inventory order.
    pub sites: Vec<SiteAssignment>,
}

impl PartitionPlan {
    /// The number of training samples per site.
    pub fn train_sizes(&self) -> Vec<usize> {
        self.sites.iter().map(|site| site.train.len()).collect()
    }
}

/// Plans the training split, and the evaluation split if `eval_mode` asks for one, for the given
/// sites.
///
/// # Errors
/// Fails if the number of sites is zero or exceeds a dataset, or if the policy parameters cannot
/// be honoured.
pub fn plan(
    train: &Dataset,
    eval: &Dataset,
    site_names: &[String],
    policy: &Policy,
    eval_mode: EvalMode,
    seed: u64,
) -> Result<PartitionPlan, PartitionError> {
    let participants = site_names.len();
    let universe = train.label_set();

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let train_parts = split_indices(train, participants, policy, &universe, &mut rng)?;
    info!(
        "splitting {} samples into {} sites ({}): {:?}",
        train.len(),
        participants,
        policy.method(),
        train_parts.iter().map(Vec::len).collect::<Vec<_>>()
    );

    let eval_parts = match eval_mode {
        EvalMode::Shared => None,
        EvalMode::Partitioned => {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            rng.set_stream(1);
            let parts = split_indices(eval, participants, policy, &universe, &mut rng)?;
            info!(
                "splitting {} evaluation samples into {} sites: {:?}",
                eval.len(),
                participants,
                parts.iter().map(Vec::len).collect::<Vec<_>>()
            );
            Some(parts)
        }
    };

    let mut eval_parts = eval_parts.map(Vec::into_iter);
    let sites = site_names
        .iter()
        .zip(train_parts)
        .map(|(site_name, train)| SiteAssignment {
            site_name: site_name.clone(),
            train,
            eval: match eval_parts.as_mut().and_then(Iterator::next) {
                Some(own) => EvalShare::Own(own),
                None => EvalShare::Shared,
            },
        })
        .collect();

    Ok(PartitionPlan {
        method: policy.method(),
        seed,
        eval_mode,
        sites,
    })
}

/// Splits the indices of `dataset` into `participants` disjoint sets.
///
/// `universe` is the label set the label-restricted policy assigns from, so that a training and
/// an evaluation split hand each site the same labels.
pub fn split_indices(
    dataset: &Dataset,
    participants: usize,
    policy: &Policy,
    universe: &[u32],
    rng: &mut ChaCha20Rng,
) -> Result<Vec<Vec<usize>>, PartitionError> {
    if participants == 0 {
        return Err(PartitionError::NoParticipants);
    }
    if participants > dataset.len() {
        return Err(PartitionError::TooManyParticipants {
            participants,
            samples: dataset.len(),
        });
    }

    let total = dataset.len();
    let sizes = match *policy {
        Policy::Uniform => even_sizes(total, participants),
        Policy::Exponential { ratio } => {
            if !(ratio > 0. && ratio < 1.) {
                return Err(PartitionError::InvalidRatio(ratio));
            }
            let weights: Vec<f64> = (0..participants).map(|i| ratio.powi(i as i32)).collect();
            weighted_sizes(total, &weights)
        }
        Policy::Linear => {
            let weights: Vec<f64> = (1..=participants).map(|i| i as f64).collect();
            weighted_sizes(total, &weights)
        }
        Policy::Square => {
            let weights: Vec<f64> = (1..=participants).map(|i| (i * i) as f64).collect();
            weighted_sizes(total, &weights)
        }
        Policy::LabelRestricted {
            k,
            max_samples_per_site,
        } => {
            return label_restricted(
                dataset.labels(),
                participants,
                k,
                max_samples_per_site,
                universe,
                rng,
            )
        }
    };

    let mut indices: Vec<usize> = (0..total).collect();
    indices.shuffle(rng);
    Ok(chunk(indices, &sizes))
}

/// Sizes differing by at most one, the larger ones first.
fn even_sizes(total: usize, parts: usize) -> Vec<usize> {
    let base = total / parts;
    let remainder = total % parts;
    (0..parts)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Sizes proportional to `weights`, each at least one, summing to `total`.
///
/// Requires `weights.len() <= total`.
fn weighted_sizes(total: usize, weights: &[f64]) -> Vec<usize> {
    let parts = weights.len();
    let spare = total - parts;
    let weight_sum: f64 = weights.iter().sum();
    let shares: Vec<f64> = weights
        .iter()
        .map(|w| spare as f64 * w / weight_sum)
        .collect();
    let remainder = |i: usize| shares[i] - shares[i].floor();

    let mut sizes: Vec<usize> = shares.iter().map(|s| 1 + s.floor() as usize).collect();
    // largest remainder first, ties to the lower index
    let mut order: Vec<usize> = (0..parts).collect();
    order.sort_by(|&a, &b| {
        remainder(b)
            .partial_cmp(&remainder(a))
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });

    let assigned: usize = sizes.iter().sum();
    if assigned < total {
        for &i in order.iter().cycle().take(total - assigned) {
            sizes[i] += 1;
        }
    } else {
        // float rounding may overshoot by a few samples
        let mut excess = assigned - total;
        for &i in order.iter().rev().cycle() {
            if excess == 0 {
                break;
            }
            if sizes[i] > 1 {
                sizes[i] -= 1;
                excess -= 1;
            }
        }
    }
    sizes
}

fn chunk(indices: Vec<usize>, sizes: &[usize]) -> Vec<Vec<usize>> {
    let mut rest = indices.into_iter();
    sizes
        .iter()
        .map(|&size| rest.by_ref().take(size).collect())
        .collect()
}

/// The labels held by each participant.
pub fn assign_labels(universe: &[u32], participants: usize, k: usize) -> Vec<Vec<u32>> {
    (0..participants)
        .map(|i| {
            (0..k)
                .map(|j| universe[(i * k + j) % universe.len()])
                .collect()
        })
        .collect()
}

fn label_restricted(
    labels: &[u32],
    participants: usize,
    k: usize,
    cap: Option<usize>,
    universe: &[u32],
    rng: &mut ChaCha20Rng,
) -> Result<Vec<Vec<usize>>, PartitionError> {
    let total_labels = universe.len();
    if k == 0 || k > total_labels {
        return Err(PartitionError::InvalidLabelCount {
            k,
            labels: total_labels,
        });
    }
    if participants * k < total_labels {
        return Err(PartitionError::UncoveredLabels {
            participants,
            k,
            labels: total_labels,
        });
    }
    if let Some(cap) = cap {
        if cap < k {
            return Err(PartitionError::CapBelowLabels { cap, k });
        }
    }
    if k == total_labels {
        warn!("every site holds all {} labels, the split is not label skewed", k);
    }

    let assignment = assign_labels(universe, participants, k);

    let mut holders: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (participant, held) in assignment.iter().enumerate() {
        for &label in held {
            holders.entry(label).or_default().push(participant);
        }
    }
    let mut by_label: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (index, &label) in labels.iter().enumerate() {
        by_label.entry(label).or_default().push(index);
    }

    // (participant, label) -> that participant's share of the label's samples
    let mut shares: BTreeMap<(usize, u32), Vec<usize>> = BTreeMap::new();
    for (&label, holding) in &holders {
        let mut pool = by_label.remove(&label).unwrap_or_default();
        pool.shuffle(rng);
        let sizes = even_sizes(pool.len(), holding.len());
        for (&participant, share) in holding.iter().zip(chunk(pool, &sizes)) {
            shares.insert((participant, label), share);
        }
    }

    assignment
        .iter()
        .enumerate()
        .map(|(participant, held)| {
            let mut lists = Vec::with_capacity(held.len());
            for &label in held {
                let share = shares.remove(&(participant, label)).unwrap_or_default();
                if share.is_empty() {
                    return Err(PartitionError::EmptyLabelShare { participant, label });
                }
                lists.push(share);
            }
            Ok(match cap {
                Some(cap) => round_robin(lists, cap),
                None => lists.into_iter().flatten().collect(),
            })
        })
        .collect()
}

/// Draws one index from each list in turn until `cap` indices are taken or all lists are empty.
fn round_robin(lists: Vec<Vec<usize>>, cap: usize) -> Vec<usize> {
    let available: usize = lists.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    let mut drawn = Vec::with_capacity(cap.min(available));
    while drawn.len() < cap.min(available) {
        for iter in iters.iter_mut() {
            if drawn.len() == cap {
                break;
            }
            if let Some(index) = iter.next() {
                drawn.push(index);
            }
        }
    }
    drawn
}
