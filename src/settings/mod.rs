//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! prefix `SHARD_DISTRIBUTOR` and the separator `__`, e.g. `SHARD_DISTRIBUTOR_PARTITION__SEED=7`.
//! An example configuration file can be found in the `configs/` directory located in the
//! repository root.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::partition::{EvalMode, Policy, SplitMethod};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub inventory: InventorySettings,
    #[validate]
    pub dataset: DatasetSettings,
    #[validate]
    pub partition: PartitionSettings,
    #[validate]
    pub distribution: DistributionSettings,
    #[serde(default)]
    #[validate]
    pub ssh: SshSettings,
    #[serde(default)]
    pub staging: StagingSettings,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        Self::new_with(path, |_| {})
    }

    /// Loads the settings, applies `overrides` (e.g. command line flags) and validates the
    /// result.
    pub fn new_with<F>(path: impl AsRef<Path>, overrides: F) -> Result<Self, SettingsError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings: Settings = Self::load(path)?;
        overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("shard_distributor").separator("__"))?;
        config.try_into()
    }
}

fn default_group() -> String {
    "clients".to_string()
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Where the participants come from.
pub struct InventorySettings {
    /// Path of the Ansible inventory, INI or YAML.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [inventory]
    /// path = "inventory.ini"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SHARD_DISTRIBUTOR_INVENTORY__PATH=inventory.ini
    /// ```
    pub path: PathBuf,

    /// The inventory group whose hosts receive shards. Defaults to `clients`.
    #[serde(default = "default_group")]
    #[validate(length(min = 1))]
    pub group: String,
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_dataset"))]
/// The centrally held dataset.
///
/// The evaluation set is either read from its own file (`eval_path`) or made of the first
/// `eval_size` samples of the training file. Exactly one of both must be set.
pub struct DatasetSettings {
    /// A `.json` or `.csv` file. CSV rows hold the label first, then the features.
    pub train_path: PathBuf,
    pub eval_path: Option<PathBuf>,
    pub eval_size: Option<usize>,
}

impl DatasetSettings {
    fn validate_dataset(&self) -> Result<(), ValidationError> {
        match (&self.eval_path, self.eval_size) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ValidationError::new(
                "exactly one of eval_path and eval_size must be set",
            )),
        }
    }
}

fn validate_dataset(s: &DatasetSettings) -> Result<(), ValidationError> {
    s.validate_dataset()
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ExponentialSettings {
    /// The ratio between the shares of two consecutive sites, `0 < ratio < 1`.
    pub ratio: f64,
}

impl Default for ExponentialSettings {
    fn default() -> Self {
        Self { ratio: 0.5 }
    }
}

fn default_k() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct LabelRestrictedSettings {
    /// The number of labels each site holds.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Caps the number of training samples of a site.
    pub max_samples_per_site: Option<usize>,
}

impl Default for LabelRestrictedSettings {
    fn default() -> Self {
        Self {
            k: default_k(),
            max_samples_per_site: None,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// The partition policy.
///
/// Policy parameters are checked by the planner, which reports them as partition errors.
pub struct PartitionSettings {
    /// One of `uniform`, `exponential`, `label_restricted`, `linear` or `square`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [partition]
    /// split_method = "label_restricted"
    ///
    /// [partition.label_restricted]
    /// k = 2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SHARD_DISTRIBUTOR_PARTITION__SPLIT_METHOD=uniform
    /// ```
    pub split_method: SplitMethod,

    /// Number of sites. Defaults to the number of hosts in the inventory group, otherwise the
    /// first `participant_count` hosts are used.
    #[validate(range(min = 1))]
    pub participant_count: Option<usize>,

    /// Seed of the shuffles. The same seed always yields the same plan.
    #[serde(default)]
    pub seed: u64,

    /// `shared` (default) ships the whole evaluation set to every site, `partitioned` splits it
    /// with the same policy.
    #[serde(default)]
    pub eval_mode: EvalMode,

    #[serde(default)]
    pub exponential: ExponentialSettings,

    #[serde(default)]
    pub label_restricted: LabelRestrictedSettings,
}

impl PartitionSettings {
    pub fn policy(&self) -> Policy {
        match self.split_method {
            SplitMethod::Uniform => Policy::Uniform,
            SplitMethod::Exponential => Policy::Exponential {
                ratio: self.exponential.ratio,
            },
            SplitMethod::Linear => Policy::Linear,
            SplitMethod::Square => Policy::Square,
            SplitMethod::LabelRestricted => Policy::LabelRestricted {
                k: self.label_restricted.k,
                max_samples_per_site: self.label_restricted.max_samples_per_site,
            },
        }
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_retry_limit() -> u32 {
    3
}

fn default_retry_backoff_base() -> u64 {
    500
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_distribution"))]
/// The transfer fan-out.
pub struct DistributionSettings {
    /// Absolute destination directory on every host.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [distribution]
    /// remote_dest_path = "/srv/fl/data"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SHARD_DISTRIBUTOR_DISTRIBUTION__REMOTE_DEST_PATH=/srv/fl/data
    /// ```
    pub remote_dest_path: String,

    /// Maximal number of concurrent transfers.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1))]
    pub parallelism: usize,

    /// Maximal number of attempts per site.
    #[serde(default = "default_retry_limit")]
    #[validate(range(min = 1))]
    pub retry_limit: u32,

    /// Backoff before the second attempt, in milliseconds. It doubles with every further
    /// attempt.
    #[serde(default = "default_retry_backoff_base")]
    pub retry_backoff_base: u64,

    /// Deadline of the whole run, in seconds. Once it elapses no further attempt is started and
    /// the sites not yet served are reported as failed.
    #[validate(range(min = 1))]
    pub run_timeout: Option<u64>,

    /// Delete the destination directory before copying, as a fresh deployment does.
    #[serde(default)]
    pub replace_remote_dir: bool,

    /// Minimal number of sites that must receive their shard for the run to count as usable.
    pub min_successful: Option<usize>,
}

/// Upper bound of a single backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

impl DistributionSettings {
    /// The delay after the failed attempt number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_base.saturating_mul(factor)).min(MAX_BACKOFF)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout.map(Duration::from_secs)
    }

    fn validate_distribution(&self) -> Result<(), ValidationError> {
        if is_safe_remote_path(&self.remote_dest_path) {
            Ok(())
        } else {
            Err(ValidationError::new(
                "remote_dest_path must be absolute and contain no whitespace or quotes",
            ))
        }
    }
}

fn validate_distribution(s: &DistributionSettings) -> Result<(), ValidationError> {
    s.validate_distribution()
}

fn is_safe_remote_path(path: &str) -> bool {
    path.starts_with('/')
        && !path
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '"' || c == '\\' || c == '`')
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_scp() -> String {
    "scp".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// The OpenSSH client used for transfers.
pub struct SshSettings {
    #[serde(default = "default_ssh")]
    pub ssh_program: String,
    #[serde(default = "default_scp")]
    pub scp_program: String,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    #[validate(range(min = 1))]
    pub connect_timeout: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_program: default_ssh(),
            scp_program: default_scp(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
/// Local staging of the shard files.
pub struct StagingSettings {
    /// Staging directory. A temporary directory is used when unset.
    pub dir: Option<PathBuf>,
    /// Keep every staged file, not only those of failed sites.
    #[serde(default)]
    pub keep_artifacts: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SHARD_DISTRIBUTOR_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Default for DistributionSettings {
        fn default() -> Self {
            Self {
                remote_dest_path: "/tmp/fl_data".to_string(),
                parallelism: default_parallelism(),
                retry_limit: default_retry_limit(),
                retry_backoff_base: default_retry_backoff_base(),
                run_timeout: None,
                replace_remote_dir: false,
                min_successful: None,
            }
        }
    }

    #[test]
    fn test_settings_new() {
        let settings = Settings::new("configs/config.toml").unwrap();
        assert_eq!(settings.inventory.group, "clients");
        assert_eq!(settings.partition.split_method, SplitMethod::Uniform);
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_settings_overrides_are_validated() {
        let settings = Settings::new_with("configs/config.toml", |s| {
            s.partition.split_method = SplitMethod::LabelRestricted;
            s.partition.seed = 99;
        })
        .unwrap();
        assert_eq!(settings.partition.seed, 99);
        assert_eq!(
            settings.partition.policy(),
            Policy::LabelRestricted {
                k: 2,
                max_samples_per_site: None
            }
        );

        assert!(Settings::new_with("configs/config.toml", |s| {
            s.distribution.parallelism = 0;
        })
        .is_err());
    }

    #[test]
    fn test_validate_dataset() {
        let dataset = DatasetSettings {
            train_path: PathBuf::from("train.csv"),
            eval_path: None,
            eval_size: Some(100),
        };
        assert!(dataset.validate().is_ok());
        assert!(DatasetSettings {
            eval_path: Some(PathBuf::from("eval.csv")),
            ..dataset.clone()
        }
        .validate()
        .is_err());
        assert!(DatasetSettings {
            eval_size: None,
            ..dataset
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_distribution() {
        assert!(DistributionSettings::default().validate().is_ok());

        let mut distribution = DistributionSettings::default();
        distribution.retry_limit = 0;
        assert!(distribution.validate().is_err());

        for path in &["relative/dir", "/tmp/with space", "/tmp/'quoted'", "/tmp/`x`"] {
            let mut distribution = DistributionSettings::default();
            distribution.remote_dest_path = path.to_string();
            assert!(distribution.validate().is_err(), "{}", path);
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let distribution = DistributionSettings {
            retry_backoff_base: 100,
            ..DistributionSettings::default()
        };
        assert_eq!(distribution.backoff(1), Duration::from_millis(100));
        assert_eq!(distribution.backoff(2), Duration::from_millis(200));
        assert_eq!(distribution.backoff(4), Duration::from_millis(800));
        assert_eq!(distribution.backoff(200), MAX_BACKOFF);
    }

    #[test]
    fn test_policy_from_settings() {
        let partition = PartitionSettings {
            split_method: SplitMethod::Exponential,
            participant_count: None,
            seed: 0,
            eval_mode: EvalMode::Shared,
            exponential: ExponentialSettings { ratio: 0.3 },
            label_restricted: LabelRestrictedSettings::default(),
        };
        assert_eq!(partition.policy(), Policy::Exponential { ratio: 0.3 });
    }
}
