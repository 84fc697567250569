//! Serialization of per-site shards into staging files.
//!
//! A shard file starts with the magic bytes [`SHARD_MAGIC`] and the little-endian format
//! version, followed by the bincode encoding of a [`ShardFile`]. Readers refuse any other
//! version, so artifacts of one layout are never decoded with another.
//!
//! Files are written next to their final name and renamed into place once complete. The SHA-256
//! digest and the size recorded for each file are what the distributor verifies remotely.

use std::{
    fs,
    path::{Path, PathBuf},
};

use bincode::Options;
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::hash::sha256;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    dataset::Dataset,
    partition::{EvalShare, PartitionPlan},
};

pub const SHARD_MAGIC: &[u8; 8] = b"FLSHARD\0";
pub const FORMAT_VERSION: u16 = 1;
pub const SHARD_EXTENSION: &str = "shard";
/// File stem of the evaluation set shared by all sites.
pub const SHARED_EVAL_STEM: &str = "test_data";

const HEADER_LEN: usize = 10;

/// Error raised while writing one site's shard. It only fails that site.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode shard: {0}")]
    Encode(#[from] bincode::Error),
    #[error("shared evaluation set could not be written: {0}")]
    SharedEval(String),
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a shard file")]
    BadMagic,
    #[error("unsupported shard format version {0}, expected {}", FORMAT_VERSION)]
    UnsupportedVersion(u16),
    #[error("failed to decode shard: {0}")]
    Decode(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardKind {
    Train,
    Eval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The content of a shard file.
pub struct ShardFile {
    /// `None` for the evaluation set shared by all sites.
    pub site_name: Option<String>,
    pub kind: ShardKind,
    pub data: Dataset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// A staged file and what it must look like once shipped.
pub struct ArtifactFile {
    pub local_path: PathBuf,
    /// File name below the remote destination directory.
    pub remote_name: String,
    pub size: u64,
    /// Hex encoded SHA-256 of the file.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Everything a site receives.
pub struct ShardArtifact {
    pub site_name: String,
    pub train: ArtifactFile,
    pub eval: ArtifactFile,
    /// Whether `eval` is the shared evaluation file rather than one of the site's own.
    pub shared_eval: bool,
}

impl ShardArtifact {
    pub fn files(&self) -> [&ArtifactFile; 2] {
        [&self.train, &self.eval]
    }
}

pub fn train_file_name(site_name: &str) -> String {
    format!("{}_train.{}", site_name, SHARD_EXTENSION)
}

pub fn eval_file_name(site_name: Option<&str>) -> String {
    match site_name {
        Some(site_name) => format!("{}_test.{}", site_name, SHARD_EXTENSION),
        None => format!("{}.{}", SHARED_EVAL_STEM, SHARD_EXTENSION),
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encodes a shard, header included.
pub fn encode(shard: &ShardFile) -> Result<Vec<u8>, bincode::Error> {
    let body = codec().serialize(shard)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(SHARD_MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decodes a shard, checking magic bytes and format version.
pub fn decode(bytes: &[u8]) -> Result<ShardFile, ReadError> {
    if bytes.len() < HEADER_LEN || &bytes[..8] != SHARD_MAGIC {
        return Err(ReadError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[8], bytes[9]]);
    if version != FORMAT_VERSION {
        return Err(ReadError::UnsupportedVersion(version));
    }
    Ok(codec().deserialize(&bytes[HEADER_LEN..])?)
}

pub fn read_shard(path: impl AsRef<Path>) -> Result<ShardFile, ReadError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode(&bytes)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(&sha256::hash(bytes).0)
}

/// Materializes a [`PartitionPlan`] into shard files below a staging directory.
pub struct ShardWriter {
    staging: PathBuf,
}

impl ShardWriter {
    /// Creates the writer, creating `staging` if needed.
    pub fn new(staging: impl Into<PathBuf>) -> Result<Self, WriteError> {
        let staging = staging.into();
        fs::create_dir_all(&staging).map_err(|source| WriteError::Io {
            path: staging.clone(),
            source,
        })?;
        Ok(Self { staging })
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Writes every site's shard. The result has one entry per site of the plan, in plan order;
    /// a failing site does not stop the others.
    pub fn write_plan(
        &self,
        plan: &PartitionPlan,
        train: &Dataset,
        eval: &Dataset,
    ) -> Vec<Result<ShardArtifact, WriteError>> {
        let needs_shared = plan.sites.iter().any(|s| s.eval == EvalShare::Shared);
        let shared = if needs_shared {
            let written = self.write_file(
                &eval_file_name(None),
                &ShardFile {
                    site_name: None,
                    kind: ShardKind::Eval,
                    data: eval.clone(),
                },
            );
            if let Err(err) = &written {
                error!("failed to write the shared evaluation set: {}", err);
            }
            Some(written.map_err(|err| err.to_string()))
        } else {
            None
        };

        plan.sites
            .iter()
            .map(|site| {
                let train_file = self.write_file(
                    &train_file_name(&site.site_name),
                    &ShardFile {
                        site_name: Some(site.site_name.clone()),
                        kind: ShardKind::Train,
                        data: train.subset(&site.train),
                    },
                )?;
                let (eval_file, shared_eval) = match &site.eval {
                    EvalShare::Own(indices) => (
                        self.write_file(
                            &eval_file_name(Some(&site.site_name)),
                            &ShardFile {
                                site_name: Some(site.site_name.clone()),
                                kind: ShardKind::Eval,
                                data: eval.subset(indices),
                            },
                        )?,
                        false,
                    ),
                    EvalShare::Shared => match &shared {
                        Some(Ok(file)) => (file.clone(), true),
                        Some(Err(reason)) => return Err(WriteError::SharedEval(reason.clone())),
                        None => return Err(WriteError::SharedEval("not written".into())),
                    },
                };
                info!(
                    "saved {} training samples for {}",
                    site.train.len(),
                    site.site_name
                );
                Ok(ShardArtifact {
                    site_name: site.site_name.clone(),
                    train: train_file,
                    eval: eval_file,
                    shared_eval,
                })
            })
            .collect()
    }

    fn write_file(&self, name: &str, shard: &ShardFile) -> Result<ArtifactFile, WriteError> {
        let bytes = encode(shard)?;
        let path = self.staging.join(name);
        let partial = self.staging.join(format!("{}.tmp", name));
        let io_error = |source| WriteError::Io {
            path: path.clone(),
            source,
        };

        fs::write(&partial, &bytes).map_err(io_error)?;
        fs::rename(&partial, &path).map_err(|source| {
            let _ = fs::remove_file(&partial);
            io_error(source)
        })?;
        debug!("wrote {} ({} bytes)", path.display(), bytes.len());

        Ok(ArtifactFile {
            local_path: path.clone(),
            remote_name: name.to_string(),
            size: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        })
    }
}

/// Removes the staged files of an artifact. The shared evaluation file is left alone.
pub fn discard(artifact: &ShardArtifact) {
    let mut files = vec![&artifact.train];
    if !artifact.shared_eval {
        files.push(&artifact.eval);
    }
    for file in files {
        if let Err(err) = fs::remove_file(&file.local_path) {
            debug!("could not remove {}: {}", file.local_path.display(), err);
        }
    }
}
