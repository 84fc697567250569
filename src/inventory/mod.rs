//! Resolution of the static host inventory into an ordered list of [`Participant`]s.
//!
//! Two Ansible inventory flavours are understood: the INI layout (the default) and the YAML
//! layout, picked by file extension. Only the hosts of one group are resolved. The order of the
//! participants is the order of the hosts in the file, so site names derived from positions are
//! stable across runs.

mod ini;
mod yaml;

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Prefix of the site names given to hosts that carry no name of their own.
pub const SITE_NAME_PREFIX: &str = "site-";

/// Errors raised while resolving the inventory. All of them abort the run.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read inventory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("inventory line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("invalid YAML inventory: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("group [{0}] not found in inventory")]
    MissingGroup(String),
    #[error("group [{0}] has no hosts")]
    EmptyGroup(String),
    #[error("host {0} has no ansible_host and its name is not an address")]
    MissingAddress(String),
    #[error("host {host} has an invalid port {value:?}")]
    InvalidPort { host: String, value: String },
    #[error("site name {0:?} may only contain ASCII letters, digits, '.', '_' and '-'")]
    InvalidSiteName(String),
    #[error("host {host} has an invalid address {address:?}")]
    InvalidAddress { host: String, address: String },
    #[error("site name {0} is used by more than one host")]
    DuplicateSite(String),
    #[error("{requested} participants requested but the inventory lists {available}")]
    TooFewHosts { requested: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryFormat {
    Ini,
    Yaml,
}

impl InventoryFormat {
    /// `.yml` and `.yaml` files are YAML inventories, anything else is read as INI.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml") | Some("yaml") => InventoryFormat::Yaml,
            _ => InventoryFormat::Ini,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// How to authenticate against a host.
pub struct AuthRef {
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// A data holding site and the endpoint its shard is shipped to.
pub struct Participant {
    pub site_name: String,
    pub host_address: String,
    pub port: Option<u16>,
    pub auth: AuthRef,
}

/// A host as listed by the inventory, with group variables already folded into `vars`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HostEntry {
    pub alias: String,
    pub vars: BTreeMap<String, String>,
}

/// Reads the inventory at `path` and resolves the hosts of `group`.
///
/// # Errors
/// Fails if the file is missing or malformed, if the group is missing or empty, or if a host
/// lacks an address.
pub fn resolve(path: impl AsRef<Path>, group: &str) -> Result<Vec<Participant>, InventoryError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(InventoryError::NotFound(path.to_path_buf()));
    }
    info!("parsing inventory file: {}", path.display());
    let raw = fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let participants = resolve_str(&raw, InventoryFormat::from_path(path), group)?;
    info!(
        "found {} hosts in group [{}]",
        participants.len(),
        group
    );
    Ok(participants)
}

/// Resolves the hosts of `group` from inventory text.
pub fn resolve_str(
    raw: &str,
    format: InventoryFormat,
    group: &str,
) -> Result<Vec<Participant>, InventoryError> {
    let entries = match format {
        InventoryFormat::Ini => ini::group_hosts(raw, group)?,
        InventoryFormat::Yaml => yaml::group_hosts(raw, group)?,
    };
    if entries.is_empty() {
        return Err(InventoryError::EmptyGroup(group.to_string()));
    }
    into_participants(entries)
}

/// Keeps the first `count` participants.
pub fn select(
    mut participants: Vec<Participant>,
    count: Option<usize>,
) -> Result<Vec<Participant>, InventoryError> {
    if let Some(count) = count {
        if count > participants.len() {
            return Err(InventoryError::TooFewHosts {
                requested: count,
                available: participants.len(),
            });
        }
        participants.truncate(count);
    }
    Ok(participants)
}

/// Site names end up in file names, locally and remotely.
fn is_valid_site_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

fn into_participants(entries: Vec<HostEntry>) -> Result<Vec<Participant>, InventoryError> {
    let mut seen = HashSet::new();
    let mut participants = Vec::with_capacity(entries.len());

    for (position, HostEntry { alias, mut vars }) in entries.into_iter().enumerate() {
        let host_address = match vars.remove("ansible_host") {
            Some(address) => address,
            None if alias.parse::<IpAddr>().is_ok() => alias.clone(),
            None => return Err(InventoryError::MissingAddress(alias)),
        };
        let site_name = match vars.remove("site_name") {
            Some(name) => name,
            None if alias != host_address => alias.clone(),
            None => format!("{}{}", SITE_NAME_PREFIX, position + 1),
        };
        if !is_valid_site_name(&site_name) {
            return Err(InventoryError::InvalidSiteName(site_name));
        }
        if host_address.is_empty()
            || host_address.starts_with('-')
            || host_address.chars().any(|c| c.is_whitespace() || c == '@')
        {
            return Err(InventoryError::InvalidAddress {
                host: alias,
                address: host_address,
            });
        }
        if !seen.insert(site_name.clone()) {
            return Err(InventoryError::DuplicateSite(site_name));
        }
        let port = match vars.remove("ansible_port") {
            Some(value) => Some(value.parse::<u16>().map_err(|_| {
                InventoryError::InvalidPort {
                    host: alias.clone(),
                    value,
                }
            })?),
            None => None,
        };
        let auth = AuthRef {
            user: vars.remove("ansible_user"),
            identity_file: vars.remove("ansible_ssh_private_key_file").map(PathBuf::from),
        };
        debug!("resolved {} -> {}", site_name, host_address);
        participants.push(Participant {
            site_name,
            host_address,
            port,
            auth,
        });
    }
    Ok(participants)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
[server]
fl-server ansible_host=10.0.0.1

[clients]
hospital-a ansible_host=10.0.0.11 ansible_user=fl
10.0.0.12
hospital-c ansible_host=10.0.0.13 ansible_port=2222 site_name=site-berlin

[clients:vars]
ansible_ssh_private_key_file=~/.ssh/fl_key
ansible_user=ubuntu
"#;

    #[test]
    fn test_resolve_ini_group() {
        let participants = resolve_str(INVENTORY, InventoryFormat::Ini, "clients").unwrap();
        assert_eq!(participants.len(), 3);

        assert_eq!(participants[0].site_name, "hospital-a");
        assert_eq!(participants[0].host_address, "10.0.0.11");
        assert_eq!(participants[0].auth.user.as_deref(), Some("fl"));
        assert_eq!(
            participants[0].auth.identity_file,
            Some(PathBuf::from("~/.ssh/fl_key"))
        );

        assert_eq!(participants[1].site_name, "site-2");
        assert_eq!(participants[1].host_address, "10.0.0.12");
        assert_eq!(participants[1].auth.user.as_deref(), Some("ubuntu"));

        assert_eq!(participants[2].site_name, "site-berlin");
        assert_eq!(participants[2].port, Some(2222));
    }

    #[test]
    fn test_resolution_is_stable() {
        let first = resolve_str(INVENTORY, InventoryFormat::Ini, "clients").unwrap();
        let second = resolve_str(INVENTORY, InventoryFormat::Ini, "clients").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_and_empty_groups() {
        assert!(matches!(
            resolve_str(INVENTORY, InventoryFormat::Ini, "workers"),
            Err(InventoryError::MissingGroup(_))
        ));
        assert!(matches!(
            resolve_str("[clients]\n", InventoryFormat::Ini, "clients"),
            Err(InventoryError::EmptyGroup(_))
        ));
        assert!(matches!(
            resolve_str("", InventoryFormat::Ini, "clients"),
            Err(InventoryError::MissingGroup(_))
        ));
    }

    #[test]
    fn test_host_without_address() {
        let raw = "[clients]\nhospital-a ansible_user=fl\n";
        assert!(matches!(
            resolve_str(raw, InventoryFormat::Ini, "clients"),
            Err(InventoryError::MissingAddress(host)) if host == "hospital-a"
        ));
    }

    #[test]
    fn test_duplicate_site_names() {
        let raw = "[clients]\na ansible_host=10.0.0.1 site_name=x\nb ansible_host=10.0.0.2 site_name=x\n";
        assert!(matches!(
            resolve_str(raw, InventoryFormat::Ini, "clients"),
            Err(InventoryError::DuplicateSite(name)) if name == "x"
        ));
    }

    #[test]
    fn test_invalid_port() {
        let raw = "[clients]\na ansible_host=10.0.0.1 ansible_port=ssh\n";
        assert!(matches!(
            resolve_str(raw, InventoryFormat::Ini, "clients"),
            Err(InventoryError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_names_and_addresses_are_checked() {
        let raw = "[clients]\na ansible_host=10.0.0.1 site_name=../etc\n";
        assert!(matches!(
            resolve_str(raw, InventoryFormat::Ini, "clients"),
            Err(InventoryError::InvalidSiteName(_))
        ));
        let raw = "[clients]\na ansible_host=-oProxyCommand=x\n";
        assert!(matches!(
            resolve_str(raw, InventoryFormat::Ini, "clients"),
            Err(InventoryError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_select() {
        let participants = resolve_str(INVENTORY, InventoryFormat::Ini, "clients").unwrap();
        assert_eq!(select(participants.clone(), None).unwrap().len(), 3);
        assert_eq!(select(participants.clone(), Some(2)).unwrap().len(), 2);
        assert!(matches!(
            select(participants, Some(4)),
            Err(InventoryError::TooFewHosts { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            resolve("/nonexistent/inventory.ini", "clients"),
            Err(InventoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            InventoryFormat::from_path(Path::new("hosts.yaml")),
            InventoryFormat::Yaml
        );
        assert_eq!(
            InventoryFormat::from_path(Path::new("inventory.ini")),
            InventoryFormat::Ini
        );
        assert_eq!(
            InventoryFormat::from_path(Path::new("hosts")),
            InventoryFormat::Ini
        );
    }
}
