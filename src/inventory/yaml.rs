//! Ansible YAML inventories.
//!
//! ```text
//! all:
//!   children:
//!     clients:
//!       hosts:
//!         hospital-a:
//!           ansible_host: 10.0.0.11
//!       vars:
//!         ansible_user: fl
//! ```

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};

use super::{HostEntry, InventoryError};

type Vars = BTreeMap<String, String>;

/// Returns the hosts of `group`, including the hosts of its child groups, in file order.
pub(super) fn group_hosts(raw: &str, group: &str) -> Result<Vec<HostEntry>, InventoryError> {
    if raw.trim().is_empty() {
        return Err(InventoryError::MissingGroup(group.to_string()));
    }
    let root: Value = serde_yaml::from_str(raw)?;
    let root = match root.as_mapping() {
        Some(root) => root,
        None => return Err(InventoryError::MissingGroup(group.to_string())),
    };

    let (node, vars) = find_group(root, group, &Vars::new())
        .ok_or_else(|| InventoryError::MissingGroup(group.to_string()))?;
    let mut entries = Vec::new();
    collect(node, &vars, &mut entries);
    Ok(entries)
}

/// Searches the group tree depth first, carrying the variables of the enclosing groups.
fn find_group<'a>(groups: &'a Mapping, name: &str, inherited: &Vars) -> Option<(&'a Value, Vars)> {
    for (key, node) in groups {
        if key.as_str() == Some(name) {
            return Some((node, inherited.clone()));
        }
        let mut scope = inherited.clone();
        scope.extend(vars_of(node));
        if let Some(children) = child(node, "children").and_then(Value::as_mapping) {
            if let Some(found) = find_group(children, name, &scope) {
                return Some(found);
            }
        }
    }
    None
}

fn collect(node: &Value, inherited: &Vars, entries: &mut Vec<HostEntry>) {
    let mut scope = inherited.clone();
    scope.extend(vars_of(node));

    if let Some(hosts) = child(node, "hosts").and_then(Value::as_mapping) {
        for (alias, host_vars) in hosts {
            let alias = match scalar(alias) {
                Some(alias) => alias,
                None => continue,
            };
            let mut vars = scope.clone();
            if let Some(host_vars) = host_vars.as_mapping() {
                vars.extend(scalars(host_vars));
            }
            entries.push(HostEntry { alias, vars });
        }
    }
    if let Some(children) = child(node, "children").and_then(Value::as_mapping) {
        for (_, group) in children {
            collect(group, &scope, entries);
        }
    }
}

fn child<'a>(node: &'a Value, key: &str) -> Option<&'a Value> {
    node.as_mapping()?.get(&Value::String(key.to_string()))
}

fn vars_of(node: &Value) -> Vars {
    child(node, "vars")
        .and_then(Value::as_mapping)
        .map(scalars)
        .unwrap_or_default()
}

fn scalars(mapping: &Mapping) -> Vars {
    mapping
        .iter()
        .filter_map(|(key, value)| Some((scalar(key)?, scalar(value)?)))
        .collect()
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{resolve_str, InventoryFormat};

    const INVENTORY: &str = r#"
all:
  vars:
    ansible_user: root
  children:
    server:
      hosts:
        fl-server:
          ansible_host: 10.0.0.1
    clients:
      vars:
        ansible_port: 2222
      hosts:
        hospital-a:
          ansible_host: 10.0.0.11
          ansible_user: fl
        10.0.0.12:
"#;

    #[test]
    fn test_nested_group() {
        let entries = group_hosts(INVENTORY, "clients").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].alias, "hospital-a");
        assert_eq!(entries[0].vars["ansible_user"], "fl");
        assert_eq!(entries[0].vars["ansible_port"], "2222");
        assert_eq!(entries[1].alias, "10.0.0.12");
        assert_eq!(entries[1].vars["ansible_user"], "root");
    }

    #[test]
    fn test_resolve_yaml() {
        let participants = resolve_str(INVENTORY, InventoryFormat::Yaml, "clients").unwrap();
        assert_eq!(participants[0].site_name, "hospital-a");
        assert_eq!(participants[0].port, Some(2222));
        assert_eq!(participants[1].site_name, "site-2");
        assert_eq!(participants[1].host_address, "10.0.0.12");
    }

    #[test]
    fn test_top_level_group() {
        let raw = "clients:\n  hosts:\n    a:\n      ansible_host: 10.0.0.5\n";
        let entries = group_hosts(raw, "clients").unwrap();
        assert_eq!(entries[0].vars["ansible_host"], "10.0.0.5");
    }

    #[test]
    fn test_missing_group() {
        assert!(matches!(
            group_hosts(INVENTORY, "workers"),
            Err(InventoryError::MissingGroup(_))
        ));
        assert!(matches!(
            group_hosts("", "clients"),
            Err(InventoryError::MissingGroup(_))
        ));
        assert!(matches!(
            resolve_str("clients:\n  hosts: {}\n", InventoryFormat::Yaml, "clients"),
            Err(InventoryError::EmptyGroup(_))
        ));
    }
}
