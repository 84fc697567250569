//! Ansible INI inventories.
//!
//! ```text
//! [clients]
//! hospital-a ansible_host=10.0.0.11 ansible_user=fl
//! 10.0.0.12
//!
//! [clients:vars]
//! ansible_ssh_private_key_file=~/.ssh/fl_key
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use super::{HostEntry, InventoryError};

type Vars = BTreeMap<String, String>;

#[derive(Default)]
struct Group {
    hosts: Vec<(String, Vars)>,
    vars: Vars,
    children: Vec<String>,
}

enum Section {
    Hosts(String),
    Vars(String),
    Children(String),
}

/// Returns the hosts of `group`, including the hosts of its child groups, in file order.
pub(super) fn group_hosts(raw: &str, group: &str) -> Result<Vec<HostEntry>, InventoryError> {
    let groups = parse(raw)?;
    if !groups.contains_key(group) {
        return Err(InventoryError::MissingGroup(group.to_string()));
    }

    let inherited = groups
        .get("all")
        .map(|all| all.vars.clone())
        .unwrap_or_default();
    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    collect(&groups, group, &inherited, &mut visited, &mut entries);
    Ok(entries)
}

fn collect(
    groups: &HashMap<String, Group>,
    name: &str,
    inherited: &Vars,
    visited: &mut HashSet<String>,
    entries: &mut Vec<HostEntry>,
) {
    if !visited.insert(name.to_string()) {
        return;
    }
    let group = match groups.get(name) {
        Some(group) => group,
        None => return,
    };

    let mut scope = inherited.clone();
    scope.extend(group.vars.clone());
    for (alias, host_vars) in &group.hosts {
        let mut vars = scope.clone();
        vars.extend(host_vars.clone());
        entries.push(HostEntry {
            alias: alias.clone(),
            vars,
        });
    }
    for child in &group.children {
        collect(groups, child, &scope, visited, entries);
    }
}

fn parse(raw: &str) -> Result<HashMap<String, Group>, InventoryError> {
    let mut groups: HashMap<String, Group> = HashMap::new();
    let mut section = Section::Hosts("ungrouped".to_string());

    for (number, line) in raw.lines().enumerate().map(|(i, l)| (i + 1, l.trim())) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            let header = line
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .ok_or_else(|| syntax(number, "unterminated section header"))?;
            section = match header.split_once(':') {
                None => Section::Hosts(header.to_string()),
                Some((name, "vars")) => Section::Vars(name.to_string()),
                Some((name, "children")) => Section::Children(name.to_string()),
                Some((_, kind)) => {
                    return Err(syntax(number, &format!("unknown section kind {:?}", kind)))
                }
            };
            let name = match &section {
                Section::Hosts(name) | Section::Vars(name) | Section::Children(name) => name,
            };
            groups.entry(name.clone()).or_default();
            continue;
        }

        match &section {
            Section::Hosts(name) => {
                let mut tokens = split_host_line(line)
                    .ok_or_else(|| syntax(number, "unterminated quote"))?
                    .into_iter();
                let alias = tokens
                    .next()
                    .ok_or_else(|| syntax(number, "missing host"))?;
                let mut vars = Vars::new();
                for token in tokens {
                    let (key, value) = key_value(&token).ok_or_else(|| {
                        syntax(number, &format!("expected key=value, found {:?}", token))
                    })?;
                    vars.insert(key, value);
                }
                groups
                    .entry(name.clone())
                    .or_default()
                    .hosts
                    .push((alias, vars));
            }
            Section::Vars(name) => {
                let (key, value) = key_value(line)
                    .ok_or_else(|| syntax(number, "expected key=value in vars section"))?;
                groups.entry(name.clone()).or_default().vars.insert(key, value);
            }
            Section::Children(name) => {
                groups
                    .entry(name.clone())
                    .or_default()
                    .children
                    .push(line.to_string());
            }
        }
    }
    Ok(groups)
}

/// Splits a host line at whitespace outside of quotes. Quotes are kept for [`key_value`].
fn split_host_line(line: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut token = String::new();
    let mut quote = None;
    for c in line.chars() {
        match quote {
            Some(open) if c == open => {
                quote = None;
                token.push(c);
            }
            Some(_) => token.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                token.push(c);
            }
            None if c.is_whitespace() => {
                if !token.is_empty() {
                    tokens.push(std::mem::take(&mut token));
                }
            }
            None => token.push(c),
        }
    }
    if quote.is_some() {
        return None;
    }
    if !token.is_empty() {
        tokens.push(token);
    }
    Some(tokens)
}

fn key_value(token: &str) -> Option<(String, String)> {
    let (key, value) = token.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}

fn syntax(line: usize, reason: &str) -> InventoryError {
    InventoryError::Syntax {
        line,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_vars_may_contain_spaces() {
        let raw = "[clients]\na ansible_host=10.0.0.1 ansible_ssh_common_args='-o X=y' note=\"two words\"\n";
        let groups = parse(raw).unwrap();
        let (alias, vars) = &groups["clients"].hosts[0];
        assert_eq!(alias, "a");
        assert_eq!(vars["ansible_ssh_common_args"], "-o X=y");
        assert_eq!(vars["note"], "two words");

        assert!(matches!(
            parse("[clients]\na note='open\n"),
            Err(InventoryError::Syntax { line: 2, .. })
        ));
    }

    #[test]
    fn test_children_and_all_vars() {
        let raw = r#"
[all:vars]
ansible_user=root

[east]
a ansible_host=10.0.1.1

[west]
b ansible_host=10.0.2.1 ansible_user=admin

[clients:children]
east
west
"#;
        let entries = group_hosts(raw, "clients").unwrap();
        let aliases: Vec<_> = entries.iter().map(|e| e.alias.as_str()).collect();
        assert_eq!(aliases, vec!["a", "b"]);
        assert_eq!(entries[0].vars["ansible_user"], "root");
        assert_eq!(entries[1].vars["ansible_user"], "admin");
    }

    #[test]
    fn test_quoted_values_and_comments() {
        let raw = "# hosts\n[clients]\n; note\na ansible_host=\"10.0.0.1\"\n";
        let entries = group_hosts(raw, "clients").unwrap();
        assert_eq!(entries[0].vars["ansible_host"], "10.0.0.1");
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            group_hosts("[clients\na\n", "clients"),
            Err(InventoryError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            group_hosts("[clients]\na ansible_host\n", "clients"),
            Err(InventoryError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            group_hosts("[clients:meta]\n", "clients"),
            Err(InventoryError::Syntax { .. })
        ));
    }
}
