//! User/group name resolution seam (spec.md §1: "the user/group name
//! resolver" is a stated external interface, not redesigned), used by the
//! Accumulator's UID/GID field interpretation (spec.md §4.3).
//!
//! Grounded in `UserDB.cpp`: the original loads the whole `/etc/passwd` and
//! `/etc/group` tables into memory rather than querying per-field, since a
//! busy host can generate thousands of UID lookups per second.

use std::collections::HashMap;
use std::fs;
use std::sync::RwLock;

pub trait NameResolver: Send + Sync {
    fn resolve_user(&self, uid: u32) -> Option<String>;
    fn resolve_group(&self, gid: u32) -> Option<String>;
}

/// Resolver that never resolves anything; used in tests and as a safe
/// fallback if `/etc/passwd`/`/etc/group` cannot be read.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNameResolver;

impl NameResolver for NullNameResolver {
    fn resolve_user(&self, _uid: u32) -> Option<String> {
        None
    }

    fn resolve_group(&self, _gid: u32) -> Option<String> {
        None
    }
}

/// Resolver backed by a cached parse of `/etc/passwd` and `/etc/group`.
///
/// The cache is refreshed by calling [`PasswdNameResolver::reload`]; callers
/// typically do this on a timer, not per-lookup, matching the original's
/// behavior of accepting a bounded staleness window in exchange for avoiding
/// per-event syscalls.
pub struct PasswdNameResolver {
    users: RwLock<HashMap<u32, String>>,
    groups: RwLock<HashMap<u32, String>>,
}

impl PasswdNameResolver {
    pub fn new() -> Self {
        let resolver = PasswdNameResolver {
            users: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
        };
        resolver.reload();
        resolver
    }

    pub fn reload(&self) {
        if let Ok(users) = parse_passwd("/etc/passwd") {
            *self.users.write().unwrap() = users;
        } else {
            tracing::warn!("failed to read /etc/passwd; user resolution degraded");
        }
        if let Ok(groups) = parse_group("/etc/group") {
            *self.groups.write().unwrap() = groups;
        } else {
            tracing::warn!("failed to read /etc/group; group resolution degraded");
        }
    }
}

impl Default for PasswdNameResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NameResolver for PasswdNameResolver {
    fn resolve_user(&self, uid: u32) -> Option<String> {
        self.users.read().unwrap().get(&uid).cloned()
    }

    fn resolve_group(&self, gid: u32) -> Option<String> {
        self.groups.read().unwrap().get(&gid).cloned()
    }
}

fn parse_passwd(path: &str) -> std::io::Result<HashMap<u32, String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let uid: u32 = fields.nth(1)?.parse().ok()?;
            Some((uid, name.to_string()))
        })
        .collect())
}

fn parse_group(path: &str) -> std::io::Result<HashMap<u32, String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let gid: u32 = fields.nth(1)?.parse().ok()?;
            Some((gid, name.to_string()))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_passwd_style_lines() {
        let text = "root:x:0:0:root:/root:/bin/bash\nauoms:x:1001:1001::/nonexistent:/sbin/nologin\n";
        let map: HashMap<u32, String> = text
            .lines()
            .filter_map(|line| {
                let mut f = line.split(':');
                let name = f.next()?;
                let uid: u32 = f.nth(1)?.parse().ok()?;
                Some((uid, name.to_string()))
            })
            .collect();
        assert_eq!(map.get(&0), Some(&"root".to_string()));
        assert_eq!(map.get(&1001), Some(&"auoms".to_string()));
    }

    #[test]
    fn null_resolver_resolves_nothing() {
        let resolver = NullNameResolver;
        assert_eq!(resolver.resolve_user(0), None);
        assert_eq!(resolver.resolve_group(0), None);
    }
}
