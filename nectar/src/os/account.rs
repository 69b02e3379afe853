use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

/// One `passwd` entry. Immutable after load.
#[derive(Debug, Clone)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    /// Literal password, or `*` meaning accept anything.
    pub password: String,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub gid: u32,
    pub name: String,
}

/// Users and groups parsed from classic colon-separated text files, indexed
/// for O(1) lookup by name and by id.
#[derive(Debug, Default)]
pub struct AccountStore {
    by_uid: HashMap<u32, Arc<User>>,
    by_name: HashMap<String, Arc<User>>,
    groups: HashMap<u32, Group>,
}

impl AccountStore {
    pub fn load(passwd_file: &Path, group_file: &Path) -> Result<Self> {
        let mut store = AccountStore::default();
        let passwd = std::fs::read_to_string(passwd_file)
            .with_context(|| format!("failed to read {}", passwd_file.display()))?;
        store.parse_passwd(&passwd);
        let group = std::fs::read_to_string(group_file)
            .with_context(|| format!("failed to read {}", group_file.display()))?;
        store.parse_group(&group);
        Ok(store)
    }

    fn parse_passwd(&mut self, text: &str) {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                warn!(line = lineno + 1, "malformed passwd entry, skipping");
                continue;
            }
            let (uid, gid) = match (fields[2].parse(), fields[3].parse()) {
                (Ok(u), Ok(g)) => (u, g),
                _ => {
                    warn!(line = lineno + 1, "bad uid/gid in passwd entry, skipping");
                    continue;
                }
            };
            let user = Arc::new(User {
                uid,
                gid,
                name: fields[0].to_string(),
                password: fields[1].to_string(),
                gecos: fields[4].to_string(),
                home: fields[5].to_string(),
                shell: fields[6].to_string(),
            });
            self.by_name.insert(user.name.clone(), Arc::clone(&user));
            self.by_uid.insert(uid, user);
        }
    }

    fn parse_group(&mut self, text: &str) {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                warn!(line = lineno + 1, "malformed group entry, skipping");
                continue;
            }
            let gid = match fields[2].parse() {
                Ok(g) => g,
                Err(_) => {
                    warn!(line = lineno + 1, "bad gid in group entry, skipping");
                    continue;
                }
            };
            self.groups.insert(
                gid,
                Group {
                    gid,
                    name: fields[0].to_string(),
                },
            );
        }
    }

    pub fn user_by_name(&self, name: &str) -> Option<&Arc<User>> {
        self.by_name.get(name)
    }

    pub fn user_by_uid(&self, uid: u32) -> Option<&Arc<User>> {
        self.by_uid.get(&uid)
    }

    pub fn group_by_gid(&self, gid: u32) -> Option<&Group> {
        self.groups.get(&gid)
    }

    /// Name for `ls -l` style rendering; unknown ids fall back to `root`,
    /// matching what the filesystem image shows for unmapped owners.
    pub fn user_name(&self, uid: u32) -> String {
        self.by_uid
            .get(&uid)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| "root".to_string())
    }

    pub fn group_name(&self, gid: u32) -> String {
        self.groups
            .get(&gid)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| "root".to_string())
    }

    /// The account a successful login runs as. Logins the image knows
    /// nothing about get a synthesized user with a default home.
    pub fn user_or_synthesized(&self, name: &str) -> Arc<User> {
        if let Some(user) = self.by_name.get(name) {
            return Arc::clone(user);
        }
        Arc::new(User {
            uid: 1000,
            gid: 1000,
            name: name.to_string(),
            password: "*".to_string(),
            gecos: String::new(),
            home: format!("/home/{name}"),
            shell: "/bin/bash".to_string(),
        })
    }

    /// Password acceptance rule: known user with a matching (or wildcard)
    /// password, or any credentials at all when `allow_random` is set.
    pub fn check_password(&self, name: &str, offered: &str, allow_random: bool) -> bool {
        if let Some(user) = self.by_name.get(name) {
            if user.password == "*" || user.password == offered {
                return true;
            }
        }
        allow_random
    }
}
