use crate::types::Principal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Which executables each principal may launch.
///
/// Internally it's a HashMap of principal -> allow-list. An allow-list entry is either an
/// exact executable path or a directory; a directory entry allows everything beneath it.
///
/// The table is loaded once at startup and never mutated afterwards, so it is shared
/// without locking.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    allowed: HashMap<Principal, Vec<PathBuf>>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allowed executable path or directory prefix for `principal`.
    pub fn allow(&mut self, principal: impl Into<Principal>, path: impl Into<PathBuf>) {
        self.allowed
            .entry(principal.into())
            .or_default()
            .push(path.into());
    }

    pub fn allow_list(&self, principal: &str) -> Option<&[PathBuf]> {
        self.allowed.get(principal).map(Vec::as_slice)
    }
}

impl<P, I, S> FromIterator<(P, I)> for PolicyTable
where
    P: Into<Principal>,
    I: IntoIterator<Item = S>,
    S: Into<PathBuf>,
{
    fn from_iter<T: IntoIterator<Item = (P, I)>>(iter: T) -> Self {
        let mut table = PolicyTable::new();
        for (principal, paths) in iter {
            let principal = principal.into();
            for path in paths {
                table.allow(principal.clone(), path);
            }
        }
        table
    }
}

/// Whether `principal` may run `executable` under `policy`.
///
/// Matches either an exact allow-list entry or a directory entry that `executable` lives
/// beneath. Paths containing `..` never match a directory entry.
pub fn is_allowed(principal: &str, executable: &Path, policy: &PolicyTable) -> bool {
    let allow_list = match policy.allow_list(principal) {
        Some(list) => list,
        None => return false,
    };
    let escapes = executable
        .components()
        .any(|c| matches!(c, Component::ParentDir));

    allow_list.iter().any(|entry| {
        if entry == executable {
            return true;
        }
        // Path::starts_with compares whole components, so "/usr/bin" does not cover "/usr/binx".
        !escapes && executable.starts_with(entry)
    })
}
