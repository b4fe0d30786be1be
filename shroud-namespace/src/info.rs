//! Namespace membership introspection

use shroud_core::{Error, ProcessId, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::kind::{NamespaceKind, NamespaceSet};

/// Namespace identifiers of one process, as read from `/proc/<pid>/ns`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    ids: BTreeMap<NamespaceKind, String>,
}

impl NamespaceInfo {
    /// Namespaces of the calling process
    ///
    /// # Errors
    /// Returns error if `/proc/self/ns` cannot be read
    pub fn current() -> Result<Self> {
        Self::read("self")
    }

    /// Namespaces of a specific process
    ///
    /// # Errors
    /// Returns error if the process does not exist
    pub fn for_pid(pid: ProcessId) -> Result<Self> {
        Self::read(&pid.to_string())
    }

    fn read(pid: &str) -> Result<Self> {
        let base_path = format!("/proc/{pid}/ns");
        if !Path::new(&base_path).exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{base_path} does not exist"),
            )));
        }

        // Entries we may not inspect (another user's process, old kernels
        // without time namespaces) are left out
        let ids = NamespaceKind::ALL
            .into_iter()
            .filter_map(|kind| {
                fs::read_link(kind.proc_path(pid))
                    .ok()
                    .map(|link| (kind, link.to_string_lossy().into_owned()))
            })
            .collect();

        Ok(Self { ids })
    }

    /// Raw identifier, e.g. `pid:[4026531836]`
    #[must_use]
    pub fn get(&self, kind: NamespaceKind) -> Option<&str> {
        self.ids.get(&kind).map(String::as_str)
    }

    /// Inode number of a namespace
    #[must_use]
    pub fn inode(&self, kind: NamespaceKind) -> Option<u64> {
        let id = self.get(kind)?;
        let start = id.find('[')? + 1;
        let end = id.rfind(']')?;
        id.get(start..end)?.parse().ok()
    }

    /// Kinds readable for both processes whose namespaces differ
    #[must_use]
    pub fn differing(&self, other: &Self) -> NamespaceSet {
        NamespaceKind::ALL
            .into_iter()
            .filter(|kind| match (self.get(*kind), other.get(*kind)) {
                (Some(mine), Some(theirs)) => mine != theirs,
                _ => false,
            })
            .collect()
    }

    /// Check if in different namespace than init (PID 1)
    ///
    /// # Errors
    /// Returns error if cannot read namespaces
    pub fn is_isolated(&self) -> Result<bool> {
        let init_ns = Self::for_pid(ProcessId::from_raw(1))?;
        Ok(!self.differing(&init_ns).is_empty())
    }
}

impl std::fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Namespace Info:")?;
        for (kind, id) in &self.ids {
            let label = format!("{}:", kind.proc_name().to_uppercase());
            writeln!(f, "  {label:<8}{id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(entries: &[(NamespaceKind, &str)]) -> NamespaceInfo {
        NamespaceInfo {
            ids: entries
                .iter()
                .map(|(kind, id)| (*kind, (*id).to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_current_namespaces() {
        let info = NamespaceInfo::current().unwrap();
        assert!(info.get(NamespaceKind::Pid).is_some());
        assert!(info.inode(NamespaceKind::Net).is_some());
    }

    #[test]
    fn test_current_matches_own_pid() {
        let by_self = NamespaceInfo::current().unwrap();
        let by_pid = NamespaceInfo::for_pid(ProcessId::current()).unwrap();
        assert!(by_self.differing(&by_pid).is_empty());
    }

    #[test]
    fn test_missing_process() {
        let missing = ProcessId::from_raw(i32::MAX);
        assert!(NamespaceInfo::for_pid(missing).is_err());
    }

    #[test]
    fn test_inode_parsing() {
        let info = info(&[(NamespaceKind::Pid, "pid:[4026531836]")]);
        assert_eq!(info.inode(NamespaceKind::Pid), Some(4_026_531_836));
        assert_eq!(info.inode(NamespaceKind::Net), None);
    }

    #[test]
    fn test_differing() {
        let host = info(&[
            (NamespaceKind::Pid, "pid:[1]"),
            (NamespaceKind::Net, "net:[2]"),
            (NamespaceKind::Uts, "uts:[3]"),
        ]);
        let boxed = info(&[
            (NamespaceKind::Pid, "pid:[10]"),
            (NamespaceKind::Net, "net:[2]"),
        ]);

        let differing = boxed.differing(&host);
        assert!(differing.contains(NamespaceKind::Pid));
        assert!(!differing.contains(NamespaceKind::Net));
        assert!(!differing.contains(NamespaceKind::Uts));
    }

    #[test]
    fn test_namespace_info_display() {
        let info = info(&[
            (NamespaceKind::Pid, "pid:[4026531836]"),
            (NamespaceKind::Net, "net:[4026531905]"),
        ]);

        let display = format!("{info}");
        assert!(display.contains("PID:"));
        assert!(display.contains("NET:"));
    }
}
