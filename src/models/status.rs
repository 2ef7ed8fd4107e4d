use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KubeStatus {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "not_ready")]
    NotReady,
    #[serde(rename = "unknown")]
    Unknown,
}

/// Helm release state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    #[serde(rename = "pending-install")]
    PendingInstall,
    #[serde(rename = "pending-upgrade")]
    PendingUpgrade,
    #[serde(rename = "pending-rollback")]
    PendingRollback,
    #[serde(rename = "not-installed")]
    NotInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatusEntry {
    pub vmid: u32,
    pub status: VmStatus,
}

/// Kubernetes readiness keyed by `<cluster>-<node>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeStatusEntry {
    pub name: String,
    pub status: KubeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatusEntry {
    pub id: String,
    pub status: AppStatus,
}

/// Latest fetched state of one status facet. Built whole from a poll result
/// and never patched in place.
#[derive(Debug, Clone)]
pub struct StatusSnapshot<K, V> {
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash, V: Copy> StatusSnapshot<K, V> {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn lookup<Q>(&self, key: &Q) -> Observed<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        match self.entries.get(key) {
            Some(v) => Observed::Known(*v),
            None => Observed::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Eq + Hash, V: Copy> Default for StatusSnapshot<K, V> {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<VmStatusEntry>> for StatusSnapshot<u32, VmStatus> {
    fn from(entries: Vec<VmStatusEntry>) -> Self {
        Self::from_entries(entries.into_iter().map(|e| (e.vmid, e.status)))
    }
}

impl From<Vec<KubeStatusEntry>> for StatusSnapshot<String, KubeStatus> {
    fn from(entries: Vec<KubeStatusEntry>) -> Self {
        Self::from_entries(entries.into_iter().map(|e| (e.name, e.status)))
    }
}

impl From<Vec<AppStatusEntry>> for StatusSnapshot<String, AppStatus> {
    fn from(entries: Vec<AppStatusEntry>) -> Self {
        Self::from_entries(entries.into_iter().map(|e| (e.id, e.status)))
    }
}

/// Result of joining an entity with a snapshot. A missing entry means the
/// facet has not been observed yet, not that the entity is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed<V> {
    Unknown,
    Known(V),
}

impl<V: Serialize> Serialize for Observed<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Observed::Known(v) => v.serialize(serializer),
            Observed::Unknown => serializer.serialize_str("unknown"),
        }
    }
}
