//! In-process cluster backend.
//!
//! [`LocalCluster`] is a shared registry; every [`LocalClusterManager`]
//! created from it sees the same multi-maps and membership. Intended for
//! tests and single-process deployments where several buses run side by
//! side; it is not a network-backed cluster.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::choosable::ChoosableSet;
use crate::manager::{AsyncMultiMap, ClusterError, ClusterManager, NodeListener};
use crate::node::NodeId;

type ListenerSlot = Arc<Mutex<Option<Arc<dyn NodeListener>>>>;

/// Shared state behind every manager of one local cluster.
struct LocalClusterShared {
    maps: Mutex<HashMap<String, Arc<LocalMultiMap>>>,
    members: Mutex<HashMap<String, ListenerSlot>>,
}

/// A process-local cluster. Hand one of these to every bus that should see
/// the others, via [`LocalCluster::manager`].
#[derive(Clone)]
pub struct LocalCluster {
    shared: Arc<LocalClusterShared>,
}

impl LocalCluster {
    /// Create an empty local cluster.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LocalClusterShared {
                maps: Mutex::new(HashMap::new()),
                members: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a manager joined to this cluster's registry.
    pub fn manager(&self) -> Arc<LocalClusterManager> {
        Arc::new(LocalClusterManager {
            shared: self.shared.clone(),
            member_id: Uuid::new_v4().to_string(),
            active: AtomicBool::new(false),
            listener: Arc::new(Mutex::new(None)),
        })
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One member of a [`LocalCluster`].
pub struct LocalClusterManager {
    shared: Arc<LocalClusterShared>,
    member_id: String,
    active: AtomicBool,
    listener: ListenerSlot,
}

impl LocalClusterManager {
    fn notify_others(&self, added: bool) {
        let members = self.shared.members.lock().unwrap();
        for (id, slot) in members.iter() {
            if id == &self.member_id {
                continue;
            }
            let listener = slot.lock().unwrap().clone();
            if let Some(listener) = listener {
                if added {
                    listener.node_added(&self.member_id);
                } else {
                    listener.node_left(&self.member_id);
                }
            }
        }
    }
}

#[async_trait]
impl ClusterManager for LocalClusterManager {
    async fn join(&self) -> Result<(), ClusterError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared
            .members
            .lock()
            .unwrap()
            .insert(self.member_id.clone(), self.listener.clone());
        self.notify_others(true);
        Ok(())
    }

    async fn leave(&self) -> Result<(), ClusterError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.members.lock().unwrap().remove(&self.member_id);
        self.notify_others(false);
        Ok(())
    }

    fn multi_map(&self, name: &str) -> Result<Arc<dyn AsyncMultiMap>, ClusterError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(ClusterError::NotJoined);
        }
        let mut maps = self.shared.maps.lock().unwrap();
        let map = maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LocalMultiMap::new()))
            .clone();
        Ok(map)
    }

    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    fn members(&self) -> Vec<String> {
        self.shared.members.lock().unwrap().keys().cloned().collect()
    }

    fn set_node_listener(&self, listener: Arc<dyn NodeListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }
}

/// In-memory multi-map shared by all members of one local cluster.
pub struct LocalMultiMap {
    state: Mutex<MapState>,
}

#[derive(Default)]
struct MapState {
    entries: HashMap<String, Vec<NodeId>>,
    /// Per-key rotation cursor so successive `get` snapshots start their
    /// round-robin on successive members.
    cursors: HashMap<String, usize>,
}

impl LocalMultiMap {
    fn new() -> Self {
        Self {
            state: Mutex::new(MapState::default()),
        }
    }
}

#[async_trait]
impl AsyncMultiMap for LocalMultiMap {
    async fn add(&self, key: &str, value: NodeId) -> Result<(), ClusterError> {
        self.state
            .lock()
            .unwrap()
            .entries
            .entry(key.to_string())
            .or_default()
            .push(value);
        Ok(())
    }

    async fn remove(&self, key: &str, value: &NodeId) -> Result<bool, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let Some(values) = state.entries.get_mut(key) else {
            return Ok(false);
        };
        let Some(idx) = values.iter().position(|v| v == value) else {
            return Ok(false);
        };
        values.remove(idx);
        if values.is_empty() {
            state.entries.remove(key);
            state.cursors.remove(key);
        }
        Ok(true)
    }

    async fn remove_all_for_value(&self, value: &NodeId) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let MapState { entries, cursors } = &mut *state;
        entries.retain(|_, values| {
            values.retain(|v| v != value);
            !values.is_empty()
        });
        cursors.retain(|k, _| entries.contains_key(k));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ChoosableSet<NodeId>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let Some(values) = state.entries.get(key) else {
            return Ok(ChoosableSet::empty());
        };
        // The map may hold duplicate occurrences; readers see a set.
        let mut snapshot: Vec<NodeId> = Vec::with_capacity(values.len());
        for v in values {
            if !snapshot.contains(v) {
                snapshot.push(v.clone());
            }
        }
        let cursor = state.cursors.entry(key.to_string()).or_insert(0);
        let start = *cursor;
        *cursor = cursor.wrapping_add(1);
        Ok(ChoosableSet::with_start(snapshot, start))
    }
}
