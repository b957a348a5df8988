// src/core/registry/mod.rs

//! The cluster group registry: which servers form each data group, who is
//! master, and every member's status and data version. Mutations are rare;
//! a single reader-writer lock guards the core, with the fast path for this
//! server's own data-version counters on atomics.

pub mod persist;

use crate::config::{Config, ServerEntry};
use crate::core::SliceStoreError;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use strum_macros::{Display, FromRepr};
use tracing::{info, warn};

/// The lifecycle of a group member, in catch-up order. Only `Active`
/// servers serve reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ServerStatus {
    Init = 0,
    Rebuilding = 1,
    Offline = 2,
    Online = 3,
    Syncing = 4,
    Active = 5,
}

impl ServerStatus {
    pub fn from_code(code: u8) -> Result<Self, SliceStoreError> {
        Self::from_repr(code)
            .ok_or_else(|| SliceStoreError::Corrupt(format!("unknown server status {code}")))
    }
}

/// One server's standing within one data group.
#[derive(Debug, Clone, Copy)]
pub struct GroupMember {
    pub server_id: u32,
    pub status: ServerStatus,
    pub is_master: bool,
    pub is_preseted: bool,
    pub data_version: u64,
    pub confirmed_version: u64,
}

/// One data group and its replica set.
#[derive(Debug, Clone)]
pub struct DataGroup {
    pub group_id: u32,
    pub members: Vec<GroupMember>,
}

impl DataGroup {
    pub fn member(&self, server_id: u32) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.server_id == server_id)
    }

    fn member_mut(&mut self, server_id: u32) -> Option<&mut GroupMember> {
        self.members.iter_mut().find(|m| m.server_id == server_id)
    }

    pub fn master(&self) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.is_master)
    }
}

/// A row of `cluster_stat` output.
#[derive(Debug, Clone, Copy)]
pub struct ClusterStatRow {
    pub group_id: u32,
    pub server_id: u32,
    pub is_preseted: bool,
    pub is_master: bool,
    pub status: ServerStatus,
    pub data_version: u64,
}

#[derive(Debug)]
struct RegistryCore {
    groups: BTreeMap<u32, DataGroup>,
    is_leader: bool,
}

/// The registry proper. Cheap lookups take the read lock; status and
/// membership changes take the write lock and bump the change version so
/// the persistence task notices.
pub struct ClusterRegistry {
    core: RwLock<RegistryCore>,
    servers: HashMap<u32, ServerEntry>,
    pub my_server_id: u32,
    change_version: AtomicU64,
    /// This server's own per-group data-version counters; the worker fast
    /// path increments these without touching the core lock.
    my_versions: DashMap<u32, Arc<AtomicU64>>,
}

impl ClusterRegistry {
    /// Builds the registry from the configured topology. All members start
    /// `Init`; preset master hints are recorded but not yet applied.
    pub fn from_config(config: &Config) -> Self {
        let mut groups = BTreeMap::new();
        let my_versions = DashMap::new();

        for group in &config.groups {
            let members = group
                .servers
                .iter()
                .map(|&server_id| GroupMember {
                    server_id,
                    status: ServerStatus::Init,
                    is_master: false,
                    is_preseted: group.preseted_master == Some(server_id),
                    data_version: 0,
                    confirmed_version: 0,
                })
                .collect();
            groups.insert(
                group.group_id,
                DataGroup {
                    group_id: group.group_id,
                    members,
                },
            );
            if group.servers.contains(&config.server_id) {
                my_versions.insert(group.group_id, Arc::new(AtomicU64::new(0)));
            }
        }

        Self {
            core: RwLock::new(RegistryCore {
                groups,
                is_leader: false,
            }),
            servers: config
                .servers
                .iter()
                .map(|s| (s.id, s.clone()))
                .collect(),
            my_server_id: config.server_id,
            change_version: AtomicU64::new(1),
            my_versions,
        }
    }

    // --- change tracking ---

    pub fn change_version(&self) -> u64 {
        self.change_version.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.change_version.fetch_add(1, Ordering::AcqRel);
    }

    // --- topology lookups ---

    pub fn server_entry(&self, server_id: u32) -> Option<&ServerEntry> {
        self.servers.get(&server_id)
    }

    pub fn group_ids(&self) -> Vec<u32> {
        self.core.read().groups.keys().copied().collect()
    }

    /// The ids of the groups this server is a member of.
    pub fn my_group_ids(&self) -> Vec<u32> {
        self.my_versions.iter().map(|e| *e.key()).collect()
    }

    pub fn group(&self, group_id: u32) -> Option<DataGroup> {
        self.core.read().groups.get(&group_id).cloned()
    }

    // --- leader role ---

    pub fn is_leader(&self) -> bool {
        self.core.read().is_leader
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.core.write().is_leader = is_leader;
        self.bump();
    }

    /// The cluster-wide leader, as far as this server knows. The election
    /// protocol is external; we can only answer when we are the leader.
    pub fn get_leader(&self) -> Result<ServerEntry, SliceStoreError> {
        if self.is_leader() {
            return Ok(self.servers[&self.my_server_id].clone());
        }
        Err(SliceStoreError::NoServer("no leader elected yet".into()))
    }

    // --- master bookkeeping ---

    pub fn get_master(&self, group_id: u32) -> Result<(u32, ServerEntry), SliceStoreError> {
        let core = self.core.read();
        let group = core
            .groups
            .get(&group_id)
            .ok_or_else(|| SliceStoreError::NotFound(format!("data group {group_id} not exist")))?;
        let master = group
            .master()
            .ok_or_else(|| SliceStoreError::NoServer(format!("group {group_id} has no master")))?;
        Ok((master.server_id, self.servers[&master.server_id].clone()))
    }

    /// Designates the group's master, clearing the flag from every other
    /// member. At most one master per group can ever be observed.
    pub fn set_master(&self, group_id: u32, server_id: u32) -> Result<(), SliceStoreError> {
        let mut core = self.core.write();
        let group = core
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| SliceStoreError::NotFound(format!("data group {group_id} not exist")))?;
        if group.member(server_id).is_none() {
            return Err(SliceStoreError::NotFound(format!(
                "server {server_id} is not a member of group {group_id}"
            )));
        }
        for member in &mut group.members {
            member.is_master = member.server_id == server_id;
        }
        drop(core);
        self.bump();
        info!("group {}: master is now server {}", group_id, server_id);
        Ok(())
    }

    pub fn am_master(&self, group_id: u32) -> bool {
        self.core
            .read()
            .groups
            .get(&group_id)
            .and_then(|g| g.master())
            .is_some_and(|m| m.server_id == self.my_server_id)
    }

    /// Member ids of the group other than the master.
    pub fn slaves_of(&self, group_id: u32) -> Vec<u32> {
        self.core
            .read()
            .groups
            .get(&group_id)
            .map(|g| {
                g.members
                    .iter()
                    .filter(|m| !m.is_master)
                    .map(|m| m.server_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    // --- status and versions ---

    pub fn status_of(&self, group_id: u32, server_id: u32) -> Option<ServerStatus> {
        self.core
            .read()
            .groups
            .get(&group_id)
            .and_then(|g| g.member(server_id))
            .map(|m| m.status)
    }

    pub fn set_status(&self, group_id: u32, server_id: u32, status: ServerStatus) {
        let mut core = self.core.write();
        if let Some(member) = core
            .groups
            .get_mut(&group_id)
            .and_then(|g| g.member_mut(server_id))
            && member.status != status
        {
            info!(
                "group {}: server {} {} -> {}",
                group_id, server_id, member.status, status
            );
            member.status = status;
            drop(core);
            self.bump();
        }
    }

    /// Records a peer's replayed data version (from replication acks).
    pub fn set_data_version(&self, group_id: u32, server_id: u32, data_version: u64) {
        if server_id == self.my_server_id {
            self.set_my_data_version(group_id, data_version);
            return;
        }
        let mut core = self.core.write();
        if let Some(member) = core
            .groups
            .get_mut(&group_id)
            .and_then(|g| g.member_mut(server_id))
            && member.data_version < data_version
        {
            member.data_version = data_version;
            drop(core);
            self.bump();
        }
    }

    pub fn set_confirmed_version(&self, group_id: u32, server_id: u32, confirmed: u64) {
        let mut core = self.core.write();
        if let Some(member) = core
            .groups
            .get_mut(&group_id)
            .and_then(|g| g.member_mut(server_id))
            && member.confirmed_version < confirmed
        {
            member.confirmed_version = confirmed;
        }
    }

    fn my_version_counter(&self, group_id: u32) -> Option<Arc<AtomicU64>> {
        self.my_versions.get(&group_id).map(|v| v.clone())
    }

    /// Assigns the next data version for a mutation this master accepts.
    pub fn next_data_version(&self, group_id: u32) -> Result<u64, SliceStoreError> {
        self.my_version_counter(group_id)
            .map(|v| v.fetch_add(1, Ordering::AcqRel) + 1)
            .ok_or_else(|| {
                SliceStoreError::NotFound(format!("not a member of data group {group_id}"))
            })
    }

    pub fn my_data_version(&self, group_id: u32) -> u64 {
        self.my_version_counter(group_id)
            .map(|v| v.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Fast-forwards this server's own version counter (binlog recovery and
    /// replicated applies).
    pub fn set_my_data_version(&self, group_id: u32, data_version: u64) {
        if let Some(counter) = self.my_version_counter(group_id) {
            counter.fetch_max(data_version, Ordering::AcqRel);
        }
    }

    // --- read-side lookups ---

    /// Round-robin over `Active` members starting at a random index,
    /// walking the list until an active one is found.
    pub fn get_readable_server(&self, group_id: u32) -> Result<(u32, ServerEntry), SliceStoreError> {
        let core = self.core.read();
        let group = core
            .groups
            .get(&group_id)
            .ok_or_else(|| SliceStoreError::NotFound(format!("data group {group_id} not exist")))?;

        let count = group.members.len();
        let start = rand::thread_rng().gen_range(0..count);
        for walk in 0..count {
            let member = &group.members[(start + walk) % count];
            if member.status == ServerStatus::Active {
                return Ok((member.server_id, self.servers[&member.server_id].clone()));
            }
        }
        Err(SliceStoreError::NoServer(format!(
            "group {group_id} has no active server"
        )))
    }

    /// Stat rows for one group or the whole registry. This server's own
    /// rows carry the live counter value rather than the persisted one.
    pub fn cluster_stat(&self, group_filter: Option<u32>) -> Vec<ClusterStatRow> {
        let core = self.core.read();
        let mut rows = Vec::new();
        for group in core.groups.values() {
            if group_filter.is_some_and(|id| id != group.group_id) {
                continue;
            }
            for member in &group.members {
                let data_version = if member.server_id == self.my_server_id {
                    self.my_data_version(group.group_id)
                } else {
                    member.data_version
                };
                rows.push(ClusterStatRow {
                    group_id: group.group_id,
                    server_id: member.server_id,
                    is_preseted: member.is_preseted,
                    is_master: member.is_master,
                    status: member.status,
                    data_version,
                });
            }
        }
        rows
    }

    // --- persistence ---

    /// Loads `data_group.info` if present. `Syncing`/`Active` statuses
    /// demote to `Offline` pending reconnection. Returns the previous
    /// shutdown time, derived from the file's mtime.
    pub fn load(&self, data_dir: &Path) -> Result<Option<SystemTime>, SliceStoreError> {
        let Some(snapshot) = persist::read_info(data_dir)? else {
            return Ok(None);
        };

        let mut core = self.core.write();
        core.is_leader = snapshot.is_leader;
        for (group_id, rows) in &snapshot.groups {
            let Some(group) = core.groups.get_mut(group_id) else {
                warn!("persisted unknown data group {}, ignoring", group_id);
                continue;
            };
            for row in rows {
                let Some(member) = group.member_mut(row.server_id) else {
                    warn!(
                        "group {}: persisted unknown server {}, ignoring",
                        group_id, row.server_id
                    );
                    continue;
                };
                member.status = match row.status {
                    ServerStatus::Syncing | ServerStatus::Active => ServerStatus::Offline,
                    other => other,
                };
                member.data_version = row.data_version;
            }
        }
        drop(core);

        for group_id in self.my_group_ids() {
            if let Some(snapshot_dv) = snapshot
                .groups
                .get(&group_id)
                .and_then(|rows| rows.iter().find(|r| r.server_id == self.my_server_id))
                .map(|r| r.data_version)
            {
                self.set_my_data_version(group_id, snapshot_dv);
            }
        }

        self.change_version
            .store(snapshot.version.max(1), Ordering::Release);
        Ok(snapshot.last_shutdown)
    }

    /// Writes the current state to `data_group.info`.
    pub fn persist(&self, data_dir: &Path) -> Result<(), SliceStoreError> {
        let snapshot = {
            let core = self.core.read();
            persist::InfoSnapshot {
                is_leader: core.is_leader,
                version: self.change_version(),
                groups: core
                    .groups
                    .values()
                    .map(|group| {
                        (
                            group.group_id,
                            group
                                .members
                                .iter()
                                .map(|m| persist::InfoRow {
                                    server_id: m.server_id,
                                    status: m.status,
                                    data_version: if m.server_id == self.my_server_id {
                                        self.my_data_version(group.group_id)
                                    } else {
                                        m.data_version
                                    },
                                })
                                .collect(),
                        )
                    })
                    .collect(),
                last_shutdown: None,
            }
        };
        persist::write_info(data_dir, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupEntry;

    fn config() -> Config {
        Config {
            server_id: 1,
            servers: vec![
                ServerEntry {
                    id: 1,
                    host: "127.0.0.1".into(),
                    service_port: 9012,
                    replica_port: 9014,
                },
                ServerEntry {
                    id: 2,
                    host: "127.0.0.1".into(),
                    service_port: 9022,
                    replica_port: 9024,
                },
            ],
            groups: vec![GroupEntry {
                group_id: 1,
                servers: vec![1, 2],
                preseted_master: Some(1),
            }],
            ..Config::default()
        }
    }

    #[test]
    fn at_most_one_master_per_group() {
        let registry = ClusterRegistry::from_config(&config());
        registry.set_master(1, 1).unwrap();
        registry.set_master(1, 2).unwrap();

        let group = registry.group(1).unwrap();
        let masters: Vec<_> = group.members.iter().filter(|m| m.is_master).collect();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].server_id, 2);
    }

    #[test]
    fn data_versions_are_monotonic_per_group() {
        let registry = ClusterRegistry::from_config(&config());
        assert_eq!(registry.next_data_version(1).unwrap(), 1);
        assert_eq!(registry.next_data_version(1).unwrap(), 2);
        registry.set_my_data_version(1, 100);
        assert_eq!(registry.next_data_version(1).unwrap(), 101);
        // Fast-forward never goes backwards.
        registry.set_my_data_version(1, 5);
        assert_eq!(registry.my_data_version(1), 101);
    }

    #[test]
    fn readable_server_walks_to_an_active_member() {
        let registry = ClusterRegistry::from_config(&config());
        assert!(registry.get_readable_server(1).is_err());

        registry.set_status(1, 2, ServerStatus::Active);
        for _ in 0..16 {
            let (id, _) = registry.get_readable_server(1).unwrap();
            assert_eq!(id, 2);
        }
    }

    #[test]
    fn unknown_group_is_not_found() {
        let registry = ClusterRegistry::from_config(&config());
        assert!(matches!(
            registry.get_master(9),
            Err(SliceStoreError::NotFound(_))
        ));
    }
}
