// src/config.rs

//! Manages server configuration: loading, validation, and the cluster topology tables.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// One physical server in the cluster topology. Every member of every data
/// group must appear here exactly once.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerEntry {
    pub id: u32,
    pub host: String,
    pub service_port: u16,
    pub replica_port: u16,
}

impl ServerEntry {
    /// The address clients are told to connect to.
    pub fn service_addr(&self) -> String {
        format!("{}:{}", self.host, self.service_port)
    }

    /// The address peers use for replication traffic.
    pub fn replica_addr(&self) -> String {
        format!("{}:{}", self.host, self.replica_port)
    }
}

/// One data group: a replication set owning a shard of the object-id space.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GroupEntry {
    pub group_id: u32,
    /// Server ids of the group members, in preference order.
    pub servers: Vec<u32>,
    /// The operator-preset master hint. The leader protocol may override it.
    #[serde(default)]
    pub preseted_master: Option<u32>,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_service_port() -> u16 {
    9012
}
fn default_cluster_port() -> u16 {
    9013
}
fn default_replica_port() -> u16 {
    9014
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "slicestore_data".to_string()
}
fn default_data_thread_count() -> usize {
    8
}
fn default_file_block_size() -> u32 {
    4 * 1024 * 1024 // 4 MiB
}
fn default_binlog_rotate_size() -> u64 {
    64 * 1024 * 1024 // 64MB
}
fn default_replica_channels() -> usize {
    2
}
fn default_reserve_interval() -> Duration {
    Duration::from_secs(3600)
}
fn default_max_channel_count() -> usize {
    10000
}
fn default_demote_threshold() -> usize {
    10240
}
fn default_max_clients() -> usize {
    10000
}
fn default_request_deadline() -> Duration {
    Duration::from_secs(30)
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    server_id: u32,
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default = "default_service_port")]
    service_port: u16,
    #[serde(default = "default_cluster_port")]
    cluster_port: u16,
    #[serde(default = "default_replica_port")]
    replica_port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default = "default_data_thread_count")]
    data_thread_count: usize,
    #[serde(default = "default_file_block_size")]
    file_block_size: u32,
    #[serde(default = "default_binlog_rotate_size")]
    binlog_rotate_size: u64,
    #[serde(default = "default_replica_channels")]
    replica_channels_between_two_servers: usize,
    #[serde(default = "default_reserve_interval", with = "humantime_serde")]
    idempotency_channel_reserve_interval: Duration,
    #[serde(default = "default_max_channel_count")]
    max_channel_count: usize,
    #[serde(default = "default_demote_threshold")]
    replica_queue_demote_threshold: usize,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    #[serde(default = "default_request_deadline", with = "humantime_serde")]
    request_deadline: Duration,
    #[serde(default, rename = "server")]
    servers: Vec<ServerEntry>,
    #[serde(default, rename = "group")]
    groups: Vec<GroupEntry>,
}

/// Represents the final, validated server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This server's id within the topology tables.
    pub server_id: u32,
    pub bind_addr: String,
    pub service_port: u16,
    /// Reserved for the external leader-election traffic; accepted and
    /// validated so deployment tooling can pre-assign it.
    pub cluster_port: u16,
    pub replica_port: u16,
    pub log_level: String,
    pub data_dir: String,
    /// Sizes the two data-worker arrays; each array gets `(n + 1) / 2` workers.
    pub data_thread_count: usize,
    /// The cluster-wide block size. All slices live within one block.
    pub file_block_size: u32,
    pub binlog_rotate_size: u64,
    pub replica_channels_between_two_servers: usize,
    #[serde(with = "humantime_serde")]
    pub idempotency_channel_reserve_interval: Duration,
    pub max_channel_count: usize,
    /// A slave whose unacked queue exceeds this many operations is demoted.
    pub replica_queue_demote_threshold: usize,
    pub max_clients: usize,
    /// How long the front-end waits for a data worker before giving the
    /// client a retriable error. The operation itself still completes.
    #[serde(with = "humantime_serde")]
    pub request_deadline: Duration,
    pub servers: Vec<ServerEntry>,
    pub groups: Vec<GroupEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: 1,
            bind_addr: default_bind_addr(),
            service_port: default_service_port(),
            cluster_port: default_cluster_port(),
            replica_port: default_replica_port(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            data_thread_count: default_data_thread_count(),
            file_block_size: default_file_block_size(),
            binlog_rotate_size: default_binlog_rotate_size(),
            replica_channels_between_two_servers: default_replica_channels(),
            idempotency_channel_reserve_interval: default_reserve_interval(),
            max_channel_count: default_max_channel_count(),
            replica_queue_demote_threshold: default_demote_threshold(),
            max_clients: default_max_clients(),
            request_deadline: default_request_deadline(),
            servers: vec![ServerEntry {
                id: 1,
                host: "127.0.0.1".to_string(),
                service_port: default_service_port(),
                replica_port: default_replica_port(),
            }],
            groups: vec![GroupEntry {
                group_id: 1,
                servers: vec![1],
                preseted_master: Some(1),
            }],
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            server_id: raw.server_id,
            bind_addr: raw.bind_addr,
            service_port: raw.service_port,
            cluster_port: raw.cluster_port,
            replica_port: raw.replica_port,
            log_level: raw.log_level,
            data_dir: raw.data_dir,
            data_thread_count: raw.data_thread_count,
            file_block_size: raw.file_block_size,
            binlog_rotate_size: raw.binlog_rotate_size,
            replica_channels_between_two_servers: raw.replica_channels_between_two_servers,
            idempotency_channel_reserve_interval: raw.idempotency_channel_reserve_interval,
            max_channel_count: raw.max_channel_count,
            replica_queue_demote_threshold: raw.replica_queue_demote_threshold,
            max_clients: raw.max_clients,
            request_deadline: raw.request_deadline,
            servers: raw.servers,
            groups: raw.groups,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.service_port == 0 || self.replica_port == 0 || self.cluster_port == 0 {
            return Err(anyhow!("ports cannot be 0"));
        }
        if self.service_port == self.replica_port {
            return Err(anyhow!("service_port and replica_port must differ"));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(anyhow!("bind_addr cannot be empty"));
        }
        if self.data_thread_count == 0 {
            return Err(anyhow!("data_thread_count cannot be 0"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.max_channel_count == 0 {
            return Err(anyhow!("max_channel_count cannot be 0"));
        }
        if self.file_block_size == 0 || !self.file_block_size.is_power_of_two() {
            return Err(anyhow!(
                "file_block_size must be a power of two, got {}",
                self.file_block_size
            ));
        }
        if self.binlog_rotate_size < 4096 {
            return Err(anyhow!("binlog_rotate_size is too small"));
        }
        if self.replica_channels_between_two_servers == 0 {
            return Err(anyhow!(
                "replica_channels_between_two_servers cannot be 0"
            ));
        }
        if self.request_deadline.is_zero() {
            return Err(anyhow!("request_deadline cannot be 0"));
        }

        if self.servers.is_empty() {
            return Err(anyhow!("at least one [[server]] entry is required"));
        }
        for (i, server) in self.servers.iter().enumerate() {
            if self.servers[..i].iter().any(|s| s.id == server.id) {
                return Err(anyhow!("duplicate server id {}", server.id));
            }
            if server.host.trim().is_empty() {
                return Err(anyhow!("server {} has an empty host", server.id));
            }
        }
        if self.server(self.server_id).is_none() {
            return Err(anyhow!(
                "server_id {} does not appear in the [[server]] tables",
                self.server_id
            ));
        }

        if self.groups.is_empty() {
            return Err(anyhow!("at least one [[group]] entry is required"));
        }
        for (i, group) in self.groups.iter().enumerate() {
            if self.groups[..i].iter().any(|g| g.group_id == group.group_id) {
                return Err(anyhow!("duplicate group id {}", group.group_id));
            }
            if group.servers.is_empty() {
                return Err(anyhow!("data group {} has no servers", group.group_id));
            }
            for sid in &group.servers {
                if self.server(*sid).is_none() {
                    return Err(anyhow!(
                        "data group {} references unknown server {}",
                        group.group_id,
                        sid
                    ));
                }
            }
            if let Some(master) = group.preseted_master
                && !group.servers.contains(&master)
            {
                return Err(anyhow!(
                    "data group {} presets master {} which is not a member",
                    group.group_id,
                    master
                ));
            }
        }

        Ok(())
    }

    /// Looks up a server entry by id.
    pub fn server(&self, id: u32) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Looks up a group entry by id.
    pub fn group(&self, group_id: u32) -> Option<&GroupEntry> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }

    /// Returns the ids of the groups this server is a member of.
    pub fn my_groups(&self) -> Vec<u32> {
        self.groups
            .iter()
            .filter(|g| g.servers.contains(&self.server_id))
            .map(|g| g.group_id)
            .collect()
    }

    /// Worker count per data-thread array (master and slave each get this many).
    pub fn workers_per_array(&self) -> usize {
        self.data_thread_count.div_ceil(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_config() -> Config {
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
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_block_size_not_power_of_two() {
        let config = Config {
            file_block_size: 3 * 1024 * 1024,
            ..two_node_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_group_with_unknown_server() {
        let mut config = two_node_config();
        config.groups[0].servers.push(9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn my_groups_filters_membership() {
        let mut config = two_node_config();
        config.groups.push(GroupEntry {
            group_id: 2,
            servers: vec![2],
            preseted_master: None,
        });
        assert_eq!(config.my_groups(), vec![1]);
    }

    #[test]
    fn parses_minimal_toml() {
        let text = r#"
            server_id = 1

            [[server]]
            id = 1
            host = "127.0.0.1"
            service_port = 9012
            replica_port = 9014

            [[group]]
            group_id = 1
            servers = [1]
        "#;
        let raw: super::RawConfig = toml::from_str(text).unwrap();
        assert_eq!(raw.server_id, 1);
        assert_eq!(raw.groups.len(), 1);
        assert_eq!(
            raw.idempotency_channel_reserve_interval,
            Duration::from_secs(3600)
        );
    }
}
