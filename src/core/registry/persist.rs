// src/core/registry/persist.rs

//! Reading and writing `data_group.info`, the registry's persisted
//! snapshot, plus the disk-space probe backing `disk_space_stat`.
//!
//! The file is plain text: top-level `is_leader` and `version` items
//! followed by one `[data-group-N]` section per group, each holding
//! `server=<id>,<status>,<data_version>` lines. The file's mtime doubles as
//! the last-alive marker: the sync task touches it once a minute even when
//! nothing changed, and on restart the mtime is read back as the previous
//! shutdown time.

use super::ServerStatus;
use crate::core::SliceStoreError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use sysinfo::Disks;

pub const INFO_FILE_NAME: &str = "data_group.info";

const ITEM_IS_LEADER: &str = "is_leader";
const ITEM_VERSION: &str = "version";
const ITEM_SERVER: &str = "server";
const GROUP_SECTION_PREFIX: &str = "data-group-";

/// One `server=` line of a group section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoRow {
    pub server_id: u32,
    pub status: ServerStatus,
    pub data_version: u64,
}

/// The parsed (or to-be-written) contents of `data_group.info`.
#[derive(Debug, Clone)]
pub struct InfoSnapshot {
    pub is_leader: bool,
    pub version: u64,
    pub groups: BTreeMap<u32, Vec<InfoRow>>,
    /// Populated on read from the file's mtime; ignored on write.
    pub last_shutdown: Option<SystemTime>,
}

fn info_path(data_dir: &Path) -> PathBuf {
    data_dir.join(INFO_FILE_NAME)
}

/// Parses `data_group.info`. Returns `None` when the file does not exist
/// (first start).
pub fn read_info(data_dir: &Path) -> Result<Option<InfoSnapshot>, SliceStoreError> {
    let path = info_path(data_dir);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let last_shutdown = fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut snapshot = InfoSnapshot {
        is_leader: false,
        version: 0,
        groups: BTreeMap::new(),
        last_shutdown,
    };
    let mut current_group: Option<u32> = None;

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let group_id = section
                .strip_prefix(GROUP_SECTION_PREFIX)
                .ok_or_else(|| {
                    SliceStoreError::Corrupt(format!(
                        "{INFO_FILE_NAME} line {}: unknown section [{section}]",
                        lineno + 1
                    ))
                })?
                .parse::<u32>()?;
            snapshot.groups.entry(group_id).or_default();
            current_group = Some(group_id);
            continue;
        }

        let (item, value) = line.split_once('=').ok_or_else(|| {
            SliceStoreError::Corrupt(format!(
                "{INFO_FILE_NAME} line {}: expected item=value",
                lineno + 1
            ))
        })?;

        match (item.trim(), current_group) {
            (ITEM_IS_LEADER, None) => snapshot.is_leader = value.trim() == "1",
            (ITEM_VERSION, None) => snapshot.version = value.trim().parse()?,
            (ITEM_SERVER, Some(group_id)) => {
                let fields: Vec<&str> = value.trim().split(',').collect();
                if fields.len() != 3 {
                    return Err(SliceStoreError::Corrupt(format!(
                        "{INFO_FILE_NAME} line {}: invalid server value '{}', field count {} != 3",
                        lineno + 1,
                        value,
                        fields.len()
                    )));
                }
                let row = InfoRow {
                    server_id: fields[0].parse()?,
                    status: ServerStatus::from_code(fields[1].parse()?)?,
                    data_version: fields[2].parse()?,
                };
                snapshot
                    .groups
                    .get_mut(&group_id)
                    .expect("section entry inserted above")
                    .push(row);
            }
            _ => {
                return Err(SliceStoreError::Corrupt(format!(
                    "{INFO_FILE_NAME} line {}: unexpected item '{item}'",
                    lineno + 1
                )));
            }
        }
    }

    Ok(Some(snapshot))
}

/// Writes the snapshot atomically (temp file + rename).
pub fn write_info(data_dir: &Path, snapshot: &InfoSnapshot) -> Result<(), SliceStoreError> {
    fs::create_dir_all(data_dir)?;

    let mut out = String::with_capacity(256);
    out.push_str(&format!(
        "{ITEM_IS_LEADER}={}\n{ITEM_VERSION}={}\n",
        if snapshot.is_leader { 1 } else { 0 },
        snapshot.version
    ));
    for (group_id, rows) in &snapshot.groups {
        out.push_str(&format!("[{GROUP_SECTION_PREFIX}{group_id}]\n"));
        for row in rows {
            out.push_str(&format!(
                "{ITEM_SERVER}={},{},{}\n",
                row.server_id, row.status as u8, row.data_version
            ));
        }
    }

    let path = info_path(data_dir);
    let tmp = path.with_extension("info.tmp");
    fs::write(&tmp, out)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Refreshes the info file's mtime without rewriting it.
pub fn touch_info(data_dir: &Path) -> Result<(), SliceStoreError> {
    let file = fs::OpenOptions::new()
        .append(true)
        .open(info_path(data_dir))?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

/// Disk capacity of the filesystem holding the data directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSpaceStat {
    pub total: u64,
    pub used: u64,
    pub avail: u64,
}

/// Probes the mounted disks and reports the one whose mount point is the
/// longest prefix of `data_dir`.
pub fn disk_space_stat(data_dir: &Path) -> DiskSpaceStat {
    let disks = Disks::new_with_refreshed_list();
    let data_dir = data_dir
        .canonicalize()
        .unwrap_or_else(|_| data_dir.to_path_buf());

    let mut best: Option<(usize, DiskSpaceStat)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if data_dir.starts_with(mount) {
            let depth = mount.components().count();
            let stat = DiskSpaceStat {
                total: disk.total_space(),
                used: disk.total_space().saturating_sub(disk.available_space()),
                avail: disk.available_space(),
            };
            if best.is_none_or(|(d, _)| depth > d) {
                best = Some((depth, stat));
            }
        }
    }
    best.map(|(_, stat)| stat).unwrap_or_default()
}
