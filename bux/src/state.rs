//! VM state types and SQLite-backed persistence.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::Result;

/// VM lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Status {
    /// VM process has been forked but the guest agent is not yet reachable.
    Creating,
    /// VM process is running and the guest agent has answered a handshake.
    Running,
    /// Pause requested; the VM process is about to be stopped (SIGSTOP).
    Pausing,
    /// VM process is stopped (SIGSTOP) and holds its memory/register state.
    Paused,
    /// Resume requested; the VM process is about to be continued (SIGCONT).
    Resuming,
    /// VM has been stopped or exited.
    Stopped,
}

impl Status {
    /// Parses the short lowercase name stored in the database.
    fn from_db(s: &str) -> Self {
        match s {
            "creating" => Self::Creating,
            "pausing" => Self::Pausing,
            "paused" => Self::Paused,
            "resuming" => Self::Resuming,
            "stopped" => Self::Stopped,
            _ => Self::Running,
        }
    }

    /// Short lowercase name stored in the database.
    const fn as_db(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Stopped => "stopped",
        }
    }
}

/// Serializable snapshot of a VM's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmConfig {
    /// Number of virtual CPUs.
    pub vcpus: u8,
    /// RAM size in MiB.
    pub ram_mib: u32,
    /// Root filesystem path on the host.
    pub rootfs: Option<String>,
    /// Executable path inside the VM.
    pub exec_path: Option<String>,
    /// Arguments passed to the executable.
    pub exec_args: Vec<String>,
    /// Environment variables (`KEY=VALUE`).
    pub env: Option<Vec<String>>,
    /// Working directory inside the VM.
    pub workdir: Option<String>,
    /// Whether the VM (and its disk/socket) is deleted automatically on stop.
    pub auto_remove: bool,
    /// Whether the rootfs is a block device (`"rootfs"` disk) rather than a
    /// virtiofs-shared directory. When set, the guest must mount and pivot
    /// into it itself — `rootfs` above is then host state only, not the
    /// directory libkrun shares.
    pub rootfs_is_block_device: bool,
}

/// Persisted state of a managed VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmState {
    /// Short hex identifier.
    pub id: String,
    /// User-assigned name, if any. Unique among non-deleted VMs.
    pub name: Option<String>,
    /// Host PID of the VM process.
    pub pid: i32,
    /// OCI image reference (if pulled from a registry).
    pub image: Option<String>,
    /// Unix socket path for host↔guest communication.
    pub socket: PathBuf,
    /// Current lifecycle status.
    pub status: Status,
    /// VM configuration snapshot.
    pub config: VmConfig,
    /// Timestamp when the VM was created.
    pub created_at: SystemTime,
}

/// Generates a 12-character hex VM identifier.
pub(crate) fn gen_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("{:012x}", h.finish())
}

/// SQLite-backed index of managed VMs.
///
/// Schema lives in a single `vms` table; `config` is stored as a JSON blob
/// since it has no independent query needs of its own.
#[derive(Debug)]
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vms (
                id         TEXT PRIMARY KEY,
                name       TEXT UNIQUE,
                pid        INTEGER NOT NULL,
                image      TEXT,
                socket     TEXT NOT NULL,
                status     TEXT NOT NULL,
                config     TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )?;
        Ok(Self { conn })
    }

    /// Inserts a new VM record.
    pub fn insert(&self, state: &VmState) -> Result<()> {
        let config_json = serde_json::to_string(&state.config)?;
        self.conn.execute(
            "INSERT INTO vms (id, name, pid, image, socket, status, config, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                state.id,
                state.name,
                state.pid,
                state.image,
                state.socket.to_string_lossy(),
                state.status.as_db(),
                config_json,
                to_unix(state.created_at),
            ],
        )?;
        Ok(())
    }

    /// Lists all known VMs, newest first.
    pub fn list(&self) -> Result<Vec<VmState>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, pid, image, socket, status, config, created_at
             FROM vms ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_state)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Looks up a VM by its exact name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<VmState>> {
        self.conn
            .query_row(
                "SELECT id, name, pid, image, socket, status, config, created_at
                 FROM vms WHERE name = ?1",
                [name],
                row_to_state,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Looks up a VM by an unambiguous ID prefix.
    pub fn get_by_id_prefix(&self, prefix: &str) -> Result<VmState> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, pid, image, socket, status, config, created_at
             FROM vms WHERE id LIKE ?1 || '%'",
        )?;
        let mut matches = stmt
            .query_map([prefix], row_to_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match matches.len() {
            0 => Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no VM matches '{prefix}'"),
            ))),
            1 => Ok(matches.remove(0)),
            n => Err(crate::Error::Ambiguous(format!(
                "'{prefix}' matches {n} VMs"
            ))),
        }
    }

    /// Updates a VM's lifecycle status.
    pub fn update_status(&self, id: &str, status: Status) -> Result<()> {
        self.conn.execute(
            "UPDATE vms SET status = ?1 WHERE id = ?2",
            params![status.as_db(), id],
        )?;
        Ok(())
    }

    /// Renames a VM, or clears its name when `name` is `None`.
    pub fn update_name(&self, id: &str, name: Option<&str>) -> Result<()> {
        self.conn
            .execute("UPDATE vms SET name = ?1 WHERE id = ?2", params![name, id])?;
        Ok(())
    }

    /// Deletes a VM's record.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM vms WHERE id = ?1", [id])?;
        Ok(())
    }
}

/// Converts a SQLite row into a [`VmState`].
fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<VmState> {
    let socket: String = row.get(4)?;
    let status: String = row.get(5)?;
    let config_json: String = row.get(6)?;
    let created_at: i64 = row.get(7)?;

    let config: VmConfig = serde_json::from_str(&config_json).unwrap_or(VmConfig {
        vcpus: 1,
        ram_mib: 512,
        rootfs: None,
        exec_path: None,
        exec_args: Vec::new(),
        env: None,
        workdir: None,
        auto_remove: false,
        rootfs_is_block_device: false,
    });

    Ok(VmState {
        id: row.get(0)?,
        name: row.get(1)?,
        pid: row.get(2)?,
        image: row.get(3)?,
        socket: PathBuf::from(socket),
        status: Status::from_db(&status),
        config,
        created_at: from_unix(created_at),
    })
}

/// Converts a [`SystemTime`] to a Unix timestamp in seconds, saturating at zero.
fn to_unix(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .try_into()
        .unwrap_or(i64::MAX)
}

/// Converts a Unix timestamp in seconds back to a [`SystemTime`].
fn from_unix(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.try_into().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, name: Option<&str>) -> VmState {
        VmState {
            id: id.to_owned(),
            name: name.map(str::to_owned),
            pid: 4242,
            image: Some("alpine:latest".to_owned()),
            socket: PathBuf::from(format!("/tmp/{id}.sock")),
            status: Status::Running,
            config: VmConfig {
                vcpus: 1,
                ram_mib: 512,
                rootfs: Some("/rootfs".to_owned()),
                exec_path: Some("/sbin/bux-guest".to_owned()),
                exec_args: Vec::new(),
                env: None,
                workdir: None,
                auto_remove: false,
                rootfs_is_block_device: false,
            },
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn insert_and_list_roundtrip() {
        let db = StateDb::open(":memory:").expect("open");
        db.insert(&sample("abc123", Some("web"))).expect("insert");

        let vms = db.list().expect("list");
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name.as_deref(), Some("web"));
        assert_eq!(vms[0].config.vcpus, 1);
    }

    #[test]
    fn get_by_name_and_prefix() {
        let db = StateDb::open(":memory:").expect("open");
        db.insert(&sample("abcdef123456", Some("db"))).expect("insert");

        assert!(db.get_by_name("db").expect("query").is_some());
        assert!(db.get_by_name("missing").expect("query").is_none());
        assert_eq!(db.get_by_id_prefix("abcdef").expect("prefix").id, "abcdef123456");
    }

    #[test]
    fn update_status_and_delete() {
        let db = StateDb::open(":memory:").expect("open");
        db.insert(&sample("id1", None)).expect("insert");

        db.update_status("id1", Status::Stopped).expect("update");
        let vms = db.list().expect("list");
        assert_eq!(vms[0].status, Status::Stopped);

        db.delete("id1").expect("delete");
        assert!(db.list().expect("list").is_empty());
    }

    #[test]
    fn rename_enforces_uniqueness_is_caller_responsibility() {
        let db = StateDb::open(":memory:").expect("open");
        db.insert(&sample("id1", Some("a"))).expect("insert");
        db.update_name("id1", Some("b")).expect("rename");
        assert_eq!(
            db.get_by_name("b").expect("query").map(|s| s.id),
            Some("id1".to_owned())
        );
    }
}
