use crate::db::DbPool;
use anyhow::{anyhow, Result};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::{
    fs,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
}

/// A file or folder in host storage. `path` is the host path
/// (`/<user>/files/...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Host path of the containing folder.
    pub fn parent_path(&self) -> String {
        match self.path.rsplit_once('/') {
            Some(("", _)) | None => "/".into(),
            Some((parent, _)) => parent.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not permitted: {0}")]
    NotPermitted(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Existence lookup used by the orphan cleanup.
pub trait FileLookup: Send + Sync {
    /// All nodes carrying this id; empty when the file is gone.
    fn get_by_id(&self, file_id: i64) -> Result<Vec<Node>>;
}

/// Host storage operations used by the signing workflow.
pub trait FileStorage: FileLookup {
    fn get_by_id_for_user(&self, user: &str, file_id: i64) -> Result<Vec<Node>>;
    /// Resolve a host path, `None` when nothing exists there.
    fn get(&self, path: &str) -> Result<Option<Node>>;
    /// The user's root folder, created on demand.
    fn user_folder(&self, user: &str) -> Result<Node>;
    fn read(&self, node: &Node) -> Result<Vec<u8>>;
    fn node_exists(&self, dir: &Node, name: &str) -> Result<bool>;
    fn new_file(&self, dir: &Node, name: &str, data: &[u8]) -> Result<Node, StorageError>;
}

/// Host storage laid out on disk as `<root>/<user>/files/...`.
///
/// Node ids come from the `file_ids` table. An id is handed out once per
/// file and never again, so a row pointing at a removed file can not
/// resolve to whatever is created after it.
#[derive(Clone)]
pub struct DiskStorage {
    root: PathBuf,
    ids: DbPool,
}

impl DiskStorage {
    pub fn new<P: Into<PathBuf>>(root: P, ids: DbPool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, ids })
    }

    /// Give every node under the root an id and retire ids whose file is
    /// gone. Returns the number of nodes seen.
    pub fn index(&self) -> Result<usize> {
        let mut seen = 0;
        for entry in WalkDir::new(&self.root).min_depth(1) {
            self.node_at(entry?.path())?;
            seen += 1;
        }
        let known: Vec<(i64, String)> = {
            let conn = self.ids.get()?;
            let mut stmt = conn.prepare("SELECT id, path FROM file_ids")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };
        for (id, path) in known {
            if fs::symlink_metadata(self.disk_path(&path)?).is_err() {
                self.retire(id, &path)?;
            }
        }
        Ok(seen)
    }

    fn disk_path(&self, host_path: &str) -> Result<PathBuf> {
        let rel = Path::new(host_path.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("invalid path {host_path}"));
        }
        Ok(self.root.join(rel))
    }

    fn host_path(&self, disk: &Path) -> Result<String> {
        let rel = disk.strip_prefix(&self.root)?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(format!("/{}", parts.join("/")))
    }

    fn node_at(&self, disk: &Path) -> Result<Node> {
        let meta = fs::metadata(disk)?;
        let path = self.host_path(disk)?;
        let id = self.id_for(&path, fingerprint(&meta))?;
        Ok(node_from(disk, &meta, path, id))
    }

    /// The id of the file at `path`. A file whose fingerprint differs from
    /// the recorded one replaced the old file and gets a fresh id.
    fn id_for(&self, path: &str, seen: i64) -> Result<i64> {
        let mut conn = self.ids.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let known: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, fingerprint FROM file_ids WHERE path = ?1",
                [path],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let id = match known {
            Some((id, recorded)) if recorded == seen => id,
            stale => {
                if let Some((old, _)) = stale {
                    tx.execute("DELETE FROM file_ids WHERE id = ?1", [old])?;
                    debug!(file_id = old, path, "file replaced, id retired");
                }
                tx.execute(
                    "INSERT INTO file_ids (path, fingerprint) VALUES (?1, ?2)",
                    params![path, seen],
                )?;
                tx.last_insert_rowid()
            }
        };
        tx.commit()?;
        Ok(id)
    }

    fn retire(&self, id: i64, path: &str) -> Result<()> {
        self.ids
            .get()?
            .execute("DELETE FROM file_ids WHERE id = ?1", [id])?;
        debug!(file_id = id, path, "file gone, id retired");
        Ok(())
    }

    fn forget_path(&self, path: &str) -> Result<()> {
        self.ids
            .get()?
            .execute("DELETE FROM file_ids WHERE path = ?1", [path])?;
        Ok(())
    }

    fn user_files_dir(&self, user: &str) -> Result<PathBuf> {
        self.disk_path(&format!("/{user}/files"))
    }
}

fn node_from(disk: &Path, meta: &fs::Metadata, path: String, id: i64) -> Node {
    let kind = if meta.is_dir() {
        NodeKind::Folder
    } else {
        NodeKind::File
    };
    let name = disk
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Node {
        id,
        path,
        name,
        kind,
    }
}

/// Tells two files at the same path apart.
#[cfg(unix)]
fn fingerprint(meta: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino() as i64
}

#[cfg(not(unix))]
fn fingerprint(meta: &fs::Metadata) -> i64 {
    meta.created()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

impl FileLookup for DiskStorage {
    fn get_by_id(&self, file_id: i64) -> Result<Vec<Node>> {
        let known: Option<(String, i64)> = self
            .ids
            .get()?
            .query_row(
                "SELECT path, fingerprint FROM file_ids WHERE id = ?1",
                [file_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((path, recorded)) = known else {
            return Ok(Vec::new());
        };
        let disk = self.disk_path(&path)?;
        match fs::metadata(&disk) {
            Ok(meta) if fingerprint(&meta) == recorded => {
                Ok(vec![node_from(&disk, &meta, path, file_id)])
            }
            Ok(_) => {
                self.retire(file_id, &path)?;
                Ok(Vec::new())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.retire(file_id, &path)?;
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl FileStorage for DiskStorage {
    fn get_by_id_for_user(&self, user: &str, file_id: i64) -> Result<Vec<Node>> {
        let prefix = format!("{}/", self.host_path(&self.user_files_dir(user)?)?);
        let mut nodes = self.get_by_id(file_id)?;
        nodes.retain(|n| n.path.starts_with(&prefix));
        Ok(nodes)
    }

    fn get(&self, path: &str) -> Result<Option<Node>> {
        let disk = self.disk_path(path)?;
        match fs::metadata(&disk) {
            Ok(_) => Ok(Some(self.node_at(&disk)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn user_folder(&self, user: &str) -> Result<Node> {
        let dir = self.user_files_dir(user)?;
        fs::create_dir_all(&dir)?;
        self.node_at(&dir)
    }

    fn read(&self, node: &Node) -> Result<Vec<u8>> {
        Ok(fs::read(self.disk_path(&node.path)?)?)
    }

    fn node_exists(&self, dir: &Node, name: &str) -> Result<bool> {
        Ok(self.disk_path(&dir.path)?.join(name).exists())
    }

    fn new_file(&self, dir: &Node, name: &str, data: &[u8]) -> Result<Node, StorageError> {
        if name.contains('/') || name.is_empty() {
            return Err(StorageError::Other(anyhow!("invalid file name {name}")));
        }
        let disk = self.disk_path(&dir.path)?.join(name);
        if fs::symlink_metadata(&disk).is_err() {
            // a new file never inherits the id of one removed from this path
            self.forget_path(&self.host_path(&disk)?)?;
        }
        match fs::write(&disk, data) {
            Ok(()) => Ok(self.node_at(&disk)?),
            Err(e) if matches!(e.kind(), ErrorKind::PermissionDenied) => {
                Err(StorageError::NotPermitted(e.to_string()))
            }
            Err(e) if e.raw_os_error() == Some(STORAGE_FULL) => {
                Err(StorageError::NotPermitted(e.to_string()))
            }
            Err(e) => Err(StorageError::Other(e.into())),
        }
    }
}

// ENOSPC
const STORAGE_FULL: i32 = 28;
