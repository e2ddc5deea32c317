//! Local OCI blob and rootfs storage.
//!
//! Blobs (layers, configs) are stored content-addressed under `blobs/sha256/`.
//! The image index — which reference maps to which manifest digest, and which
//! blobs it depends on — lives in a small SQLite database.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use sha2::Digest as _;

const BLOBS_DIR: &str = "blobs/sha256";
const ROOTFS_DIR: &str = "rootfs";
const INDEX_FILE: &str = "index.sqlite3";

/// Metadata for a locally stored image.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct ImageMeta {
    /// Full image reference string.
    pub reference: String,
    /// Manifest content digest.
    pub digest: String,
    /// Total compressed layer size in bytes.
    pub size: u64,
}

/// Manages local OCI blob storage and the SQLite image index.
pub struct Store {
    root: PathBuf,
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("root", &self.root).finish()
    }
}

impl Store {
    /// Opens (or creates) the store rooted at `dir`.
    pub fn open(dir: &Path) -> crate::Result<Self> {
        fs::create_dir_all(dir.join(BLOBS_DIR))?;
        fs::create_dir_all(dir.join(ROOTFS_DIR))?;

        let conn =
            Connection::open(dir.join(INDEX_FILE)).map_err(|e| crate::Error::Db(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS images (
                reference      TEXT PRIMARY KEY,
                digest         TEXT NOT NULL,
                size           INTEGER NOT NULL,
                config_digest  TEXT NOT NULL,
                layer_digests  TEXT NOT NULL
            )",
        )
        .map_err(|e| crate::Error::Db(e.to_string()))?;

        Ok(Self {
            root: dir.to_path_buf(),
            conn,
        })
    }

    /// Returns the filesystem path for a blob by its digest.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join(BLOBS_DIR).join(hex)
    }

    /// Returns `true` if a blob with the given digest exists locally.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Writes `data` into the blob store and returns its `sha256:<hex>` digest.
    ///
    /// A no-op if a blob with the computed digest is already present.
    fn save(&self, data: &[u8]) -> crate::Result<String> {
        let digest = content_digest(data);
        if self.has_blob(&digest) {
            return Ok(digest);
        }
        let path = self.blob_path(&digest);
        let file = fs::File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(data)?;
        writer.flush()?;
        Ok(digest)
    }

    /// Saves a layer blob, returning its digest. `media_type` is currently
    /// unused but kept for future manifest-aware extraction.
    pub fn save_layer(&self, data: &[u8], _media_type: &str) -> crate::Result<String> {
        self.save(data)
    }

    /// Saves an image config blob, returning its digest.
    pub fn save_config(&self, data: &[u8]) -> crate::Result<String> {
        self.save(data)
    }

    /// Returns the filesystem path of a stored layer blob.
    pub fn layer_path(&self, digest: &str) -> PathBuf {
        self.blob_path(digest)
    }

    /// Returns the rootfs ext4 image path for a manifest digest.
    pub fn rootfs_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join(ROOTFS_DIR).join(format!("{hex}.raw"))
    }

    /// Looks up the manifest digest cached for an image reference.
    pub fn get_digest(&self, reference: &str) -> crate::Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT digest FROM images WHERE reference = ?1",
                [reference],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(crate::Error::Db(e.to_string())),
            })
    }

    /// Loads the raw config JSON blob cached for an image reference.
    pub fn load_image_config(&self, reference: &str) -> crate::Result<Option<String>> {
        let config_digest: Option<String> = self
            .conn
            .query_row(
                "SELECT config_digest FROM images WHERE reference = ?1",
                [reference],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(crate::Error::Db(e.to_string())),
            })?;

        let Some(digest) = config_digest else {
            return Ok(None);
        };
        let path = self.blob_path(&digest);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Adds or replaces an image's index entry.
    pub fn upsert_image(
        &self,
        reference: &str,
        digest: &str,
        size: u64,
        config_digest: &str,
        layer_digests: &[String],
    ) -> crate::Result<()> {
        let layer_digests_json = serde_json::to_string(layer_digests)?;
        let size: i64 = size.try_into().unwrap_or(i64::MAX);
        self.conn
            .execute(
                "INSERT INTO images (reference, digest, size, config_digest, layer_digests)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(reference) DO UPDATE SET
                    digest = excluded.digest,
                    size = excluded.size,
                    config_digest = excluded.config_digest,
                    layer_digests = excluded.layer_digests",
                rusqlite::params![reference, digest, size, config_digest, layer_digests_json],
            )
            .map_err(|e| crate::Error::Db(e.to_string()))?;
        Ok(())
    }

    /// Lists all locally stored images.
    pub fn list_images(&self) -> crate::Result<Vec<ImageMeta>> {
        let mut stmt = self
            .conn
            .prepare("SELECT reference, digest, size FROM images ORDER BY reference")
            .map_err(|e| crate::Error::Db(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let size: i64 = row.get(2)?;
                Ok(ImageMeta {
                    reference: row.get(0)?,
                    digest: row.get(1)?,
                    size: size.try_into().unwrap_or(0),
                })
            })
            .map_err(|e| crate::Error::Db(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| crate::Error::Db(e.to_string()))
    }

    /// Removes an image's index entry and its rootfs image.
    ///
    /// Layer blobs are left in place — they are content-addressed and may be
    /// shared by other images; a future GC pass can reclaim orphans.
    pub fn remove_image(&self, reference: &str) -> crate::Result<()> {
        let digest = self.get_digest(reference)?;
        self.conn
            .execute("DELETE FROM images WHERE reference = ?1", [reference])
            .map_err(|e| crate::Error::Db(e.to_string()))?;

        if let Some(digest) = digest {
            let rootfs = self.rootfs_path(&digest);
            if rootfs.exists() {
                fs::remove_file(&rootfs)?;
            }
        }
        Ok(())
    }
}

/// Computes the `sha256:<hex>` digest of a byte slice.
pub fn content_digest(data: &[u8]) -> String {
    format!("sha256:{}", encode_hex(&sha2::Sha256::digest(data)))
}

/// Lower-case hex encoding, to avoid pulling in a dedicated `hex` crate for
/// what is otherwise a one-line format loop.
fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
