use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rollcall_core::FeatureVector;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

/// Bumped whenever the table layout or blob encoding changes.
pub const SCHEMA_VERSION: u32 = 1;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("encoding encryption failed")]
    EncryptionFailed,
    #[error("encoding decryption failed for subject '{subject}' — key mismatch or corrupted data")]
    DecryptionFailed { subject: String },
    #[error("invalid encoding blob for subject '{subject}': {len} bytes")]
    InvalidBlob { subject: String, len: usize },
    #[error("invalid encoding value (NaN/Inf) for subject '{subject}'")]
    InvalidEncodingValue { subject: String },
    #[error("subject '{subject}' has dimension {found}, cache dimension is {expected}")]
    DimensionMismatch {
        subject: String,
        expected: usize,
        found: usize,
    },
    #[error("unsupported cache schema version '{0}' (expected {SCHEMA_VERSION})")]
    SchemaVersion(String),
    #[error("invalid metadata value for '{key}': {value}")]
    InvalidMeta { key: &'static str, value: String },
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("failed to move unusable store file {path} aside: {source}")]
    Quarantine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Whether the stored data itself is unusable, as opposed to the database
    /// being unreachable.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            StoreError::DecryptionFailed { .. }
                | StoreError::InvalidBlob { .. }
                | StoreError::InvalidEncodingValue { .. }
                | StoreError::DimensionMismatch { .. }
                | StoreError::SchemaVersion(_)
                | StoreError::InvalidMeta { .. }
        )
    }

    /// Whether the database or key file on disk is damaged beyond use, so
    /// that starting over with a fresh file is the only way forward.
    pub fn is_unusable_file(&self) -> bool {
        let code = match self {
            StoreError::Db(tokio_rusqlite::Error::Rusqlite(e)) | StoreError::Rusqlite(e) => {
                e.sqlite_error_code()
            }
            StoreError::KeyIo(e) => return e.kind() == std::io::ErrorKind::InvalidData,
            _ => None,
        };
        matches!(
            code,
            Some(rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt)
        )
    }
}

/// Everything the cache needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedCache {
    pub records: HashMap<String, Vec<FeatureVector>>,
    pub dimension: Option<usize>,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Per-subject metadata (no vector data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubjectInfo {
    pub subject_id: String,
    pub vector_count: u64,
    pub dimension: u64,
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub schema_version: Option<String>,
    pub subjects: u64,
    pub vectors: u64,
    pub dimension: Option<usize>,
    pub last_refresh: Option<String>,
}

/// SQLite-backed persistence for the encoding cache, one encrypted blob per
/// subject.
///
/// Each blob holds all of a subject's vectors as little-endian f32, encrypted
/// with AES-256-GCM. A per-installation key is generated at first use and
/// stored at `{db_dir}/.key` (mode 0600). The `cache_meta` table records the
/// schema version, the shared vector dimension and the last refresh time.
#[derive(Clone)]
pub struct EncodingStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl EncodingStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if is_memory(db_path) {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            load_or_generate_key(&key_path(db_path))?
        };

        let conn = Connection::open(db_path).await?;
        Self::migrate(&conn).await?;

        Ok(Self { conn, enc_key })
    }

    /// Like [`EncodingStore::open`], but a database file SQLite reports as
    /// corrupt or not a database, or a key file of the wrong length, is
    /// renamed to `<name>.corrupt-<timestamp>` and a fresh store is created
    /// in its place. The flag reports whether that happened. Other errors
    /// (locking, permissions) are returned unchanged.
    pub async fn open_or_recover(db_path: &Path) -> Result<(Self, bool), StoreError> {
        let err = match Self::open(db_path).await {
            Ok(store) => return Ok((store, false)),
            Err(e) if is_memory(db_path) || !e.is_unusable_file() => return Err(e),
            Err(e) => e,
        };
        tracing::warn!(
            path = %db_path.display(),
            error = %err,
            "encoding store unusable — moving it aside and starting empty"
        );

        let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%3f"));
        for ext in ["", "-wal", "-shm"] {
            let mut name = db_path.as_os_str().to_owned();
            name.push(ext);
            quarantine(Path::new(&name), &suffix)?;
        }
        // Encodings written under a bad key cannot be read back, so the key
        // goes with the database.
        if matches!(err, StoreError::KeyIo(_)) {
            quarantine(&key_path(db_path), &suffix)?;
        }

        let store = Self::open(db_path).await?;
        Ok((store, true))
    }

    async fn migrate(conn: &Connection) -> Result<(), StoreError> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS cache_meta (
                     key TEXT PRIMARY KEY,
                     value TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS encodings (
                     subject_id TEXT PRIMARY KEY,
                     dimension INTEGER NOT NULL,
                     vector_count INTEGER NOT NULL,
                     payload BLOB NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Replace the stored cache with `cache` in a single transaction.
    pub async fn save(&self, cache: &PersistedCache) -> Result<(), StoreError> {
        let updated_at = Utc::now().to_rfc3339();

        // Encrypt before entering the SQLite closure
        let mut rows = Vec::with_capacity(cache.records.len());
        for (subject, vectors) in &cache.records {
            let dimension = vectors.first().map(|v| v.dim()).unwrap_or(0);
            for v in vectors {
                if v.dim() != dimension {
                    return Err(StoreError::DimensionMismatch {
                        subject: subject.clone(),
                        expected: dimension,
                        found: v.dim(),
                    });
                }
                if !v.is_finite() {
                    return Err(StoreError::InvalidEncodingValue {
                        subject: subject.clone(),
                    });
                }
            }
            let blob = self.encrypt(&vectors_to_bytes(vectors))?;
            rows.push((subject.clone(), dimension as i64, vectors.len() as i64, blob));
        }

        let dimension = cache.dimension.map(|d| d.to_string());
        let last_refresh = cache.last_refresh.map(|t| t.to_rfc3339());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM encodings", [])?;
                for (subject, dimension, count, blob) in rows {
                    tx.execute(
                        "INSERT INTO encodings (subject_id, dimension, vector_count, payload, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        rusqlite::params![subject, dimension, count, blob, updated_at],
                    )?;
                }
                tx.execute(
                    "INSERT OR REPLACE INTO cache_meta (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )?;
                upsert_meta(&tx, "dimension", dimension.as_deref())?;
                upsert_meta(&tx, "last_refresh", last_refresh.as_deref())?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Load the stored cache. `Ok(None)` means nothing has been saved yet.
    pub async fn load(&self) -> Result<Option<PersistedCache>, StoreError> {
        let (meta, rows): (HashMap<String, String>, Vec<(String, i64, i64, Vec<u8>)>) = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM cache_meta")?;
                let meta = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<HashMap<_, _>, _>>()?;

                let mut stmt = conn.prepare(
                    "SELECT subject_id, dimension, vector_count, payload FROM encodings",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((meta, rows))
            })
            .await?;

        let Some(version) = meta.get("schema_version") else {
            return Ok(None);
        };
        if version != &SCHEMA_VERSION.to_string() {
            return Err(StoreError::SchemaVersion(version.clone()));
        }

        let dimension = match meta.get("dimension") {
            Some(v) => Some(v.parse::<usize>().map_err(|_| StoreError::InvalidMeta {
                key: "dimension",
                value: v.clone(),
            })?),
            None => None,
        };

        let last_refresh = match meta.get("last_refresh") {
            Some(v) => Some(
                DateTime::parse_from_rfc3339(v)
                    .map_err(|_| StoreError::InvalidMeta {
                        key: "last_refresh",
                        value: v.clone(),
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let mut records = HashMap::with_capacity(rows.len());
        for (subject, dim, count, blob) in rows {
            let dim = usize::try_from(dim).unwrap_or(0);
            let count = usize::try_from(count).unwrap_or(0);
            if let Some(expected) = dimension {
                if dim != expected {
                    return Err(StoreError::DimensionMismatch {
                        subject,
                        expected,
                        found: dim,
                    });
                }
            }
            let plaintext = self.decrypt(&subject, &blob)?;
            let vectors = bytes_to_vectors(&subject, &plaintext, dim, count)?;
            records.insert(subject, vectors);
        }

        Ok(Some(PersistedCache {
            records,
            dimension,
            last_refresh,
        }))
    }

    /// Remove one subject's encodings. Returns whether a row was deleted.
    pub async fn remove_subject(&self, subject_id: &str) -> Result<bool, StoreError> {
        let subject_id = subject_id.to_string();
        self.conn
            .call(move |conn| {
                let affected =
                    conn.execute("DELETE FROM encodings WHERE subject_id = ?1", [&subject_id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Drop every encoding and all metadata.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch("DELETE FROM encodings; DELETE FROM cache_meta;")?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// List subjects (metadata only, no vectors).
    pub async fn list_subjects(&self) -> Result<Vec<SubjectInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT subject_id, vector_count, dimension, updated_at
                     FROM encodings ORDER BY subject_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(SubjectInfo {
                        subject_id: row.get(0)?,
                        vector_count: row.get(1)?,
                        dimension: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.conn
            .call(|conn| {
                let (subjects, vectors): (u64, u64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(vector_count), 0) FROM encodings",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let meta = |key: &str| -> rusqlite::Result<Option<String>> {
                    match conn.query_row(
                        "SELECT value FROM cache_meta WHERE key = ?1",
                        [key],
                        |row| row.get::<_, String>(0),
                    ) {
                        Ok(v) => Ok(Some(v)),
                        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                        Err(e) => Err(e),
                    }
                };
                Ok(StoreStats {
                    schema_version: meta("schema_version")?,
                    subjects,
                    vectors,
                    dimension: meta("dimension")?.and_then(|d| d.parse().ok()),
                    last_refresh: meta("last_refresh")?,
                })
            })
            .await
            .map_err(StoreError::from)
    }

    /// Shut down the background SQLite thread. Every clone of this store
    /// fails with a connection error afterwards.
    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await.map_err(StoreError::from)
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, subject: &str, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob {
                subject: subject.to_string(),
                len: blob.len(),
            });
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed {
                subject: subject.to_string(),
            })
    }
}

fn upsert_meta(
    tx: &rusqlite::Transaction<'_>,
    key: &str,
    value: Option<&str>,
) -> rusqlite::Result<()> {
    match value {
        Some(v) => tx.execute(
            "INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?1, ?2)",
            [key, v],
        )?,
        None => tx.execute("DELETE FROM cache_meta WHERE key = ?1", [key])?,
    };
    Ok(())
}

fn is_memory(db_path: &Path) -> bool {
    db_path == Path::new(":memory:")
}

fn key_path(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or(Path::new("/var/lib/rollcall"))
        .join(".key")
}

/// Rename `path` to `<path>.<suffix>` if it exists.
fn quarantine(path: &Path, suffix: &str) -> Result<(), StoreError> {
    if !path.exists() {
        return Ok(());
    }
    let mut target = path.as_os_str().to_owned();
    target.push(".");
    target.push(suffix);
    let target = PathBuf::from(target);
    std::fs::rename(path, &target).map_err(|source| StoreError::Quarantine {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::warn!(from = %path.display(), to = %target.display(), "unusable store file moved aside");
    Ok(())
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn vectors_to_bytes(vectors: &[FeatureVector]) -> Vec<u8> {
    let total: usize = vectors.iter().map(|v| v.dim()).sum();
    let mut bytes = Vec::with_capacity(total * 4);
    for v in vectors {
        for &x in &v.values {
            bytes.extend_from_slice(&x.to_le_bytes());
        }
    }
    bytes
}

fn bytes_to_vectors(
    subject: &str,
    bytes: &[u8],
    dim: usize,
    count: usize,
) -> Result<Vec<FeatureVector>, StoreError> {
    if dim == 0 || bytes.len() != dim * count * 4 {
        return Err(StoreError::InvalidBlob {
            subject: subject.to_string(),
            len: bytes.len(),
        });
    }

    let mut vectors = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(dim * 4) {
        let mut values = Vec::with_capacity(dim);
        for raw in chunk.chunks_exact(4) {
            let v = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if !v.is_finite() {
                return Err(StoreError::InvalidEncodingValue {
                    subject: subject.to_string(),
                });
            }
            values.push(v);
        }
        vectors.push(FeatureVector::new(values));
    }
    Ok(vectors)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
