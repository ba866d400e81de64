use std::path::{Path, PathBuf};

use blinkgate_core::{StorageError, StorageSink, SubmissionPayload, SubmissionReceipt};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed, key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor dimension: {got} (stored as {expected})")]
    InvalidDescriptorDim { expected: usize, got: usize },
    #[error("descriptor is empty")]
    EmptyDescriptor,
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidDescriptorValue,
    #[error("enrollment image is empty")]
    EmptyImage,
    #[error("identity {0:?} is not usable as a storage key")]
    InvalidIdentity(String),
    #[error("image write failed for {path}: {source}")]
    ImageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

impl StoreError {
    /// Errors caused by the record itself rather than by the store.
    fn is_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::EmptyDescriptor
                | StoreError::InvalidDescriptorValue
                | StoreError::EmptyImage
                | StoreError::InvalidIdentity(_)
        )
    }
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        if err.is_rejection() {
            StorageError::Rejected(err.to_string())
        } else {
            StorageError::Unavailable(err.to_string())
        }
    }
}

/// SQLite-backed enrollment storage with AES-256-GCM encrypted descriptors.
///
/// Each identity has at most one active enrollment; storing again replaces
/// it. Stills are written to `{image_dir}/{identity}/enrollment_{millis}.jpg`
/// and referenced from the row by `file://` URL together with their SHA-256.
///
/// A per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct EnrollmentStore {
    conn: Connection,
    enc_key: [u8; 32],
    image_dir: PathBuf,
}

impl EnrollmentStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, image_dir: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path.parent().unwrap_or(Path::new(".")).join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS enrollments (
                     identity_id TEXT PRIMARY KEY,
                     id TEXT NOT NULL,
                     descriptor BLOB NOT NULL,
                     descriptor_dim INTEGER NOT NULL,
                     image_url TEXT NOT NULL,
                     image_path TEXT NOT NULL,
                     image_sha256 TEXT NOT NULL,
                     captured_at TEXT NOT NULL,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            enc_key,
            image_dir: image_dir.to_path_buf(),
        })
    }

    /// Store `payload` as the active enrollment for its identity.
    ///
    /// The image is written before the row; a previous image for the same
    /// identity is deleted once the row points at the new one. A newly
    /// written image is removed again if the row cannot be stored.
    pub async fn save(&self, payload: &SubmissionPayload) -> Result<SubmissionReceipt, StoreError> {
        validate_identity(&payload.identity_id)?;
        if payload.image_bytes.is_empty() {
            return Err(StoreError::EmptyImage);
        }
        validate_descriptor_values(&payload.descriptor)?;
        let blob = self.encrypt_descriptor(&payload.descriptor)?;

        let identity_dir = self.image_dir.join(&payload.identity_id);
        let image_path = identity_dir.join(format!(
            "enrollment_{}.jpg",
            payload.captured_at.timestamp_millis()
        ));
        tokio::fs::create_dir_all(&identity_dir)
            .await
            .map_err(|source| StoreError::ImageIo {
                path: identity_dir.clone(),
                source,
            })?;
        let existed = tokio::fs::try_exists(&image_path).await.unwrap_or(true);
        tokio::fs::write(&image_path, &payload.image_bytes)
            .await
            .map_err(|source| StoreError::ImageIo {
                path: image_path.clone(),
                source,
            })?;

        let image_url = format!("file://{}", image_path.display());
        let image_sha256 = format!("{:x}", Sha256::digest(&payload.image_bytes));
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let identity = payload.identity_id.clone();
        let dim = payload.descriptor.len() as i64;
        let captured_at = payload.captured_at.to_rfc3339();
        let url = image_url.clone();
        let path = image_path.to_string_lossy().into_owned();

        let upsert = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous = tx
                    .query_row(
                        "SELECT image_path FROM enrollments WHERE identity_id = ?1",
                        [&identity],
                        |row| row.get::<_, String>(0),
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        err => Err(err),
                    })?;
                tx.execute(
                    "INSERT INTO enrollments
                         (identity_id, id, descriptor, descriptor_dim, image_url, image_path,
                          image_sha256, captured_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                     ON CONFLICT(identity_id) DO UPDATE SET
                         id = excluded.id,
                         descriptor = excluded.descriptor,
                         descriptor_dim = excluded.descriptor_dim,
                         image_url = excluded.image_url,
                         image_path = excluded.image_path,
                         image_sha256 = excluded.image_sha256,
                         captured_at = excluded.captured_at,
                         updated_at = excluded.updated_at",
                    rusqlite::params![
                        identity,
                        id,
                        blob,
                        dim,
                        url,
                        path,
                        image_sha256,
                        captured_at,
                        now
                    ],
                )?;
                tx.commit()?;
                Ok(previous)
            })
            .await;
        let previous: Option<String> = match upsert {
            Ok(previous) => previous,
            Err(err) => {
                if !existed {
                    remove_image(&image_path).await;
                }
                return Err(err.into());
            }
        };

        if let Some(previous) = previous.filter(|p| Path::new(p) != image_path) {
            remove_image(Path::new(&previous)).await;
        }

        tracing::info!(
            identity = %payload.identity_id,
            url = %image_url,
            "enrollment saved"
        );
        Ok(SubmissionReceipt { url: image_url })
    }

    /// The active enrollment for `identity`, descriptor decrypted.
    pub async fn get(&self, identity: &str) -> Result<Option<EnrollmentRecord>, StoreError> {
        let identity = identity.to_string();

        // Fetch raw row from SQLite; decrypt outside the blocking closure
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, descriptor, descriptor_dim, image_url,
                            image_sha256, captured_at, created_at, updated_at
                     FROM enrollments WHERE identity_id = ?1",
                )?;
                let mut rows = stmt.query_map([&identity], |row| {
                    Ok((
                        EnrollmentInfo {
                            id: row.get(0)?,
                            identity_id: row.get(1)?,
                            descriptor_dim: row.get::<_, i64>(3)? as usize,
                            image_url: row.get(4)?,
                            image_sha256: row.get(5)?,
                            captured_at: row.get(6)?,
                            created_at: row.get(7)?,
                            updated_at: row.get(8)?,
                        },
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;

        let Some((info, blob)) = row else {
            return Ok(None);
        };
        let descriptor = self.decrypt_descriptor(&blob, info.descriptor_dim)?;
        Ok(Some(EnrollmentRecord { info, descriptor }))
    }

    /// All active enrollments (metadata only, no descriptors).
    pub async fn list(&self) -> Result<Vec<EnrollmentInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, descriptor_dim, image_url, image_sha256,
                            captured_at, created_at, updated_at
                     FROM enrollments ORDER BY created_at, identity_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(EnrollmentInfo {
                        id: row.get(0)?,
                        identity_id: row.get(1)?,
                        descriptor_dim: row.get::<_, i64>(2)? as usize,
                        image_url: row.get(3)?,
                        image_sha256: row.get(4)?,
                        captured_at: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove the enrollment for `identity` and its still. Returns whether a
    /// record existed.
    pub async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        let removed: Option<String> = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let path = tx
                    .query_row(
                        "SELECT image_path FROM enrollments WHERE identity_id = ?1",
                        [&identity],
                        |row| row.get::<_, String>(0),
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        err => Err(err),
                    })?;
                tx.execute("DELETE FROM enrollments WHERE identity_id = ?1", [&identity])?;
                tx.commit()?;
                Ok(path)
            })
            .await?;

        match removed {
            Some(path) => {
                remove_image(Path::new(&path)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Count active enrollments.
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM enrollments", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt descriptor values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_descriptor_values(values)?;
        let plaintext = descriptor_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8], dim: usize) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_descriptor_strict(&plaintext, dim)
    }
}

impl StorageSink for EnrollmentStore {
    async fn submit(
        &mut self,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionReceipt, StorageError> {
        self.save(payload).await.map_err(|err| {
            tracing::error!(error = %err, identity = %payload.identity_id, "enrollment not saved");
            StorageError::from(err)
        })
    }
}

async fn remove_image(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %err, "could not remove enrollment image");
    }
}

fn validate_identity(identity: &str) -> Result<(), StoreError> {
    let usable = !identity.is_empty()
        && !identity.starts_with('.')
        && !identity.contains(['/', '\\', '\0']);
    if usable {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(identity.to_string()))
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
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

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_descriptor_strict(bytes: &[u8], dim: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if values.len() != dim {
        return Err(StoreError::InvalidDescriptorDim {
            expected: dim,
            got: values.len(),
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidDescriptorValue);
    }
    Ok(values)
}

fn validate_descriptor_values(values: &[f32]) -> Result<(), StoreError> {
    if values.is_empty() {
        return Err(StoreError::EmptyDescriptor);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidDescriptorValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about an active enrollment (no descriptor data).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EnrollmentInfo {
    pub id: String,
    pub identity_id: String,
    pub descriptor_dim: usize,
    pub image_url: String,
    pub image_sha256: String,
    pub captured_at: String,
    pub created_at: String,
    pub updated_at: String,
}

/// An active enrollment with its decrypted descriptor.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EnrollmentRecord {
    #[serde(flatten)]
    pub info: EnrollmentInfo,
    pub descriptor: Vec<f32>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
