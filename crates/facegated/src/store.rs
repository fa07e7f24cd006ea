use crate::reference::StoredReference;
use facegate_core::Descriptor;
use std::path::Path;
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
    #[error("email already registered")]
    EmailExists,
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidDescriptorValue,
    #[error("unknown reference kind: {0}")]
    UnknownReferenceKind(String),
    #[error("reference URL is not valid UTF-8")]
    InvalidUrl,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// Raw `accounts` row, before the reference is decrypted.
type AccountRow = (String, String, String, String, String, Vec<u8>, Option<String>, String);

/// Profile fields supplied at registration.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

/// A registered account and its reference.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub reference: StoredReference,
    pub created_at: String,
}

/// SQLite-backed account storage.
///
/// Reference descriptors are encrypted with AES-256-GCM before storage.
/// A per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600). Reference URLs are stored as plain text.
#[derive(Clone)]
pub struct AccountStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl AccountStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/facegate"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS accounts (
                     id TEXT PRIMARY KEY,
                     email TEXT NOT NULL UNIQUE,
                     first_name TEXT NOT NULL,
                     last_name TEXT NOT NULL,
                     reference_kind TEXT NOT NULL,
                     reference BLOB NOT NULL,
                     model_version TEXT,
                     created_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Insert a new account. Returns the generated UUID, or
    /// [`StoreError::EmailExists`] when the email is taken.
    pub async fn insert(
        &self,
        account: NewAccount,
        reference: &StoredReference,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let kind = reference.kind();

        let (blob, model_version) = match reference {
            StoredReference::Descriptor(descriptor) => (
                self.encrypt_descriptor(&descriptor.values)?,
                descriptor.model_version.clone(),
            ),
            StoredReference::Url(url) => (url.as_bytes().to_vec(), None),
        };

        let id_clone = id.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO accounts (id, email, first_name, last_name,
                                           reference_kind, reference, model_version, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        id_clone,
                        account.email,
                        account.first_name,
                        account.last_name,
                        kind,
                        blob,
                        model_version,
                        created_at
                    ],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if !inserted {
            return Err(StoreError::EmailExists);
        }
        Ok(id)
    }

    /// Look up an account by email, decrypting its reference.
    pub async fn get_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        let email = email.to_string();

        // Fetch the raw row; decrypt outside the blocking closure
        let row: Option<AccountRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, email, first_name, last_name,
                            reference_kind, reference, model_version, created_at
                     FROM accounts WHERE email = ?1",
                )?;
                let mut rows = stmt.query_map([&email], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await?;

        let Some((id, email, first_name, last_name, kind, blob, model_version, created_at)) = row
        else {
            return Ok(None);
        };

        let reference = match kind.as_str() {
            "descriptor" => StoredReference::Descriptor(Descriptor {
                values: self.decrypt_descriptor(&blob)?,
                model_version,
            }),
            "url" => {
                StoredReference::Url(String::from_utf8(blob).map_err(|_| StoreError::InvalidUrl)?)
            }
            other => return Err(StoreError::UnknownReferenceKind(other.to_string())),
        };

        Ok(Some(Account {
            id,
            email,
            first_name,
            last_name,
            reference,
            created_at,
        }))
    }

    /// Count registered accounts.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_descriptor_values(values)?;
        let plaintext = descriptor_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_descriptor(&plaintext)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one
/// with mode 0600.
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

fn bytes_to_descriptor(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    validate_descriptor_values(&values)?;
    Ok(values)
}

fn validate_descriptor_values(values: &[f32]) -> Result<(), StoreError> {
    if values.is_empty() {
        return Err(StoreError::InvalidBlob(0));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidDescriptorValue);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> NewAccount {
        NewAccount {
            email: "alice@example.com".into(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
        }
    }

    fn descriptor() -> Descriptor {
        Descriptor {
            values: (0..512).map(|i| i as f32 / 512.0).collect(),
            model_version: Some("w600k_r50".to_string()),
        }
    }

    #[tokio::test]
    async fn test_descriptor_roundtrip() {
        let store = AccountStore::open(Path::new(":memory:")).await.unwrap();
        let reference = StoredReference::Descriptor(descriptor());

        let id = store.insert(alice(), &reference).await.unwrap();
        let account = store.get_by_email("alice@example.com").await.unwrap().unwrap();

        assert_eq!(account.id, id);
        assert_eq!(account.first_name, "Alice");
        assert_eq!(account.last_name, "Liddell");
        assert_eq!(account.reference, reference);
    }

    #[tokio::test]
    async fn test_url_roundtrip() {
        let store = AccountStore::open(Path::new(":memory:")).await.unwrap();
        let reference = StoredReference::Url("https://cdn.example.com/alice.jpg".into());
        store.insert(alice(), &reference).await.unwrap();

        let account = store.get_by_email("alice@example.com").await.unwrap().unwrap();
        assert_eq!(account.reference, reference);
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = AccountStore::open(Path::new(":memory:")).await.unwrap();
        let reference = StoredReference::Descriptor(descriptor());
        store.insert(alice(), &reference).await.unwrap();

        let err = store.insert(alice(), &reference).await.unwrap_err();
        assert!(matches!(err, StoreError::EmailExists));
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_email() {
        let store = AccountStore::open(Path::new(":memory:")).await.unwrap();
        assert!(store.get_by_email("nobody@example.com").await.unwrap().is_none());
        assert_eq!(store.count_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_descriptor_stored_encrypted() {
        let store = AccountStore::open(Path::new(":memory:")).await.unwrap();
        let values = descriptor().values;
        let blob = store.encrypt_descriptor(&values).unwrap();

        assert_eq!(blob.len(), NONCE_LEN + values.len() * 4 + 16);
        assert_ne!(&blob[NONCE_LEN..NONCE_LEN + 8], &descriptor_to_bytes(&values)[..8]);
        assert_eq!(store.decrypt_descriptor(&blob).unwrap(), values);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_decryption() {
        let store = AccountStore::open(Path::new(":memory:")).await.unwrap();
        let blob = store.encrypt_descriptor(&descriptor().values).unwrap();

        let mut other = store.clone();
        other.enc_key = [7u8; 32];
        let err = other.decrypt_descriptor(&blob).unwrap_err();
        assert!(matches!(err, StoreError::DecryptionFailed));
    }

    #[test]
    fn test_rejects_non_finite_values() {
        let err = validate_descriptor_values(&[0.5, f32::NAN]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDescriptorValue));

        let bytes = descriptor_to_bytes(&[f32::INFINITY]);
        let err = bytes_to_descriptor(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDescriptorValue));
    }

    #[test]
    fn test_rejects_truncated_blob() {
        let err = bytes_to_descriptor(&[0u8; 7]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlob(7)));
    }

    #[test]
    fn test_byte_fidelity() {
        let values = [0.0, -0.0, 1.0, -1.0, f32::MIN_POSITIVE, std::f32::consts::PI];
        let recovered = bytes_to_descriptor(&descriptor_to_bytes(&values)).unwrap();
        for (orig, rec) in values.iter().zip(recovered.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }
}
