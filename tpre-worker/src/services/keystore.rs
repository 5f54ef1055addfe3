//! Persistent key material behind a passphrase-gated envelope.
//!
//! The worker's secrets (its key seed and its kfrag store) rest on disk
//! sealed with XChaCha20-Poly1305 under a key derived from the operator
//! passphrase via HKDF-SHA256 and a per-file random salt. Files are written
//! to a temporary name and renamed into place.
//!
//! [`SecretStore`] is the pluggable interface; deployments with a hosted
//! secret manager implement it against their backend, the bundled
//! [`FileKeystore`] covers single-host operation.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead as _, KeyInit as _};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use eyre::Context as _;
use hkdf::Hkdf;
use rand::RngCore as _;
use secrecy::{ExposeSecret as _, SecretString};
use sha2::Sha256;
use std::sync::Arc;
use tpre_types::Hrac;
use zeroize::Zeroizing;

use crate::services::kfrag_store::StoredKfrag;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const SEED_LEN: usize = 64;
const ENVELOPE_INFO: &[u8] = b"tpre/keystore/v1";

/// Pluggable persistence for the worker's secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Loads the worker's key seed, creating and persisting a fresh one on
    /// first start.
    async fn load_or_create_worker_seed(&self) -> eyre::Result<Zeroizing<Vec<u8>>>;

    /// Loads the persisted kfrag store; empty on first start.
    async fn load_kfrags(&self) -> eyre::Result<HashMap<Hrac, StoredKfrag>>;

    /// Persists the kfrag store.
    async fn save_kfrags(&self, kfrags: &HashMap<Hrac, StoredKfrag>) -> eyre::Result<()>;
}

/// Shared handle to a secret store implementation.
pub type SecretStoreService = Arc<dyn SecretStore>;

/// File-based [`SecretStore`] sealing everything under one passphrase.
pub struct FileKeystore {
    dir: PathBuf,
    passphrase: SecretString,
}

impl FileKeystore {
    /// Opens (and creates, if missing) the keystore directory.
    pub async fn init(dir: PathBuf, passphrase: SecretString) -> eyre::Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .context(format!("while creating keystore dir {}", dir.display()))?;
        Ok(Self { dir, passphrase })
    }

    fn seed_path(&self) -> PathBuf {
        self.dir.join("worker-seed.sealed")
    }

    fn kfrags_path(&self) -> PathBuf {
        self.dir.join("kfrags.sealed")
    }

    fn seal(&self, plaintext: &[u8]) -> eyre::Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);
        let cipher = XChaCha20Poly1305::new(&self.derive_key(&salt).into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| eyre::eyre!("envelope encryption failed"))?;
        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open_envelope(&self, bytes: &[u8]) -> eyre::Result<Zeroizing<Vec<u8>>> {
        if bytes.len() < SALT_LEN + NONCE_LEN {
            eyre::bail!("sealed envelope is truncated");
        }
        let (salt, rest) = bytes.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(&self.derive_key(salt).into());
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| eyre::eyre!("envelope decryption failed (wrong passphrase?)"))?;
        Ok(Zeroizing::new(plaintext))
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.passphrase.expose_secret().as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(ENVELOPE_INFO, &mut okm)
            .expect("32 bytes is a valid hkdf output length");
        okm
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> eyre::Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .context(format!("while writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .context(format!("while installing {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileKeystore {
    async fn load_or_create_worker_seed(&self) -> eyre::Result<Zeroizing<Vec<u8>>> {
        let path = self.seed_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let seed = self.open_envelope(&bytes)?;
                eyre::ensure!(
                    seed.len() == SEED_LEN,
                    "worker seed has unexpected length {}",
                    seed.len()
                );
                Ok(seed)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::info!("no worker seed found, generating a fresh one");
                let mut seed = Zeroizing::new(vec![0u8; SEED_LEN]);
                rand::thread_rng().fill_bytes(seed.as_mut());
                let sealed = self.seal(&seed)?;
                self.write_atomic(&path, &sealed).await?;
                Ok(seed)
            }
            Err(err) => {
                Err(err).context(format!("while reading worker seed {}", path.display()))
            }
        }
    }

    async fn load_kfrags(&self) -> eyre::Result<HashMap<Hrac, StoredKfrag>> {
        let path = self.kfrags_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(err).context(format!("while reading kfrag store {}", path.display()));
            }
        };
        let plaintext = self.open_envelope(&bytes)?;
        ciborium::from_reader(plaintext.as_slice()).context("while decoding kfrag store")
    }

    async fn save_kfrags(&self, kfrags: &HashMap<Hrac, StoredKfrag>) -> eyre::Result<()> {
        let mut plaintext = Zeroizing::new(Vec::new());
        ciborium::into_writer(kfrags, &mut *plaintext).context("while encoding kfrag store")?;
        let sealed = self.seal(&plaintext)?;
        self.write_atomic(&self.kfrags_path(), &sealed).await
    }
}
