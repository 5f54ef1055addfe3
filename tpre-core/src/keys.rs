//! Long-lived key bundles for the three protocol roles.
//!
//! Every bundle can be generated from OS randomness or derived
//! deterministically from a seed. Deterministic derivation goes through the
//! library's key factory so that a persisted seed is sufficient to restore a
//! role's full key material; the worker keystore relies on this to avoid
//! serializing secret scalars.

use blake2::Blake2bVar;
use blake2::digest::{Update as _, VariableOutput as _};
use rand::RngCore as _;
use umbral_pre::{PublicKey, SecretKey, SecretKeyFactory, Signer};
use zeroize::Zeroizing;

const SIGNING_LABEL: &[u8] = b"tpre/signing";
const DECRYPTION_LABEL: &[u8] = b"tpre/decryption";
const DELEGATING_LABEL: &[u8] = b"tpre/delegating";
const PAYLOAD_LABEL_PREFIX: &[u8] = b"tpre/payload/";

/// Stretches an arbitrary-length seed into key-factory randomness.
fn factory_from_seed(seed: &[u8]) -> SecretKeyFactory {
    let size = SecretKeyFactory::seed_size();
    let mut hasher = Blake2bVar::new(size).expect("factory seed fits blake2b output bounds");
    hasher.update(seed);
    let mut stretched = Zeroizing::new(vec![0u8; size]);
    hasher
        .finalize_variable(&mut stretched)
        .expect("output buffer matches requested size");
    SecretKeyFactory::from_secure_randomness(&stretched)
        .expect("stretched seed has the advertised size")
}

fn derived_signer(factory: &SecretKeyFactory) -> Signer {
    Signer::new(factory.make_key(SIGNING_LABEL))
}

/// Key material of the party granting access.
///
/// Owns the long-lived signing key (the delegator's stable identity) and the
/// delegating decryption key. The per-policy payload keypair is derived on
/// demand from the label so that a grant is reproducible from the seed.
pub struct DelegatorKeys {
    factory: SecretKeyFactory,
    signer: Signer,
    verifying_pk: PublicKey,
    delegating_sk: SecretKey,
    delegating_pk: PublicKey,
}

impl DelegatorKeys {
    /// Generates a fresh bundle from OS randomness.
    pub fn random() -> Self {
        let mut seed = Zeroizing::new([0u8; 64]);
        rand::thread_rng().fill_bytes(seed.as_mut());
        Self::from_seed(seed.as_ref())
    }

    /// Derives the bundle deterministically from `seed`.
    pub fn from_seed(seed: &[u8]) -> Self {
        let factory = factory_from_seed(seed);
        let signer = derived_signer(&factory);
        let verifying_pk = signer.verifying_key();
        let delegating_sk = factory.make_key(DELEGATING_LABEL);
        let delegating_pk = delegating_sk.public_key();
        Self {
            factory,
            signer,
            verifying_pk,
            delegating_sk,
            delegating_pk,
        }
    }

    /// The signer backing this delegator's stable identity.
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Public half of the signing key; the identity delegatees verify.
    pub fn verifying_pk(&self) -> &PublicKey {
        &self.verifying_pk
    }

    /// Secret half of the delegating key.
    pub fn delegating_sk(&self) -> &SecretKey {
        &self.delegating_sk
    }

    /// Public half of the delegating key.
    pub fn delegating_pk(&self) -> &PublicKey {
        &self.delegating_pk
    }

    /// Derives the per-policy payload keypair for `label`.
    ///
    /// Deterministic: the same delegator seed and label always produce the
    /// same keypair, so a lost policy object can be re-derived.
    pub fn derive_payload_keys(&self, label: &[u8]) -> (SecretKey, PublicKey) {
        let mut derivation = Vec::with_capacity(PAYLOAD_LABEL_PREFIX.len() + label.len());
        derivation.extend_from_slice(PAYLOAD_LABEL_PREFIX);
        derivation.extend_from_slice(label);
        let sk = self.factory.make_key(&derivation);
        let pk = sk.public_key();
        (sk, pk)
    }
}

/// Key material of the party receiving access.
pub struct RetrieverKeys {
    signer: Signer,
    verifying_pk: PublicKey,
    decryption_sk: SecretKey,
    decryption_pk: PublicKey,
}

impl RetrieverKeys {
    /// Generates a fresh bundle from OS randomness.
    pub fn random() -> Self {
        let mut seed = Zeroizing::new([0u8; 64]);
        rand::thread_rng().fill_bytes(seed.as_mut());
        Self::from_seed(seed.as_ref())
    }

    /// Derives the bundle deterministically from `seed`.
    pub fn from_seed(seed: &[u8]) -> Self {
        let factory = factory_from_seed(seed);
        let signer = derived_signer(&factory);
        let verifying_pk = signer.verifying_key();
        let decryption_sk = factory.make_key(DECRYPTION_LABEL);
        let decryption_pk = decryption_sk.public_key();
        Self {
            signer,
            verifying_pk,
            decryption_sk,
            decryption_pk,
        }
    }

    /// The signer used to authenticate re-encryption requests.
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Public half of the signing key.
    pub fn verifying_pk(&self) -> &PublicKey {
        &self.verifying_pk
    }

    /// Secret half of the decryption key.
    pub fn decryption_sk(&self) -> &SecretKey {
        &self.decryption_sk
    }

    /// Public half of the decryption key; appears in every policy targeted
    /// at this retriever.
    pub fn decryption_pk(&self) -> &PublicKey {
        &self.decryption_pk
    }
}

/// Key material of a service node.
pub struct WorkerKeys {
    signer: Signer,
    verifying_pk: PublicKey,
    decryption_sk: SecretKey,
    decryption_pk: PublicKey,
}

impl WorkerKeys {
    /// Generates a fresh bundle from OS randomness.
    pub fn random() -> Self {
        let mut seed = Zeroizing::new([0u8; 64]);
        rand::thread_rng().fill_bytes(seed.as_mut());
        Self::from_seed(seed.as_ref())
    }

    /// Derives the bundle deterministically from `seed`.
    pub fn from_seed(seed: &[u8]) -> Self {
        let factory = factory_from_seed(seed);
        let signer = derived_signer(&factory);
        let verifying_pk = signer.verifying_key();
        let decryption_sk = factory.make_key(DECRYPTION_LABEL);
        let decryption_pk = decryption_sk.public_key();
        Self {
            signer,
            verifying_pk,
            decryption_sk,
            decryption_pk,
        }
    }

    /// The signer backing this worker's identity and response signatures.
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Public half of the signing key; the worker's node id derives from it.
    pub fn verifying_pk(&self) -> &PublicKey {
        &self.verifying_pk
    }

    /// Secret half of the decryption key, used to open enacted kfrags.
    pub fn decryption_sk(&self) -> &SecretKey {
        &self.decryption_sk
    }

    /// Public half of the decryption key; delegators encrypt kfrags to it.
    pub fn decryption_pk(&self) -> &PublicKey {
        &self.decryption_pk
    }
}
