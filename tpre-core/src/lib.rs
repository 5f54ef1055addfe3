#![deny(missing_docs, clippy::unwrap_used)]
//! Typed facade over the Umbral threshold proxy-re-encryption primitives.
//!
//! Every other crate in the workspace goes through this facade instead of
//! calling `umbral-pre` directly. The facade pins down the small set of
//! operations the protocol needs (encapsulation, kfrag generation and
//! verification, re-encryption, cfrag verification, threshold decryption)
//! and converts the library's error types into a single discriminated
//! [`CryptoError`] that callers can match on.
//!
//! All functions here are side-effect free. Long-running callers (the worker
//! service) are expected to move [`reencrypt`] and [`generate_kfrags`] onto a
//! blocking pool; nothing in this crate suspends.

use thiserror::Error;

pub mod keys;

pub use umbral_pre::{
    Capsule, CapsuleFrag, KeyFrag, PublicKey, SecretKey, Signature, Signer, VerifiedCapsuleFrag,
    VerifiedKeyFrag,
};

/// Discriminated error for every fallible facade operation.
///
/// The variants mirror the failure kinds of the protocol: callers never see
/// the underlying `umbral-pre` error types.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The plaintext could not be encapsulated under the given public key.
    #[error("encryption failed: {0}")]
    Encryption(String),
    /// The ciphertext failed its integrity check (wrong key material,
    /// truncated or tampered ciphertext).
    #[error("ciphertext integrity check failed: {0}")]
    BadCiphertext(String),
    /// A key fragment did not verify under the expected keys.
    #[error("key fragment verification failed: {0}")]
    BadKfragSignature(String),
    /// A capsule fragment's correctness proof did not verify.
    #[error("capsule fragment proof invalid: {0}")]
    BadProof(String),
    /// Fewer verified capsule fragments than the policy threshold.
    #[error("not enough capsule fragments: got {got}, need {need}")]
    NotEnough {
        /// Number of fragments supplied.
        got: usize,
        /// The policy threshold.
        need: usize,
    },
    /// Threshold parameters violate `1 <= m <= n`.
    #[error("invalid threshold: {threshold}-of-{shares}")]
    InvalidThreshold {
        /// Requested threshold `m`.
        threshold: usize,
        /// Requested share count `n`.
        shares: usize,
    },
}

/// Generates a fresh keypair from OS randomness.
pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let sk = SecretKey::random();
    let pk = sk.public_key();
    (sk, pk)
}

/// Encrypts `plaintext` under `pk`.
///
/// The symmetric data-encryption key is encapsulated in the returned
/// [`Capsule`]; the ciphertext is authenticated and bound to the capsule.
pub fn encrypt(pk: &PublicKey, plaintext: &[u8]) -> Result<(Capsule, Vec<u8>), CryptoError> {
    let (capsule, ciphertext) =
        umbral_pre::encrypt(pk, plaintext).map_err(|err| CryptoError::Encryption(err.to_string()))?;
    Ok((capsule, ciphertext.into_vec()))
}

/// Opens a capsule with the original decryption key and decrypts `ciphertext`.
pub fn decrypt_original(
    sk: &SecretKey,
    capsule: &Capsule,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let plaintext = umbral_pre::decrypt_original(sk, capsule, ciphertext)
        .map_err(|err| CryptoError::BadCiphertext(err.to_string()))?;
    Ok(plaintext.into_vec())
}

/// Splits the re-encryption key `delegating_sk -> receiving_pk` into `shares`
/// key fragments, any `threshold` of which suffice to re-encrypt.
///
/// Each fragment carries an internal signature from `signer`; the optional
/// `sign_delegating`/`sign_receiving` flags extend that signature over the
/// respective public keys so holders can verify which delegation the
/// fragment belongs to.
pub fn generate_kfrags(
    delegating_sk: &SecretKey,
    receiving_pk: &PublicKey,
    signer: &Signer,
    threshold: usize,
    shares: usize,
    sign_delegating: bool,
    sign_receiving: bool,
) -> Result<Vec<VerifiedKeyFrag>, CryptoError> {
    if threshold == 0 || threshold > shares {
        return Err(CryptoError::InvalidThreshold { threshold, shares });
    }
    Ok(umbral_pre::generate_kfrags(
        delegating_sk,
        receiving_pk,
        signer,
        threshold,
        shares,
        sign_delegating,
        sign_receiving,
    )
    .into_vec())
}

/// Verifies a key fragment received over the wire.
///
/// `delegating_pk`/`receiving_pk` must be supplied iff the fragment was
/// generated with the corresponding `sign_*` flag set.
pub fn verify_kfrag(
    kfrag: KeyFrag,
    verifying_pk: &PublicKey,
    delegating_pk: Option<&PublicKey>,
    receiving_pk: Option<&PublicKey>,
) -> Result<VerifiedKeyFrag, CryptoError> {
    kfrag
        .verify(verifying_pk, delegating_pk, receiving_pk)
        .map_err(|(err, _)| CryptoError::BadKfragSignature(err.to_string()))
}

/// Re-encrypts a capsule with a verified key fragment.
///
/// Deterministic except for the proof randomization scalar, which the
/// resulting fragment's correctness proof covers. Infallible: the fragment
/// was already verified and the capsule is self-contained.
pub fn reencrypt(capsule: &Capsule, kfrag: VerifiedKeyFrag) -> VerifiedCapsuleFrag {
    umbral_pre::reencrypt(capsule, kfrag)
}

/// Verifies a capsule fragment's correctness proof against the capsule and
/// the three keys of the delegation.
pub fn verify_cfrag(
    cfrag: CapsuleFrag,
    capsule: &Capsule,
    verifying_pk: &PublicKey,
    delegating_pk: &PublicKey,
    receiving_pk: &PublicKey,
) -> Result<VerifiedCapsuleFrag, CryptoError> {
    cfrag
        .verify(capsule, verifying_pk, delegating_pk, receiving_pk)
        .map_err(|(err, _)| CryptoError::BadProof(err.to_string()))
}

/// Combines `threshold` or more verified capsule fragments and decrypts
/// `ciphertext`.
///
/// Fails with [`CryptoError::NotEnough`] before touching the capsule when
/// fewer fragments than the threshold are supplied, so the distinction
/// between "too few shares" and "bad shares" is visible to callers.
pub fn decrypt_reencrypted(
    receiving_sk: &SecretKey,
    delegating_pk: &PublicKey,
    capsule: &Capsule,
    threshold: usize,
    cfrags: Vec<VerifiedCapsuleFrag>,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if cfrags.len() < threshold {
        return Err(CryptoError::NotEnough {
            got: cfrags.len(),
            need: threshold,
        });
    }
    let plaintext =
        umbral_pre::decrypt_reencrypted(receiving_sk, delegating_pk, capsule, cfrags, ciphertext)
            .map_err(|err| CryptoError::BadCiphertext(err.to_string()))?;
    Ok(plaintext.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{DelegatorKeys, RetrieverKeys};

    fn delegation(threshold: usize, shares: usize) -> (DelegatorKeys, RetrieverKeys, Vec<VerifiedKeyFrag>) {
        let delegator = DelegatorKeys::from_seed(b"facade-test-delegator");
        let retriever = RetrieverKeys::from_seed(b"facade-test-retriever");
        let kfrags = generate_kfrags(
            delegator.delegating_sk(),
            retriever.decryption_pk(),
            delegator.signer(),
            threshold,
            shares,
            true,
            true,
        )
        .expect("valid threshold");
        (delegator, retriever, kfrags)
    }

    #[test]
    fn round_trip_any_threshold_subset() {
        let (delegator, retriever, kfrags) = delegation(2, 3);
        let plaintext = b"peace at dawn";
        let (capsule, ciphertext) =
            encrypt(delegator.delegating_pk(), plaintext).expect("encrypts");

        // every 2-subset of the 3 kfrags must decrypt
        for skip in 0..3 {
            let cfrags = kfrags
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, kfrag)| reencrypt(&capsule, kfrag.clone()))
                .collect::<Vec<_>>();
            let recovered = decrypt_reencrypted(
                retriever.decryption_sk(),
                delegator.delegating_pk(),
                &capsule,
                2,
                cfrags,
                &ciphertext,
            )
            .expect("threshold met");
            assert_eq!(recovered, plaintext);
        }
    }

    #[test]
    fn below_threshold_fails_not_enough() {
        let (delegator, retriever, kfrags) = delegation(2, 3);
        let (capsule, ciphertext) = encrypt(delegator.delegating_pk(), b"secret").expect("encrypts");
        let cfrags = vec![reencrypt(&capsule, kfrags[0].clone())];
        let err = decrypt_reencrypted(
            retriever.decryption_sk(),
            delegator.delegating_pk(),
            &capsule,
            2,
            cfrags,
            &ciphertext,
        )
        .expect_err("one cfrag is not enough");
        assert!(matches!(err, CryptoError::NotEnough { got: 1, need: 2 }));
    }

    #[test]
    fn threshold_bounds_one_and_n() {
        for (m, n) in [(1, 1), (1, 5), (5, 5)] {
            let (delegator, retriever, kfrags) = delegation(m, n);
            let (capsule, ciphertext) =
                encrypt(delegator.delegating_pk(), b"boundary").expect("encrypts");
            let cfrags = kfrags
                .iter()
                .take(m)
                .map(|kfrag| reencrypt(&capsule, kfrag.clone()))
                .collect::<Vec<_>>();
            let recovered = decrypt_reencrypted(
                retriever.decryption_sk(),
                delegator.delegating_pk(),
                &capsule,
                m,
                cfrags,
                &ciphertext,
            )
            .expect("m-of-n decrypts");
            assert_eq!(recovered, b"boundary");
        }
    }

    #[test]
    fn invalid_threshold_rejected() {
        let delegator = DelegatorKeys::from_seed(b"bad-threshold");
        let retriever = RetrieverKeys::from_seed(b"bad-threshold-bob");
        for (m, n) in [(0, 3), (4, 3)] {
            let err = generate_kfrags(
                delegator.delegating_sk(),
                retriever.decryption_pk(),
                delegator.signer(),
                m,
                n,
                true,
                true,
            )
            .expect_err("threshold out of bounds");
            assert!(matches!(err, CryptoError::InvalidThreshold { .. }));
        }
    }

    #[test]
    fn foreign_kfrag_fails_verification() {
        let (delegator, retriever, kfrags) = delegation(2, 3);
        let other = DelegatorKeys::from_seed(b"some-other-delegator");
        let kfrag = kfrags[0].clone().unverify();
        let err = verify_kfrag(
            kfrag,
            other.verifying_pk(),
            Some(delegator.delegating_pk()),
            Some(retriever.decryption_pk()),
        )
        .expect_err("wrong verifying key");
        assert!(matches!(err, CryptoError::BadKfragSignature(_)));
    }

    #[test]
    fn cfrag_for_other_capsule_fails_proof() {
        let (delegator, retriever, kfrags) = delegation(1, 1);
        let (capsule_a, _) = encrypt(delegator.delegating_pk(), b"a").expect("encrypts");
        let (capsule_b, _) = encrypt(delegator.delegating_pk(), b"b").expect("encrypts");
        let cfrag = reencrypt(&capsule_a, kfrags[0].clone()).unverify();
        let err = verify_cfrag(
            cfrag,
            &capsule_b,
            delegator.verifying_pk(),
            delegator.delegating_pk(),
            retriever.decryption_pk(),
        )
        .expect_err("proof is bound to capsule_a");
        assert!(matches!(err, CryptoError::BadProof(_)));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let delegator = DelegatorKeys::from_seed(b"tamper");
        let (capsule, mut ciphertext) =
            encrypt(delegator.delegating_pk(), b"untouchable").expect("encrypts");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        let err = decrypt_original(delegator.delegating_sk(), &capsule, &ciphertext)
            .expect_err("tampering must fail the DEM");
        assert!(matches!(err, CryptoError::BadCiphertext(_)));
    }
}
