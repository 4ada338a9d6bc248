//! Channel key derivation.
//!
//! The channel seed expands into basepoint secrets and the commitment
//! seed with HKDF-SHA256; per-commitment keys are then derived with the
//! BOLT #3 `SHA256(per_commitment_point || basepoint)` tweak.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use lightning::ln::chan_utils::{build_commitment_secret, CounterpartyCommitmentSecrets};
use lightning::ln::channel_keys::{
    DelayedPaymentBasepoint, DelayedPaymentKey, RevocationBasepoint, RevocationKey,
};
use onchain_protocol::model::ShachainSecret;

use crate::error::{Error, Result};

/// Commitment secret indexes count down from here, commitment numbers up
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

fn hkdf_extract_expand(salt: &[u8], secret: &[u8], info: &[u8], output: &mut [u8]) {
    let mut hmac = HmacEngine::<Sha256>::new(salt);
    hmac.input(secret);
    let prk = Hmac::from_engine(hmac).to_byte_array();

    let mut t = [0; 32];
    let mut n: u8 = 0;

    for chunk in output.chunks_mut(32) {
        let mut hmac = HmacEngine::<Sha256>::new(&prk[..]);
        n += 1;
        if n != 1 {
            hmac.input(&t);
        }
        hmac.input(info);
        hmac.input(&[n]);
        t = Hmac::from_engine(hmac).to_byte_array();
        chunk.copy_from_slice(&t);
    }
}

/// The local basepoints for this channel
#[derive(Clone, Debug)]
pub struct Basepoints {
    pub revocation: PublicKey,
    pub payment: PublicKey,
    pub delayed_payment: PublicKey,
}

/// The secrets behind [`Basepoints`]
#[derive(Clone)]
pub struct BasepointSecrets {
    pub revocation: SecretKey,
    pub payment: SecretKey,
    pub delayed_payment: SecretKey,
}

/// Expand the channel seed into basepoints, their secrets and the
/// commitment seed.  The 192-byte layout is shared with the channel
/// daemon: funding, revocation, htlc, payment, delayed payment,
/// commitment seed; this engine only consumes the last four slots it
/// needs.
pub fn derive_basepoints(
    secp: &Secp256k1<All>,
    seed: &[u8; 32],
) -> Result<(Basepoints, BasepointSecrets, [u8; 32])> {
    let mut keys_buf = [0u8; 32 * 6];
    hkdf_extract_expand(&[], seed, "c-lightning".as_bytes(), &mut keys_buf);

    let secret_at = |ndx: usize| -> Result<SecretKey> {
        SecretKey::from_slice(&keys_buf[ndx * 32..(ndx + 1) * 32])
            .map_err(|_| Error::CryptoFailed(format!("basepoint secret {} out of range", ndx)))
    };

    let revocation = secret_at(1)?;
    let payment = secret_at(3)?;
    let delayed_payment = secret_at(4)?;
    let mut commitment_seed = [0u8; 32];
    commitment_seed.copy_from_slice(&keys_buf[5 * 32..6 * 32]);

    let basepoints = Basepoints {
        revocation: PublicKey::from_secret_key(secp, &revocation),
        payment: PublicKey::from_secret_key(secp, &payment),
        delayed_payment: PublicKey::from_secret_key(secp, &delayed_payment),
    };
    let secrets = BasepointSecrets { revocation, payment, delayed_payment };
    Ok((basepoints, secrets, commitment_seed))
}

/// Per-commitment secret for one of our own commitments
pub fn per_commitment_secret(commitment_seed: &[u8; 32], commit_num: u64) -> Result<SecretKey> {
    let idx = INITIAL_COMMITMENT_NUMBER
        .checked_sub(commit_num)
        .ok_or_else(|| Error::InternalError(format!("commitment number {} out of range", commit_num)))?;
    SecretKey::from_slice(&build_commitment_secret(commitment_seed, idx))
        .map_err(|_| Error::CryptoFailed(format!("per-commitment secret for {}", commit_num)))
}

/// Per-commitment point for one of our own commitments
pub fn per_commitment_point(
    secp: &Secp256k1<All>,
    commitment_seed: &[u8; 32],
    commit_num: u64,
) -> Result<PublicKey> {
    let secret = per_commitment_secret(commitment_seed, commit_num)?;
    Ok(PublicKey::from_secret_key(secp, &secret))
}

/// `basepoint + SHA256(per_commitment_point || basepoint) * G`
pub fn derive_public_key(
    secp: &Secp256k1<All>,
    per_commitment_point: &PublicKey,
    base_point: &PublicKey,
) -> Result<PublicKey> {
    let mut sha = Sha256::engine();
    sha.input(&per_commitment_point.serialize());
    sha.input(&base_point.serialize());
    let res = Sha256::from_engine(sha).to_byte_array();

    let tweak = SecretKey::from_slice(&res)
        .map_err(|_| Error::CryptoFailed("derivation tweak out of range".to_string()))?;
    base_point
        .combine(&PublicKey::from_secret_key(secp, &tweak))
        .map_err(|_| Error::CryptoFailed("derived key is infinity".to_string()))
}

/// The four keys of one commitment transaction, named from the
/// broadcaster's point of view as BOLT #3 does
#[derive(Clone, Debug)]
pub struct CommitmentKeys {
    pub self_revocation_key: RevocationKey,
    pub self_delayed_payment_key: DelayedPaymentKey,
    pub self_payment_key: PublicKey,
    pub other_payment_key: PublicKey,
}

/// Derive the keyset for a commitment.  `self_` here is the side that
/// broadcast the commitment, so the revocation basepoint comes from the
/// other side.
pub fn derive_keyset(
    secp: &Secp256k1<All>,
    per_commitment_point: &PublicKey,
    self_payment_basepoint: &PublicKey,
    other_payment_basepoint: &PublicKey,
    self_delayed_payment_basepoint: &PublicKey,
    other_revocation_basepoint: &PublicKey,
) -> Result<CommitmentKeys> {
    Ok(CommitmentKeys {
        self_revocation_key: RevocationKey::from_basepoint(
            secp,
            &RevocationBasepoint::from(*other_revocation_basepoint),
            per_commitment_point,
        ),
        self_delayed_payment_key: DelayedPaymentKey::from_basepoint(
            secp,
            &DelayedPaymentBasepoint::from(*self_delayed_payment_basepoint),
            per_commitment_point,
        ),
        self_payment_key: derive_public_key(secp, per_commitment_point, self_payment_basepoint)?,
        other_payment_key: derive_public_key(secp, per_commitment_point, other_payment_basepoint)?,
    })
}

/// The shachain of revocation secrets the counterparty has released to us
pub struct RevocationStore {
    secrets: CounterpartyCommitmentSecrets,
}

impl RevocationStore {
    /// Rebuild the store from the wire entries.  Entries are replayed in
    /// reception order (descending index) so the consistency checks the
    /// counterparty originally passed still hold.
    pub fn from_entries(entries: &[ShachainSecret]) -> Result<Self> {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| b.index.cmp(&a.index));

        let mut secrets = CounterpartyCommitmentSecrets::new();
        for entry in sorted {
            if entry.index > INITIAL_COMMITMENT_NUMBER {
                return Err(Error::BadCommand(format!(
                    "shachain index {} out of range",
                    entry.index
                )));
            }
            secrets
                .provide_secret(entry.index, entry.secret.0)
                .map_err(|()| Error::BadCommand("inconsistent shachain".to_string()))?;
        }
        Ok(RevocationStore { secrets })
    }

    /// How many revocations the counterparty has given us
    pub fn revocations_received(&self) -> u64 {
        (1 << 48) - self.secrets.get_min_seen_secret()
    }

    /// Revocation preimage for a commitment number, if the counterparty
    /// has already revoked it
    pub fn revocation_preimage(&self, commit_num: u64) -> Option<[u8; 32]> {
        let idx = INITIAL_COMMITMENT_NUMBER.checked_sub(commit_num)?;
        if idx < self.secrets.get_min_seen_secret() {
            return None;
        }
        self.secrets.get_secret(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onchain_protocol::model::Secret;

    fn test_secp() -> Secp256k1<All> {
        Secp256k1::new()
    }

    #[test]
    fn derive_basepoints_is_deterministic() {
        let secp = test_secp();
        let (points_a, secrets_a, seed_a) = derive_basepoints(&secp, &[42; 32]).unwrap();
        let (points_b, _, seed_b) = derive_basepoints(&secp, &[42; 32]).unwrap();
        assert_eq!(points_a.revocation, points_b.revocation);
        assert_eq!(points_a.payment, points_b.payment);
        assert_eq!(points_a.delayed_payment, points_b.delayed_payment);
        assert_eq!(seed_a, seed_b);
        assert_eq!(
            PublicKey::from_secret_key(&secp, &secrets_a.payment),
            points_a.payment
        );

        let (points_c, _, seed_c) = derive_basepoints(&secp, &[43; 32]).unwrap();
        assert_ne!(points_a.payment, points_c.payment);
        assert_ne!(seed_a, seed_c);
    }

    #[test]
    fn per_commitment_point_matches_secret() {
        let secp = test_secp();
        let (_, _, commitment_seed) = derive_basepoints(&secp, &[1; 32]).unwrap();
        let secret = per_commitment_secret(&commitment_seed, 5).unwrap();
        let point = per_commitment_point(&secp, &commitment_seed, 5).unwrap();
        assert_eq!(PublicKey::from_secret_key(&secp, &secret), point);
        assert_ne!(point, per_commitment_point(&secp, &commitment_seed, 6).unwrap());
    }

    #[test]
    fn derived_key_matches_derived_secret() {
        let secp = test_secp();
        let (points, secrets, seed) = derive_basepoints(&secp, &[7; 32]).unwrap();
        let point = per_commitment_point(&secp, &seed, 3).unwrap();

        let pubkey = derive_public_key(&secp, &point, &points.payment).unwrap();
        let privkey =
            lightning::ln::chan_utils::derive_private_key(&secp, &point, &secrets.payment);
        assert_eq!(PublicKey::from_secret_key(&secp, &privkey), pubkey);
    }

    #[test]
    fn revocation_store_counts_and_lookup() {
        let empty = RevocationStore::from_entries(&[]).unwrap();
        assert_eq!(empty.revocations_received(), 0);
        assert_eq!(empty.revocation_preimage(0), None);

        // Counterparty released secrets for commitments 0 and 1
        let their_seed = [9u8; 32];
        let entries: Vec<ShachainSecret> = (0..2)
            .map(|commit_num| {
                let idx = INITIAL_COMMITMENT_NUMBER - commit_num;
                ShachainSecret {
                    index: idx,
                    secret: Secret(build_commitment_secret(&their_seed, idx)),
                }
            })
            .collect();
        let store = RevocationStore::from_entries(&entries).unwrap();
        assert_eq!(store.revocations_received(), 2);
        assert!(store.revocation_preimage(0).is_some());
        assert!(store.revocation_preimage(1).is_some());
        assert_eq!(store.revocation_preimage(2), None);
        assert_eq!(
            store.revocation_preimage(1),
            Some(build_commitment_secret(&their_seed, INITIAL_COMMITMENT_NUMBER - 1))
        );
    }

    #[test]
    fn revocation_store_rejects_garbage() {
        let entries = vec![
            ShachainSecret { index: INITIAL_COMMITMENT_NUMBER, secret: Secret([1; 32]) },
            ShachainSecret { index: INITIAL_COMMITMENT_NUMBER - 1, secret: Secret([2; 32]) },
        ];
        assert!(RevocationStore::from_entries(&entries).is_err());
    }
}
