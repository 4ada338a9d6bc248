//! Construction and signing of the transactions we sweep with.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, Sequence, Transaction, TxIn, TxOut, Witness};
use log::debug;

use crate::error::{Error, Result};
use crate::keys::CommitmentKeys;
use crate::output::TrackedOutput;
use crate::scripts;

/// Worst-case DER signature length, including the sighash byte
const MAX_SIGNATURE_LEN: u64 = 73;

fn sighash(
    tx: &Transaction,
    input: usize,
    wscript: &Script,
    amount_sat: u64,
) -> Result<Message> {
    let hash = SighashCache::new(tx)
        .p2wsh_signature_hash(input, wscript, Amount::from_sat(amount_sat), EcdsaSighashType::All)
        .map_err(|e| Error::InternalError(format!("sighash failed: {}", e)))?;
    Ok(Message::from_digest(hash.to_byte_array()))
}

/// Sign one P2WSH input
pub fn sign_tx_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input: usize,
    wscript: &Script,
    amount_sat: u64,
    privkey: &SecretKey,
) -> Result<Signature> {
    let msg = sighash(tx, input, wscript, amount_sat)?;
    Ok(secp.sign_ecdsa(&msg, privkey))
}

/// Check a counterparty signature over one P2WSH input
pub fn check_tx_sig(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input: usize,
    wscript: &Script,
    amount_sat: u64,
    pubkey: &PublicKey,
    sig: &Signature,
) -> bool {
    match sighash(tx, input, wscript, amount_sat) {
        Ok(msg) => secp.verify_ecdsa(&msg, sig, pubkey).is_ok(),
        Err(_) => false,
    }
}

/// DER signature plus the SIGHASH_ALL byte, as it goes on the witness
pub fn signature_to_vec(sig: Signature) -> Vec<u8> {
    let mut sigvec = sig.serialize_der().to_vec();
    sigvec.push(EcdsaSighashType::All as u8);
    sigvec
}

/// Sweep a tracked output to our wallet with a single-input transaction.
///
/// Covers both the delayed to-us spend (`sequence = to_self_delay`) and
/// the our-HTLC-on-their-commitment timeout spend (`sequence = 0`,
/// `locktime = cltv_expiry`).  If the output would not pay for itself on
/// top of the dust limit it is dropped and the whole value goes to fees.
#[allow(clippy::too_many_arguments)]
pub fn tx_to_us(
    secp: &Secp256k1<All>,
    out: &TrackedOutput,
    sequence: u32,
    locktime: u32,
    feerate_per_kw: u32,
    dust_limit_satoshi: u64,
    wscript: &Script,
    our_wallet_pubkey: &PublicKey,
    privkey: &SecretKey,
) -> Result<Transaction> {
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(locktime),
        input: vec![TxIn {
            previous_output: OutPoint { txid: out.txid, vout: out.outnum },
            script_sig: bitcoin::ScriptBuf::new(),
            sequence: Sequence(sequence),
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(out.satoshi),
            script_pubkey: scripts::p2wpkh(our_wallet_pubkey),
        }],
    };

    // Witness cost: count, length byte and worst-case signature, empty
    // secret, and the witness script itself
    let weight =
        tx.weight().to_wu() + 1 + 3 + MAX_SIGNATURE_LEN + wscript.as_bytes().len() as u64;
    let fee = feerate_per_kw as u64 * weight / 1000;

    if out.satoshi < dust_limit_satoshi + fee {
        debug!("sweep of {} sat not worth {} fee, spending to fees", out.satoshi, fee);
        tx.output.clear();
    } else {
        tx.output[0].value = Amount::from_sat(out.satoshi - fee);
    }

    let sig = sign_tx_input(secp, &tx, 0, wscript, out.satoshi, privkey)?;
    tx.input[0].witness = scripts::witness_secret_spend(&signature_to_vec(sig), None, wscript);
    Ok(tx)
}

/// Skeleton HTLC-timeout transaction: spends the offered HTLC output on
/// our own commitment into a fresh to-self delay.  The output value is
/// the full HTLC amount; the caller deducts the fee once it knows it.
pub fn htlc_timeout_tx(
    out: &TrackedOutput,
    cltv_expiry: u32,
    to_self_delay: u16,
    keys: &CommitmentKeys,
) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(cltv_expiry),
        input: vec![TxIn {
            previous_output: OutPoint { txid: out.txid, vout: out.outnum },
            script_sig: bitcoin::ScriptBuf::new(),
            sequence: Sequence(0),
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(out.satoshi),
            script_pubkey: scripts::to_self_wscript(to_self_delay, keys).to_p2wsh(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    use crate::keys::derive_keyset;
    use crate::output::{OutputType, TxType};

    fn secp() -> Secp256k1<All> {
        Secp256k1::new()
    }

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn pubkey(secp: &Secp256k1<All>, byte: u8) -> PublicKey {
        PublicKey::from_secret_key(secp, &key(byte))
    }

    fn tracked(satoshi: u64) -> TrackedOutput {
        TrackedOutput {
            tx_type: TxType::OurUnilateral,
            txid: Txid::from_byte_array([3; 32]),
            tx_blockheight: 100,
            outnum: 1,
            satoshi,
            output_type: OutputType::DelayedOutputToUs,
            proposal: None,
            resolved: None,
        }
    }

    fn test_keys(secp: &Secp256k1<All>) -> CommitmentKeys {
        derive_keyset(
            secp,
            &pubkey(secp, 1),
            &pubkey(secp, 2),
            &pubkey(secp, 3),
            &pubkey(secp, 4),
            &pubkey(secp, 5),
        )
        .unwrap()
    }

    #[test]
    fn sign_and_check_roundtrip() {
        let secp = secp();
        let keys = test_keys(&secp);
        let out = tracked(50_000);
        let tx = htlc_timeout_tx(&out, 500_000, 144, &keys);
        let wscript = scripts::to_self_wscript(144, &keys);

        let sig = sign_tx_input(&secp, &tx, 0, &wscript, out.satoshi, &key(7)).unwrap();
        assert!(check_tx_sig(&secp, &tx, 0, &wscript, out.satoshi, &pubkey(&secp, 7), &sig));
        // wrong key
        assert!(!check_tx_sig(&secp, &tx, 0, &wscript, out.satoshi, &pubkey(&secp, 8), &sig));
        // wrong amount changes the sighash
        assert!(!check_tx_sig(&secp, &tx, 0, &wscript, out.satoshi - 1, &pubkey(&secp, 7), &sig));
    }

    #[test]
    fn htlc_timeout_tx_shape() {
        let secp = secp();
        let keys = test_keys(&secp);
        let out = tracked(50_000);
        let tx = htlc_timeout_tx(&out, 500_000, 144, &keys);

        assert_eq!(tx.lock_time, LockTime::from_consensus(500_000));
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].sequence, Sequence(0));
        assert_eq!(tx.input[0].previous_output, OutPoint { txid: out.txid, vout: 1 });
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, Amount::from_sat(50_000));
        assert_eq!(
            tx.output[0].script_pubkey,
            scripts::to_self_wscript(144, &keys).to_p2wsh()
        );
    }

    #[test]
    fn tx_to_us_takes_fee_and_delay() {
        let secp = secp();
        let keys = test_keys(&secp);
        let out = tracked(50_000);
        let wscript = scripts::to_self_wscript(144, &keys);

        let tx = tx_to_us(&secp, &out, 144, 0, 1000, 546, &wscript, &pubkey(&secp, 9), &key(7))
            .unwrap();
        assert_eq!(tx.input[0].sequence, Sequence(144));
        assert_eq!(tx.lock_time, LockTime::ZERO);
        assert_eq!(tx.output.len(), 1);
        assert!(tx.output[0].value.to_sat() < 50_000);
        assert_eq!(tx.output[0].script_pubkey, scripts::p2wpkh(&pubkey(&secp, 9)));
        assert_eq!(tx.input[0].witness.len(), 3);

        // the signature commits to the final output amount
        let sig_der = &tx.input[0].witness.iter().next().unwrap();
        let sig = Signature::from_der(&sig_der[..sig_der.len() - 1]).unwrap();
        assert!(check_tx_sig(&secp, &tx, 0, &wscript, out.satoshi, &pubkey(&secp, 7), &sig));
    }

    #[test]
    fn tx_to_us_drops_dusty_output() {
        let secp = secp();
        let keys = test_keys(&secp);
        let out = tracked(700);
        let wscript = scripts::to_self_wscript(144, &keys);

        let tx = tx_to_us(&secp, &out, 0, 400_000, 1000, 546, &wscript, &pubkey(&secp, 9), &key(7))
            .unwrap();
        assert!(tx.output.is_empty());
        assert_eq!(tx.lock_time, LockTime::from_consensus(400_000));
        assert_eq!(tx.input[0].sequence, Sequence(0));
    }
}
