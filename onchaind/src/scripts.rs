//! Commitment output scripts and the witnesses that spend them.
//!
//! The revokeable to-self script comes straight from the `lightning`
//! crate; the HTLC scripts are built here because the engine only holds
//! the ripemd160 of each payment hash, not the hash itself.

use bitcoin::hashes::Hash;
use bitcoin::opcodes;
use bitcoin::script::Builder;
use bitcoin::{PubkeyHash, Script, ScriptBuf, WPubkeyHash, Witness};
use bitcoin::secp256k1::PublicKey;
use lightning::ln::chan_utils::get_revokeable_redeemscript;
use onchain_protocol::model::{HtlcStub, Side};

use crate::keys::CommitmentKeys;

/// The to-self output script: revocable immediately by the other side,
/// spendable by the broadcaster after `to_self_delay`
pub fn to_self_wscript(to_self_delay: u16, keys: &CommitmentKeys) -> ScriptBuf {
    get_revokeable_redeemscript(
        &keys.self_revocation_key,
        to_self_delay,
        &keys.self_delayed_payment_key,
    )
}

/// Witness script for an HTLC the broadcaster offered
pub fn offered_htlc_wscript(keys: &CommitmentKeys, payment_ripemd: &[u8; 20]) -> ScriptBuf {
    let revocation_hash =
        PubkeyHash::hash(&keys.self_revocation_key.to_public_key().serialize()).to_byte_array();
    Builder::new()
        .push_opcode(opcodes::all::OP_DUP)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(&revocation_hash)
        .push_opcode(opcodes::all::OP_EQUAL)
        .push_opcode(opcodes::all::OP_IF)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ELSE)
        .push_slice(&keys.other_payment_key.serialize())
        .push_opcode(opcodes::all::OP_SWAP)
        .push_opcode(opcodes::all::OP_SIZE)
        .push_int(32)
        .push_opcode(opcodes::all::OP_EQUAL)
        .push_opcode(opcodes::all::OP_NOTIF)
        .push_int(2)
        .push_opcode(opcodes::all::OP_SWAP)
        .push_slice(&keys.self_payment_key.serialize())
        .push_int(2)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .push_opcode(opcodes::all::OP_ELSE)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(payment_ripemd)
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ENDIF)
        .push_opcode(opcodes::all::OP_ENDIF)
        .into_script()
}

/// Witness script for an HTLC the broadcaster received; the timeout
/// branch is gated by an absolute `cltv_expiry` locktime
pub fn received_htlc_wscript(
    keys: &CommitmentKeys,
    payment_ripemd: &[u8; 20],
    cltv_expiry: u32,
) -> ScriptBuf {
    let revocation_hash =
        PubkeyHash::hash(&keys.self_revocation_key.to_public_key().serialize()).to_byte_array();
    Builder::new()
        .push_opcode(opcodes::all::OP_DUP)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(&revocation_hash)
        .push_opcode(opcodes::all::OP_EQUAL)
        .push_opcode(opcodes::all::OP_IF)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ELSE)
        .push_slice(&keys.other_payment_key.serialize())
        .push_opcode(opcodes::all::OP_SWAP)
        .push_opcode(opcodes::all::OP_SIZE)
        .push_int(32)
        .push_opcode(opcodes::all::OP_EQUAL)
        .push_opcode(opcodes::all::OP_IF)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(payment_ripemd)
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_int(2)
        .push_opcode(opcodes::all::OP_SWAP)
        .push_slice(&keys.self_payment_key.serialize())
        .push_int(2)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .push_opcode(opcodes::all::OP_ELSE)
        .push_opcode(opcodes::all::OP_DROP)
        .push_int(cltv_expiry as i64)
        .push_opcode(opcodes::all::OP_CLTV)
        .push_opcode(opcodes::all::OP_DROP)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ENDIF)
        .push_opcode(opcodes::all::OP_ENDIF)
        .into_script()
}

/// One witness script per HTLC stub, from the broadcaster `side`'s point
/// of view: HTLCs that side owns are offered, the rest are received
pub fn derive_htlc_scripts(
    htlcs: &[HtlcStub],
    side: Side,
    keys: &CommitmentKeys,
) -> Vec<ScriptBuf> {
    htlcs
        .iter()
        .map(|htlc| {
            if htlc.owner == side {
                offered_htlc_wscript(keys, &htlc.ripemd)
            } else {
                received_htlc_wscript(keys, &htlc.ripemd, htlc.cltv_expiry)
            }
        })
        .collect()
}

/// Match one commitment output against the not-yet-matched HTLC scripts
pub fn match_htlc_output(
    script_pubkey: &Script,
    htlc_scripts: &[Option<ScriptBuf>],
) -> Option<usize> {
    if !script_pubkey.is_p2wsh() {
        return None;
    }
    htlc_scripts.iter().position(|wscript| {
        wscript.as_ref().map(|w| w.to_p2wsh().as_script() == script_pubkey).unwrap_or(false)
    })
}

/// P2WPKH scriptpubkey for a key
pub fn p2wpkh(key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::hash(&key.serialize()))
}

/// `[sig, secret-or-empty, wscript]`: spends the non-revocation branch of
/// the to-self script, or the timeout/preimage branch of a single-stage
/// HTLC spend
pub fn witness_secret_spend(sig: &[u8], secret: Option<&[u8]>, wscript: &Script) -> Witness {
    let mut witness = Witness::new();
    witness.push(sig);
    witness.push(secret.unwrap_or(&[]));
    witness.push(wscript.as_bytes());
    witness
}

/// `[<>, remotesig, localsig, <>, wscript]`: the two-signature timeout
/// branch of an offered HTLC (the leading empty element feeds
/// CHECKMULTISIG, the second empty one selects the timeout path)
pub fn witness_htlc_timeout(local_sig: &[u8], remote_sig: &[u8], wscript: &Script) -> Witness {
    let mut witness = Witness::new();
    witness.push(&[]);
    witness.push(remote_sig);
    witness.push(local_sig);
    witness.push(&[]);
    witness.push(wscript.as_bytes());
    witness
}
