//! Classifying the transaction that spent the funding output.

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Script, Transaction, Txid};
use lightning::ln::chan_utils::get_commitment_transaction_number_obscure_factor;
use log::debug;
use onchain_protocol::model::Side;

use crate::error::{Error, Result};
use crate::keys::RevocationStore;

/// What kind of close we are dealing with, decided exactly once
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseType {
    Mutual,
    OurUnilateral {
        commit_num: u64,
    },
    /// `current` selects between the new and the old remote
    /// per-commitment point
    TheirUnilateral {
        commit_num: u64,
        current: bool,
    },
    TheirRevoked {
        commit_num: u64,
        revocation_preimage: [u8; 32],
    },
}

/// BOLT #3: the 48-bit commitment number is obscured by XOR with the
/// lower 48 bits of `SHA256(funder_payment_basepoint ||
/// fundee_payment_basepoint)`, split across the low 24 bits of the
/// locktime (tag 0x20) and of `txin[0]` sequence (tag 0x80).
pub fn unmask_commit_number(
    tx: &Transaction,
    funder: Side,
    local_payment_basepoint: &PublicKey,
    remote_payment_basepoint: &PublicKey,
) -> u64 {
    let obscurer = get_commitment_transaction_number_obscure_factor(
        local_payment_basepoint,
        remote_payment_basepoint,
        funder == Side::Local,
    );
    let locktime = tx.lock_time.to_consensus_u32() as u64;
    let sequence = tx.input[0].sequence.0 as u64;
    ((locktime & 0x00ff_ffff) | ((sequence & 0x00ff_ffff) << 24)) ^ obscurer
}

/// True iff every output pays one of the two negotiated closing scripts,
/// each matched at most once
pub fn is_mutual_close(
    tx: &Transaction,
    local_scriptpubkey: &Script,
    remote_scriptpubkey: &Script,
) -> bool {
    let mut local_matched = false;
    let mut remote_matched = false;

    for out in &tx.output {
        if out.script_pubkey.as_script() == local_scriptpubkey && !local_matched {
            local_matched = true;
        } else if out.script_pubkey.as_script() == remote_scriptpubkey && !remote_matched {
            remote_matched = true;
        } else {
            return false;
        }
    }
    true
}

/// Decide the close type from the funding-spending transaction.
#[allow(clippy::too_many_arguments)]
pub fn classify_close(
    tx: &Transaction,
    txid: &Txid,
    our_broadcast_txid: &Txid,
    local_scriptpubkey: &Script,
    remote_scriptpubkey: &Script,
    funder: Side,
    local_payment_basepoint: &PublicKey,
    remote_payment_basepoint: &PublicKey,
    revocations: &RevocationStore,
) -> Result<CloseType> {
    if is_mutual_close(tx, local_scriptpubkey, remote_scriptpubkey) {
        return Ok(CloseType::Mutual);
    }

    let commit_num =
        unmask_commit_number(tx, funder, local_payment_basepoint, remote_payment_basepoint);
    let revocations_received = revocations.revocations_received();
    debug!("commitnum = {}, revocations_received = {}", commit_num, revocations_received);

    // We only ever broadcast one commitment, so matching it is easy
    if txid == our_broadcast_txid {
        Ok(CloseType::OurUnilateral { commit_num })
    } else if let Some(revocation_preimage) = revocations.revocation_preimage(commit_num) {
        Ok(CloseType::TheirRevoked { commit_num, revocation_preimage })
    } else if commit_num == revocations_received {
        debug!("their unilateral tx, old commit point");
        Ok(CloseType::TheirUnilateral { commit_num, current: false })
    } else if commit_num == revocations_received + 1 {
        debug!("their unilateral tx, new commit point");
        Ok(CloseType::TheirUnilateral { commit_num, current: true })
    } else {
        Err(Error::InternalError(format!(
            "unknown commitment index {} for tx {}",
            commit_num, txid
        )))
    }
}
