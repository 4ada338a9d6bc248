//! One handler per close type: enumerate the commitment outputs, match
//! each against the scripts this commitment could carry, and attach a
//! resolution or a proposal to every one of them.

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Amount, Script, ScriptBuf, Transaction, Txid};
use lightning::ln::chan_utils::derive_private_key;
use log::{debug, info};

use onchain_protocol::model::{ChannelState, HtlcStub, Side};

use crate::client::Client;
use crate::daemon::{ChannelContext, Onchaind};
use crate::error::{Error, Result};
use crate::feerate::{htlc_timeout_fee, FeerateRange, HTLC_TIMEOUT_TX_WEIGHT};
use crate::keys::{derive_keyset, per_commitment_point, CommitmentKeys};
use crate::output::{OutputType, TxType};
use crate::scripts;
use crate::sweep;

impl<C: Client> Onchaind<C> {
    /// BOLT #5: a mutual close transaction resolves the funding output;
    /// nothing else needs tracking, the outputs went straight to the
    /// negotiated scriptpubkeys
    pub(crate) fn handle_mutual_close(&mut self, txid: &Txid) -> Result<()> {
        self.set_state(ChannelState::OnchaindMutual)?;
        self.store.get_mut(0).resolved_by_other(*txid, TxType::MutualClose);
        Ok(())
    }

    /// Our own commitment hit the chain: sweep the delayed to-us output
    /// after `to_self_delay`, leave the to-them output alone, and resolve
    /// every HTLC output
    pub(crate) fn handle_our_unilateral(
        &mut self,
        ctx: &ChannelContext,
        tx: &Transaction,
        tx_blockheight: u32,
        txid: &Txid,
        commit_num: u64,
    ) -> Result<()> {
        self.set_state(ChannelState::OnchaindOurUnilateral)?;

        let mut feerate_range =
            FeerateRange::from_commitment(ctx.funding_amount_satoshi, tx)?;

        // Either unilateral commitment resolves the funding output
        self.store.get_mut(0).resolved_by_other(*txid, TxType::OurUnilateral);

        let point = per_commitment_point(&self.secp, &ctx.commitment_seed, commit_num)?;
        let keyset = derive_keyset(
            &self.secp,
            &point,
            &ctx.basepoints.payment,
            &ctx.remote_payment_basepoint,
            &ctx.basepoints.delayed_payment,
            &ctx.remote_revocation_basepoint,
        )?;
        log_keyset(commit_num, &keyset);

        let delayed_privkey = derive_private_key(&self.secp, &point, &ctx.secrets.delayed_payment);
        let payment_privkey = derive_private_key(&self.secp, &point, &ctx.secrets.payment);

        let local_wscript = scripts::to_self_wscript(ctx.local_to_self_delay, &keyset);
        // What the delayed to-us output looks like
        let mut script_local = Some(local_wscript.to_p2wsh());
        // What the direct to-them output looks like
        let mut script_remote = Some(scripts::p2wpkh(&keyset.other_payment_key));
        let mut htlc_scripts: Vec<Option<ScriptBuf>> =
            scripts::derive_htlc_scripts(&ctx.htlcs, Side::Local, &keyset)
                .into_iter()
                .map(Some)
                .collect();

        debug!(
            "script to-me: {}: {} ({})",
            ctx.local_to_self_delay,
            hex::encode(script_local.as_ref().map(|s| s.as_bytes()).unwrap_or_default()),
            hex::encode(local_wscript.as_bytes()),
        );
        debug!(
            "script to-them: {}",
            hex::encode(script_remote.as_ref().map(|s| s.as_bytes()).unwrap_or_default())
        );
        for (i, txout) in tx.output.iter().enumerate() {
            debug!("output {}: {}", i, hex::encode(txout.script_pubkey.as_bytes()));
        }

        // Counterparty signatures cover LOCAL-owned HTLCs in commitment
        // output order, so the cursor advances by one per offered HTLC
        let mut htlc_sigs = ctx.remote_htlc_sigs.iter();

        for (i, txout) in tx.output.iter().enumerate() {
            let amount = txout.value.to_sat();

            if matches(&mut script_local, &txout.script_pubkey) {
                let handle = self.store.track(
                    *txid,
                    tx_blockheight,
                    TxType::OurUnilateral,
                    i as u32,
                    amount,
                    OutputType::DelayedOutputToUs,
                );
                // Spent with `nSequence = to_self_delay` and witness
                // `<local_delayedsig> 0`
                let to_us = sweep::tx_to_us(
                    &self.secp,
                    self.store.get(handle),
                    ctx.local_to_self_delay as u32,
                    0,
                    ctx.feerate_per_kw,
                    ctx.local_dust_limit_satoshi,
                    &local_wscript,
                    &ctx.our_wallet_pubkey,
                    &delayed_privkey,
                )?;
                self.store.get_mut(handle).propose(
                    Some(to_us),
                    ctx.local_to_self_delay as u32,
                    TxType::OurUnilateralToUsReturnToWallet,
                )?;
                continue;
            }

            if matches(&mut script_remote, &txout.script_pubkey) {
                // Their main output; resolved by the commitment itself
                let handle = self.store.track(
                    *txid,
                    tx_blockheight,
                    TxType::OurUnilateral,
                    i as u32,
                    amount,
                    OutputType::OutputToThem,
                );
                self.store.get_mut(handle).ignore();
                continue;
            }

            let j = scripts::match_htlc_output(&txout.script_pubkey, &htlc_scripts)
                .ok_or_else(|| {
                    Error::InternalError(format!("could not find resolution for output {}", i))
                })?;
            let wscript = take_script(&mut htlc_scripts, j)?;

            if ctx.htlcs[j].owner == Side::Local {
                let handle = self.store.track(
                    *txid,
                    tx_blockheight,
                    TxType::OurUnilateral,
                    i as u32,
                    amount,
                    OutputType::OurHtlc,
                );
                let remotesig = htlc_sigs.next().ok_or_else(|| {
                    Error::InternalError("more offered HTLCs than signatures".to_string())
                })?;
                self.resolve_our_htlc_ourcommit(
                    handle,
                    &wscript,
                    &ctx.htlcs[j],
                    ctx.local_to_self_delay,
                    &mut feerate_range,
                    &payment_privkey,
                    remotesig,
                    &keyset,
                )?;
            } else {
                let handle = self.store.track(
                    *txid,
                    tx_blockheight,
                    TxType::OurUnilateral,
                    i as u32,
                    amount,
                    OutputType::TheirHtlc,
                );
                self.resolve_their_htlc(handle, &ctx.htlcs[j])?;
            }
        }

        Ok(())
    }

    /// The counterparty's (unrevoked) commitment hit the chain.  Mirror
    /// image of [`handle_our_unilateral`]: their main output is the
    /// delayed one, ours is a plain P2WPKH the wallet already owns.
    pub(crate) fn handle_their_unilateral(
        &mut self,
        ctx: &ChannelContext,
        tx: &Transaction,
        tx_blockheight: u32,
        txid: &Txid,
        commit_num: u64,
        remote_per_commitment_point: &PublicKey,
    ) -> Result<()> {
        self.set_state(ChannelState::OnchaindTheirUnilateral)?;

        // Either unilateral commitment resolves the funding output
        self.store.get_mut(0).resolved_by_other(*txid, TxType::TheirUnilateral);

        let keyset = derive_keyset(
            &self.secp,
            remote_per_commitment_point,
            &ctx.remote_payment_basepoint,
            &ctx.basepoints.payment,
            &ctx.remote_delayed_payment_basepoint,
            &ctx.basepoints.revocation,
        )?;
        log_keyset(commit_num, &keyset);

        let payment_privkey =
            derive_private_key(&self.secp, remote_per_commitment_point, &ctx.secrets.payment);

        let remote_wscript = scripts::to_self_wscript(ctx.remote_to_self_delay, &keyset);
        // What the delayed to-them output looks like
        let mut script_remote = Some(remote_wscript.to_p2wsh());
        // What the direct to-us output looks like
        let mut script_local = Some(scripts::p2wpkh(&keyset.other_payment_key));
        let mut htlc_scripts: Vec<Option<ScriptBuf>> =
            scripts::derive_htlc_scripts(&ctx.htlcs, Side::Remote, &keyset)
                .into_iter()
                .map(Some)
                .collect();

        debug!(
            "script to-them: {}: {} ({})",
            ctx.remote_to_self_delay,
            hex::encode(script_remote.as_ref().map(|s| s.as_bytes()).unwrap_or_default()),
            hex::encode(remote_wscript.as_bytes()),
        );
        debug!(
            "script to-me: {}",
            hex::encode(script_local.as_ref().map(|s| s.as_bytes()).unwrap_or_default())
        );

        for (i, txout) in tx.output.iter().enumerate() {
            let amount = txout.value.to_sat();

            if matches(&mut script_local, &txout.script_pubkey) {
                // Our main output: a simple P2WPKH, resolved by the
                // commitment itself
                let handle = self.store.track(
                    *txid,
                    tx_blockheight,
                    TxType::TheirUnilateral,
                    i as u32,
                    amount,
                    OutputType::OutputToUs,
                );
                self.store.get_mut(handle).ignore();
                continue;
            }

            if matches(&mut script_remote, &txout.script_pubkey) {
                let handle = self.store.track(
                    *txid,
                    tx_blockheight,
                    TxType::TheirUnilateral,
                    i as u32,
                    amount,
                    OutputType::DelayedOutputToThem,
                );
                self.store.get_mut(handle).ignore();
                continue;
            }

            let j = scripts::match_htlc_output(&txout.script_pubkey, &htlc_scripts)
                .ok_or_else(|| {
                    Error::InternalError(format!("could not find resolution for output {}", i))
                })?;
            let wscript = take_script(&mut htlc_scripts, j)?;

            if ctx.htlcs[j].owner == Side::Local {
                let handle = self.store.track(
                    *txid,
                    tx_blockheight,
                    TxType::TheirUnilateral,
                    i as u32,
                    amount,
                    OutputType::OurHtlc,
                );
                self.resolve_our_htlc_theircommit(
                    ctx,
                    handle,
                    &wscript,
                    &ctx.htlcs[j],
                    &payment_privkey,
                )?;
            } else {
                let handle = self.store.track(
                    *txid,
                    tx_blockheight,
                    TxType::TheirUnilateral,
                    i as u32,
                    amount,
                    OutputType::TheirHtlc,
                );
                self.resolve_their_htlc(handle, &ctx.htlcs[j])?;
            }
        }

        Ok(())
    }

    /// A revoked commitment: the right answer is a penalty transaction
    /// sweeping every output with the revocation key
    pub(crate) fn handle_their_cheat(&mut self, commit_num: u64) -> Result<()> {
        Err(Error::InternalError(format!(
            "penalty transaction for revoked commitment {} not implemented",
            commit_num
        )))
    }

    /// BOLT #5, our offers on our own commitment: once timed out, the
    /// output must be spent by the pre-signed HTLC-timeout transaction.
    /// We hold the counterparty's signature but not the feerate it was
    /// made at, so we try every fee the range allows until it verifies.
    #[allow(clippy::too_many_arguments)]
    fn resolve_our_htlc_ourcommit(
        &mut self,
        handle: usize,
        wscript: &Script,
        htlc: &HtlcStub,
        to_self_delay: u16,
        feerate_range: &mut FeerateRange,
        local_payment_privkey: &SecretKey,
        remotesig: &Signature,
        keyset: &CommitmentKeys,
    ) -> Result<()> {
        let satoshi = self.store.get(handle).satoshi;
        let mut tx =
            sweep::htlc_timeout_tx(self.store.get(handle), htlc.cltv_expiry, to_self_delay, keyset);

        // We vary the feerate until the signature they offered matches;
        // we're more likely to be near the maximum
        let mut prev_fee = u64::MAX;
        for feerate in (feerate_range.min..=feerate_range.max).rev() {
            let fee = htlc_timeout_fee(feerate);
            if fee > satoshi {
                continue;
            }
            if fee == prev_fee {
                continue;
            }
            prev_fee = fee;

            tx.output[0].value = Amount::from_sat(satoshi - fee);
            if !sweep::check_tx_sig(
                &self.secp,
                &tx,
                0,
                wscript,
                satoshi,
                &keyset.other_payment_key,
                remotesig,
            ) {
                continue;
            }

            // Found the fee; narrow the window for the next HTLC
            feerate_range.narrow(fee, HTLC_TIMEOUT_TX_WEIGHT)?;

            let localsig =
                sweep::sign_tx_input(&self.secp, &tx, 0, wscript, satoshi, local_payment_privkey)?;
            tx.input[0].witness = scripts::witness_htlc_timeout(
                &sweep::signature_to_vec(localsig),
                &sweep::signature_to_vec(*remotesig),
                wscript,
            );

            self.store.get_mut(handle).propose_at_block(
                Some(tx),
                htlc.cltv_expiry,
                TxType::OurHtlcTimeoutToUs,
            )?;
            return Ok(());
        }

        Err(Error::InternalError(format!(
            "could not find feerate for signature on HTLC timeout between {} and {}",
            feerate_range.min, feerate_range.max
        )))
    }

    /// BOLT #5, our offers on their commitment: single stage, just sweep
    /// to the wallet once the HTLC has timed out
    fn resolve_our_htlc_theircommit(
        &mut self,
        ctx: &ChannelContext,
        handle: usize,
        wscript: &Script,
        htlc: &HtlcStub,
        local_payment_privkey: &SecretKey,
    ) -> Result<()> {
        let tx = sweep::tx_to_us(
            &self.secp,
            self.store.get(handle),
            0,
            htlc.cltv_expiry,
            ctx.feerate_per_kw,
            ctx.local_dust_limit_satoshi,
            wscript,
            &ctx.our_wallet_pubkey,
            local_payment_privkey,
        )?;
        self.store.get_mut(handle).propose_at_block(
            Some(tx),
            htlc.cltv_expiry,
            TxType::OurHtlcTimeoutToUs,
        )
    }

    /// BOLT #5, their offers: without the preimage there is nothing to
    /// claim; once the HTLC has expired the output is irrevocably
    /// resolved by the timeout
    fn resolve_their_htlc(&mut self, handle: usize, htlc: &HtlcStub) -> Result<()> {
        self.store.get_mut(handle).propose_at_block(
            None,
            htlc.cltv_expiry,
            TxType::TheirHtlcTimeoutToThem,
        )
    }
}

/// Single-shot scriptpubkey matcher
fn matches(script: &mut Option<ScriptBuf>, candidate: &Script) -> bool {
    if script.as_ref().map(|s| s.as_script() == candidate).unwrap_or(false) {
        *script = None;
        true
    } else {
        false
    }
}

fn take_script(htlc_scripts: &mut [Option<ScriptBuf>], j: usize) -> Result<ScriptBuf> {
    htlc_scripts[j]
        .take()
        .ok_or_else(|| Error::InternalError(format!("HTLC script {} matched twice", j)))
}

fn log_keyset(commit_num: u64, keyset: &CommitmentKeys) {
    info!(
        "deconstructing unilateral tx {} using keyset: self_revocation_key: {} \
         self_delayed_payment_key: {} self_payment_key: {} other_payment_key: {}",
        commit_num,
        keyset.self_revocation_key.to_public_key(),
        keyset.self_delayed_payment_key.to_public_key(),
        keyset.self_payment_key,
        keyset.other_payment_key,
    );
}
