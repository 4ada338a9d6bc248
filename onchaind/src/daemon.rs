//! The driver: init handshake, close classification, and the depth/spend
//! loop that runs until every output is irrevocably resolved.

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::{ScriptBuf, Transaction, Txid};
use log::{debug, error, info, trace};

use onchain_protocol::model::{ChannelState, HtlcStub, Secret, Side};
use onchain_protocol::msgs::{
    Message, OnchainBroadcastTx, OnchainInit, OnchainInitReply, OnchainStatusFail,
    OnchainUnwatchTx,
};

use crate::client::Client;
use crate::close::{classify_close, CloseType};
use crate::error::{Error, Result};
use crate::keys::{derive_basepoints, Basepoints, BasepointSecrets, RevocationStore};
use crate::output::{OutputStore, OutputType, TxType};

/// Refuse init messages promising an absurd number of HTLC stubs
const MAX_HTLC_STUBS: u64 = u16::MAX as u64;

/// Everything from the init handshake, decoded and derived once
pub struct ChannelContext {
    pub funding_amount_satoshi: u64,
    pub old_remote_per_commitment_point: PublicKey,
    pub remote_per_commitment_point: PublicKey,
    pub local_to_self_delay: u16,
    pub remote_to_self_delay: u16,
    pub feerate_per_kw: u32,
    pub local_dust_limit_satoshi: u64,
    pub remote_revocation_basepoint: PublicKey,
    pub our_broadcast_txid: Txid,
    pub local_scriptpubkey: ScriptBuf,
    pub remote_scriptpubkey: ScriptBuf,
    pub our_wallet_pubkey: PublicKey,
    pub funder: Side,
    pub remote_payment_basepoint: PublicKey,
    pub remote_delayed_payment_basepoint: PublicKey,
    pub basepoints: Basepoints,
    pub secrets: BasepointSecrets,
    pub commitment_seed: [u8; 32],
    pub revocations: RevocationStore,
    pub htlcs: Vec<HtlcStub>,
    pub remote_htlc_sigs: Vec<Signature>,
}

impl ChannelContext {
    fn from_init(
        secp: &Secp256k1<All>,
        init: &OnchainInit,
        htlcs: Vec<HtlcStub>,
    ) -> Result<ChannelContext> {
        let (basepoints, secrets, commitment_seed) = derive_basepoints(secp, &init.seed.0)?;
        let revocations = RevocationStore::from_entries(&init.shachain)?;
        let remote_htlc_sigs = init
            .remote_htlc_sigs
            .iter()
            .map(|sig| sig.to_ecdsa())
            .collect::<onchain_protocol::Result<Vec<_>>>()?;

        Ok(ChannelContext {
            funding_amount_satoshi: init.funding_amount_satoshi,
            old_remote_per_commitment_point: init.old_remote_per_commitment_point.to_pubkey()?,
            remote_per_commitment_point: init.remote_per_commitment_point.to_pubkey()?,
            local_to_self_delay: init.local_to_self_delay,
            remote_to_self_delay: init.remote_to_self_delay,
            feerate_per_kw: init.feerate_per_kw,
            local_dust_limit_satoshi: init.local_dust_limit_satoshi,
            remote_revocation_basepoint: init.remote_revocation_basepoint.to_pubkey()?,
            our_broadcast_txid: init.our_broadcast_txid,
            local_scriptpubkey: ScriptBuf::from_bytes(init.local_scriptpubkey.clone()),
            remote_scriptpubkey: ScriptBuf::from_bytes(init.remote_scriptpubkey.clone()),
            our_wallet_pubkey: init.our_wallet_pubkey.to_pubkey()?,
            funder: init.funder,
            remote_payment_basepoint: init.remote_payment_basepoint.to_pubkey()?,
            remote_delayed_payment_basepoint: init
                .remote_delayed_payment_basepoint
                .to_pubkey()?,
            basepoints,
            secrets,
            commitment_seed,
            revocations,
            htlcs,
            remote_htlc_sigs,
        })
    }
}

/// The per-channel resolution engine
pub struct Onchaind<C: Client> {
    pub(crate) client: C,
    pub(crate) secp: Secp256k1<All>,
    pub(crate) store: OutputStore,
}

impl<C: Client> Onchaind<C> {
    pub fn new(client: C) -> Self {
        Onchaind { client, secp: Secp256k1::new(), store: OutputStore::new() }
    }

    /// Read-only view of the tracked outputs
    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    /// Init handshake, classification, handler, then the resolution loop
    pub fn serve(&mut self) -> Result<()> {
        let (ctx, tx, tx_blockheight) = self.read_init()?;
        let txid = tx.compute_txid();

        let funding_input = tx
            .input
            .first()
            .ok_or_else(|| Error::BadCommand("funding spend has no inputs".to_string()))?;
        self.store.track(
            funding_input.previous_output.txid,
            0,
            TxType::FundingTransaction,
            funding_input.previous_output.vout,
            ctx.funding_amount_satoshi,
            OutputType::FundingOutput,
        );

        debug!("remote per-commit point: {}", ctx.remote_per_commitment_point);
        debug!("old remote per-commit point: {}", ctx.old_remote_per_commitment_point);

        let close = classify_close(
            &tx,
            &txid,
            &ctx.our_broadcast_txid,
            &ctx.local_scriptpubkey,
            &ctx.remote_scriptpubkey,
            ctx.funder,
            &ctx.basepoints.payment,
            &ctx.remote_payment_basepoint,
            &ctx.revocations,
        )?;

        match close {
            CloseType::Mutual => self.handle_mutual_close(&txid)?,
            CloseType::OurUnilateral { commit_num } =>
                self.handle_our_unilateral(&ctx, &tx, tx_blockheight, &txid, commit_num)?,
            CloseType::TheirUnilateral { commit_num, current } => {
                let per_commitment_point = if current {
                    &ctx.remote_per_commitment_point
                } else {
                    &ctx.old_remote_per_commitment_point
                };
                self.handle_their_unilateral(
                    &ctx,
                    &tx,
                    tx_blockheight,
                    &txid,
                    commit_num,
                    per_commitment_point,
                )?
            }
            CloseType::TheirRevoked { commit_num, .. } => self.handle_their_cheat(commit_num)?,
        }

        self.wait_for_resolved()
    }

    fn read_init(&mut self) -> Result<(ChannelContext, Transaction, u32)> {
        let init = match self.client.read()? {
            Message::OnchainInit(init) => init,
            other => {
                return Err(Error::BadCommand(format!("expected init, got {}", other.name())))
            }
        };
        if init.num_htlcs > MAX_HTLC_STUBS {
            return Err(Error::BadCommand(format!("can't track {} htlcs", init.num_htlcs)));
        }

        let mut htlcs = Vec::with_capacity(init.num_htlcs as usize);
        for i in 0..init.num_htlcs {
            match self.client.read()? {
                Message::OnchainHtlc(msg) => htlcs.push(msg.htlc),
                other => {
                    return Err(Error::BadCommand(format!(
                        "expected htlc {}/{}, got {}",
                        i,
                        init.num_htlcs,
                        other.name()
                    )))
                }
            }
        }

        let ctx = ChannelContext::from_init(&self.secp, &init, htlcs)?;
        Ok((ctx, init.tx, init.tx_blockheight))
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) -> Result<()> {
        self.client.write(&OnchainInitReply { state })
    }

    /// BOLT #5: monitor the blockchain until every output which is not
    /// irrevocably resolved becomes so
    fn wait_for_resolved(&mut self) -> Result<()> {
        while !self.store.all_irrevocably_resolved() {
            let msg = self.client.read()?;
            trace!("got new message {}", msg.name());
            match msg {
                Message::OnchainDepth(m) => self.tx_new_depth(&m.txid, m.depth)?,
                Message::OnchainSpent(m) =>
                    self.output_spent(&m.tx, m.input_num as usize, m.blockheight)?,
                Message::OnchainKnownPreimage(m) => self.handle_preimage(&m.preimage)?,
                other => {
                    return Err(Error::BadCommand(format!("bad message {}", other.name())))
                }
            }
        }
        info!("all outputs irrevocably resolved");
        Ok(())
    }

    fn tx_new_depth(&mut self, txid: &Txid, depth: u32) -> Result<()> {
        let mut ripe = Vec::new();
        for i in 0..self.store.len() {
            let out = self.store.get_mut(i);

            // Is this tx resolving an output?
            if out.resolved.is_some() {
                if out.resolved.as_ref().map(|r| r.txid == *txid).unwrap_or(false) {
                    out.update_resolution_depth(depth);
                }
                continue;
            }

            // Otherwise, is this something we have a pending resolution for?
            if out.txid == *txid
                && out.proposal.as_ref().map(|p| depth >= p.depth_required).unwrap_or(false)
            {
                ripe.push(i);
            }
        }
        for i in ripe {
            self.proposal_meets_depth(i)?;
        }
        Ok(())
    }

    fn proposal_meets_depth(&mut self, handle: usize) -> Result<()> {
        let pending = match &self.store.get(handle).proposal {
            Some(proposal) => proposal.tx.clone().map(|tx| (tx, proposal.tx_type)),
            None => return Ok(()),
        };
        let (tx, tx_type) = match pending {
            Some(pending) => pending,
            None => {
                // We simply wanted to ignore it after this depth
                self.store.get_mut(handle).ignore();
                return Ok(());
            }
        };
        let out = self.store.get(handle);
        info!(
            "broadcasting {} ({}) to resolve {}/{}",
            tx_type,
            tx.compute_txid(),
            out.tx_type,
            out.output_type
        );
        // We will get a spend notification once it is in a block
        self.client.write(&OnchainBroadcastTx { tx })
    }

    fn output_spent(&mut self, tx: &Transaction, input_num: usize, _blockheight: u32) -> Result<()> {
        let spender_txid = tx.compute_txid();
        let spent = tx
            .input
            .get(input_num)
            .ok_or_else(|| {
                Error::BadCommand(format!("spend notification input {} out of range", input_num))
            })?
            .previous_output;

        for i in 0..self.store.len() {
            let out = self.store.get(i);
            if out.txid != spent.txid || out.outnum != spent.vout {
                continue;
            }

            if let Some(resolved) = &out.resolved {
                if resolved.txid == spender_txid {
                    // Duplicate notification
                    return Ok(());
                }
                if out.output_type == OutputType::FundingOutput {
                    // Parent must restart us; our idea of the close tx is stale
                    return Err(Error::InternalError("funding output spent again".to_string()));
                }
                continue;
            }

            // Was this our resolution?
            if self.store.get_mut(i).resolved_by_proposal(&spender_txid) {
                return Ok(());
            }

            let out = self.store.get(i);
            match out.output_type {
                OutputType::OutputToUs | OutputType::DelayedOutputToUs => {
                    self.store.get_mut(i).unknown_spend(tx);
                }
                OutputType::TheirHtlc => {
                    // Their timeout tx; we resolve by ignoring once we
                    // reach depth
                }
                OutputType::OurHtlc => {
                    // The only way they can spend this: fulfill
                    return self.handle_their_htlc_fulfill(i, tx);
                }
                OutputType::FundingOutput => {
                    return Err(Error::InternalError("funding output spent again".to_string()));
                }
                OutputType::OutputToThem | OutputType::DelayedOutputToThem => {
                    // We don't track these
                    return Err(Error::InternalError(format!(
                        "tracked spend of {}/{}?",
                        out.tx_type, out.output_type
                    )));
                }
            }
            return Ok(());
        }

        // Not interesting to us, so unwatch the tx and all its outputs
        debug!("notified about spend of {}:{}, but we don't care", spent.txid, spent.vout);
        self.client
            .write(&OnchainUnwatchTx { txid: spender_txid, num_outputs: tx.output.len() as u32 })
    }

    fn handle_their_htlc_fulfill(&mut self, _handle: usize, tx: &Transaction) -> Result<()> {
        Err(Error::InternalError(format!(
            "preimage spend of our HTLC by {} not implemented",
            tx.compute_txid()
        )))
    }

    fn handle_preimage(&mut self, _preimage: &Secret) -> Result<()> {
        Err(Error::InternalError("preimage-driven HTLC sweep not implemented".to_string()))
    }
}

/// Run the engine over `client` until every output is irrevocably
/// resolved, reporting any fatal error to the parent before bailing out.
pub fn run<C: Client>(client: C) -> Result<()> {
    let mut daemon = Onchaind::new(client);
    let result = daemon.serve();
    if let Err(e) = &result {
        error!("{}", e);
        let _ = daemon
            .client
            .write(&OnchainStatusFail { kind: e.failure_kind(), message: e.to_string() });
    }
    result
}
