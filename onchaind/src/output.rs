//! Tracked outputs and their resolution lifecycle.
//!
//! Every output the engine cares about gets one [`TrackedOutput`]:
//! created by a close handler, optionally given a [`Proposal`], resolved
//! either by the proposal confirming or by an external spend, then
//! carried until its resolving transaction is 100 blocks deep.

use core::fmt::{self, Display, Formatter};

use bitcoin::{Transaction, Txid};
use log::{info, warn};

use crate::error::{Error, Result};

/// Depth at which a resolution becomes irrevocable (BOLT #5)
pub const IRREVOCABLE_DEPTH: u32 = 100;

/// What kind of transaction something is, for logging and resolution
/// attribution
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxType {
    FundingTransaction,
    MutualClose,
    OurUnilateral,
    TheirUnilateral,
    TheirRevokedUnilateral,
    OurHtlcTimeoutToUs,
    TheirHtlcTimeoutToThem,
    OurUnilateralToUsReturnToWallet,
    /// Resolved by doing nothing: the resolution txid is the output's own
    SelfResolve,
    Unknown,
}

impl Display for TxType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxType::FundingTransaction => "FUNDING_TRANSACTION",
            TxType::MutualClose => "MUTUAL_CLOSE",
            TxType::OurUnilateral => "OUR_UNILATERAL",
            TxType::TheirUnilateral => "THEIR_UNILATERAL",
            TxType::TheirRevokedUnilateral => "THEIR_REVOKED_UNILATERAL",
            TxType::OurHtlcTimeoutToUs => "OUR_HTLC_TIMEOUT_TO_US",
            TxType::TheirHtlcTimeoutToThem => "THEIR_HTLC_TIMEOUT_TO_THEM",
            TxType::OurUnilateralToUsReturnToWallet => "OUR_UNILATERAL_TO_US_RETURN_TO_WALLET",
            TxType::SelfResolve => "SELF",
            TxType::Unknown => "UNKNOWN_TXTYPE",
        };
        f.write_str(name)
    }
}

/// What an output is
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputType {
    FundingOutput,
    OutputToUs,
    OutputToThem,
    DelayedOutputToUs,
    DelayedOutputToThem,
    OurHtlc,
    TheirHtlc,
}

impl Display for OutputType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputType::FundingOutput => "FUNDING_OUTPUT",
            OutputType::OutputToUs => "OUTPUT_TO_US",
            OutputType::OutputToThem => "OUTPUT_TO_THEM",
            OutputType::DelayedOutputToUs => "DELAYED_OUTPUT_TO_US",
            OutputType::DelayedOutputToThem => "DELAYED_OUTPUT_TO_THEM",
            OutputType::OurHtlc => "OUR_HTLC",
            OutputType::TheirHtlc => "THEIR_HTLC",
        };
        f.write_str(name)
    }
}

/// How we intend to resolve an output.  No transaction means "ignore
/// once deep enough".
#[derive(Clone, Debug)]
pub struct Proposal {
    pub tx: Option<Transaction>,
    /// Depth of the originating transaction at which the proposal fires
    pub depth_required: u32,
    pub tx_type: TxType,
}

/// How an output actually got resolved
#[derive(Clone, Debug)]
pub struct Resolution {
    pub txid: Txid,
    pub depth: u32,
    pub tx_type: TxType,
}

/// One output under watch
#[derive(Clone, Debug)]
pub struct TrackedOutput {
    pub tx_type: TxType,
    pub txid: Txid,
    pub tx_blockheight: u32,
    pub outnum: u32,
    pub satoshi: u64,
    pub output_type: OutputType,
    pub proposal: Option<Proposal>,
    pub resolved: Option<Resolution>,
}

impl TrackedOutput {
    /// Mark resolved by doing nothing; the commitment transaction itself
    /// is the resolution
    pub fn ignore(&mut self) {
        info!(
            "ignoring output {} of {}: {}/{}",
            self.outnum, self.txid, self.tx_type, self.output_type
        );
        self.resolved =
            Some(Resolution { txid: self.txid, depth: 0, tx_type: TxType::SelfResolve });
    }

    /// Attach the (single) proposed resolution
    pub fn propose(
        &mut self,
        tx: Option<Transaction>,
        depth_required: u32,
        tx_type: TxType,
    ) -> Result<()> {
        if self.proposal.is_some() {
            return Err(Error::InternalError(format!(
                "second proposal for {}/{}",
                self.tx_type, self.output_type
            )));
        }
        info!(
            "propose handling {}/{} by {} ({}) in {} blocks",
            self.tx_type,
            self.output_type,
            tx_type,
            tx.as_ref().map(|t| t.compute_txid().to_string()).unwrap_or_else(|| "IGNORING".into()),
            depth_required
        );
        self.proposal = Some(Proposal { tx, depth_required, tx_type });
        Ok(())
    }

    /// As [`propose`], but against an absolute block height, which may
    /// already be in the past
    pub fn propose_at_block(
        &mut self,
        tx: Option<Transaction>,
        block_required: u32,
        tx_type: TxType,
    ) -> Result<()> {
        let depth = block_required.saturating_sub(self.tx_blockheight);
        self.propose(tx, depth, tx_type)
    }

    /// True if `spending_txid` is our own proposal confirming
    pub fn resolved_by_proposal(&mut self, spending_txid: &Txid) -> bool {
        let proposal = match &self.proposal {
            Some(p) => p,
            None => return false,
        };
        let tx = match &proposal.tx {
            Some(tx) => tx,
            None => return false,
        };
        if tx.compute_txid() != *spending_txid {
            return false;
        }

        info!(
            "resolved {}/{} by our proposal {} ({})",
            self.tx_type, self.output_type, proposal.tx_type, spending_txid
        );
        self.resolved =
            Some(Resolution { txid: *spending_txid, depth: 0, tx_type: proposal.tx_type });
        true
    }

    /// Something else resolved it, and we worked out what
    pub fn resolved_by_other(&mut self, txid: Txid, tx_type: TxType) {
        info!("resolved {}/{} by {} ({})", self.tx_type, self.output_type, tx_type, txid);
        self.resolved = Some(Resolution { txid, depth: 0, tx_type });
    }

    /// An unexplained spend took the output; record it and complain
    pub fn unknown_spend(&mut self, spending_tx: &Transaction) {
        let txid = spending_tx.compute_txid();
        warn!("unknown spend of {}/{} by {}", self.tx_type, self.output_type, txid);
        self.resolved = Some(Resolution { txid, depth: 0, tx_type: TxType::Unknown });
    }

    /// Depth of the resolving transaction changed; depth only ever grows
    pub fn update_resolution_depth(&mut self, depth: u32) {
        if let Some(res) = &mut self.resolved {
            if depth > res.depth {
                info!("{} depth {}", res.tx_type, depth);
                res.depth = depth;
            }
        }
    }
}

/// Append-only, ordered collection of tracked outputs
#[derive(Default)]
pub struct OutputStore {
    outputs: Vec<TrackedOutput>,
}

impl OutputStore {
    pub fn new() -> Self {
        OutputStore { outputs: Vec::new() }
    }

    /// Start tracking an output; returns its handle
    pub fn track(
        &mut self,
        txid: Txid,
        tx_blockheight: u32,
        tx_type: TxType,
        outnum: u32,
        satoshi: u64,
        output_type: OutputType,
    ) -> usize {
        info!("tracking output {} of {}: {}/{}", outnum, txid, tx_type, output_type);
        self.outputs.push(TrackedOutput {
            tx_type,
            txid,
            tx_blockheight,
            outnum,
            satoshi,
            output_type,
            proposal: None,
            resolved: None,
        });
        self.outputs.len() - 1
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn get(&self, handle: usize) -> &TrackedOutput {
        &self.outputs[handle]
    }

    pub fn get_mut(&mut self, handle: usize) -> &mut TrackedOutput {
        &mut self.outputs[handle]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedOutput> {
        self.outputs.iter()
    }

    /// BOLT #5: resolved outputs become irrevocable at 100 blocks; the
    /// engine's job is done when that holds for every output
    pub fn all_irrevocably_resolved(&self) -> bool {
        self.outputs.iter().all(|out| {
            out.resolved.as_ref().map(|res| res.depth >= IRREVOCABLE_DEPTH).unwrap_or(false)
        })
    }
}
