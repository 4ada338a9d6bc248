//! Messages exchanged with the parent daemon over fd 0.
//!
//! Framing is a u32 packet length, then a u16 packet type, then the body.
//! Integers are big-endian, fixed-width fields are raw bytes, variable
//! byte strings carry a u16 length, lists carry a u16 count, and
//! transactions are u32-length-prefixed consensus encodings.

use std::io::{Read, Write};

use bitcoin::{Transaction, Txid};

use crate::error::{Error, Result};
use crate::io::*;
use crate::model::*;

/// Largest frame we are willing to read
const MAX_MESSAGE_SIZE: u32 = 32 * 1024 * 1024;

pub trait TypedMessage {
    const TYPE: u16;
}

/// Serialize a message with its type prefix
pub trait SerMsg: TypedMessage {
    fn write_body(&self, buf: &mut Vec<u8>);

    fn as_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u16(&mut buf, Self::TYPE);
        self.write_body(&mut buf);
        buf
    }
}

pub trait DeMsg: TypedMessage + Sized {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self>;
}

/// Everything the engine needs to know about the channel and the close,
/// sent exactly once by the parent, followed by `num_htlcs` [`OnchainHtlc`]s.
#[derive(Debug)]
pub struct OnchainInit {
    pub seed: Secret,
    pub shachain: Vec<ShachainSecret>,
    pub funding_amount_satoshi: u64,
    pub old_remote_per_commitment_point: PubKey,
    pub remote_per_commitment_point: PubKey,
    pub local_to_self_delay: u16,
    pub remote_to_self_delay: u16,
    pub feerate_per_kw: u32,
    pub local_dust_limit_satoshi: u64,
    pub remote_revocation_basepoint: PubKey,
    pub our_broadcast_txid: Txid,
    pub local_scriptpubkey: Vec<u8>,
    pub remote_scriptpubkey: Vec<u8>,
    pub our_wallet_pubkey: PubKey,
    pub funder: Side,
    pub remote_payment_basepoint: PubKey,
    pub remote_delayed_payment_basepoint: PubKey,
    /// The transaction that spent the funding output
    pub tx: Transaction,
    pub tx_blockheight: u32,
    pub remote_htlc_sigs: Vec<Signature>,
    pub num_htlcs: u64,
}

impl TypedMessage for OnchainInit {
    const TYPE: u16 = 5001;
}

impl SerMsg for OnchainInit {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.seed.0);
        put_u16(buf, self.shachain.len() as u16);
        for entry in &self.shachain {
            put_u64(buf, entry.index);
            put_bytes(buf, &entry.secret.0);
        }
        put_u64(buf, self.funding_amount_satoshi);
        put_bytes(buf, &self.old_remote_per_commitment_point.0);
        put_bytes(buf, &self.remote_per_commitment_point.0);
        put_u16(buf, self.local_to_self_delay);
        put_u16(buf, self.remote_to_self_delay);
        put_u32(buf, self.feerate_per_kw);
        put_u64(buf, self.local_dust_limit_satoshi);
        put_bytes(buf, &self.remote_revocation_basepoint.0);
        put_txid(buf, &self.our_broadcast_txid);
        put_varbytes(buf, &self.local_scriptpubkey);
        put_varbytes(buf, &self.remote_scriptpubkey);
        put_bytes(buf, &self.our_wallet_pubkey.0);
        put_u8(buf, self.funder.to_u8());
        put_bytes(buf, &self.remote_payment_basepoint.0);
        put_bytes(buf, &self.remote_delayed_payment_basepoint.0);
        put_tx(buf, &self.tx);
        put_u32(buf, self.tx_blockheight);
        put_u16(buf, self.remote_htlc_sigs.len() as u16);
        for sig in &self.remote_htlc_sigs {
            put_bytes(buf, &sig.0);
        }
        put_u64(buf, self.num_htlcs);
    }
}

impl DeMsg for OnchainInit {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        let seed = Secret(read_array(reader)?);
        let shachain_len = read_u16(reader)?;
        let mut shachain = Vec::with_capacity(shachain_len as usize);
        for _ in 0..shachain_len {
            let index = read_u64(reader)?;
            let secret = Secret(read_array(reader)?);
            shachain.push(ShachainSecret { index, secret });
        }
        let funding_amount_satoshi = read_u64(reader)?;
        let old_remote_per_commitment_point = PubKey(read_array(reader)?);
        let remote_per_commitment_point = PubKey(read_array(reader)?);
        let local_to_self_delay = read_u16(reader)?;
        let remote_to_self_delay = read_u16(reader)?;
        let feerate_per_kw = read_u32(reader)?;
        let local_dust_limit_satoshi = read_u64(reader)?;
        let remote_revocation_basepoint = PubKey(read_array(reader)?);
        let our_broadcast_txid = read_txid(reader)?;
        let local_scriptpubkey = read_varbytes(reader)?;
        let remote_scriptpubkey = read_varbytes(reader)?;
        let our_wallet_pubkey = PubKey(read_array(reader)?);
        let funder = Side::from_u8(read_u8(reader)?)?;
        let remote_payment_basepoint = PubKey(read_array(reader)?);
        let remote_delayed_payment_basepoint = PubKey(read_array(reader)?);
        let tx = read_tx(reader)?;
        let tx_blockheight = read_u32(reader)?;
        let sigs_len = read_u16(reader)?;
        let mut remote_htlc_sigs = Vec::with_capacity(sigs_len as usize);
        for _ in 0..sigs_len {
            remote_htlc_sigs.push(Signature(read_array(reader)?));
        }
        let num_htlcs = read_u64(reader)?;
        Ok(OnchainInit {
            seed,
            shachain,
            funding_amount_satoshi,
            old_remote_per_commitment_point,
            remote_per_commitment_point,
            local_to_self_delay,
            remote_to_self_delay,
            feerate_per_kw,
            local_dust_limit_satoshi,
            remote_revocation_basepoint,
            our_broadcast_txid,
            local_scriptpubkey,
            remote_scriptpubkey,
            our_wallet_pubkey,
            funder,
            remote_payment_basepoint,
            remote_delayed_payment_basepoint,
            tx,
            tx_blockheight,
            remote_htlc_sigs,
            num_htlcs,
        })
    }
}

/// One HTLC stub, sent `num_htlcs` times right after [`OnchainInit`]
#[derive(Debug)]
pub struct OnchainHtlc {
    pub htlc: HtlcStub,
}

impl TypedMessage for OnchainHtlc {
    const TYPE: u16 = 5002;
}

impl SerMsg for OnchainHtlc {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.htlc.cltv_expiry);
        put_bytes(buf, &self.htlc.ripemd);
        put_u8(buf, self.htlc.owner.to_u8());
    }
}

impl DeMsg for OnchainHtlc {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        let cltv_expiry = read_u32(reader)?;
        let ripemd = read_array(reader)?;
        let owner = Side::from_u8(read_u8(reader)?)?;
        Ok(OnchainHtlc { htlc: HtlcStub { cltv_expiry, ripemd, owner } })
    }
}

/// Release the watches on a transaction we do not care about
#[derive(Debug)]
pub struct OnchainUnwatchTx {
    pub txid: Txid,
    pub num_outputs: u32,
}

impl TypedMessage for OnchainUnwatchTx {
    const TYPE: u16 = 5003;
}

impl SerMsg for OnchainUnwatchTx {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_txid(buf, &self.txid);
        put_u32(buf, self.num_outputs);
    }
}

impl DeMsg for OnchainUnwatchTx {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        let txid = read_txid(reader)?;
        let num_outputs = read_u32(reader)?;
        Ok(OnchainUnwatchTx { txid, num_outputs })
    }
}

/// An output we watch was spent by `tx.input[input_num]`
#[derive(Debug)]
pub struct OnchainSpent {
    pub tx: Transaction,
    pub input_num: u32,
    pub blockheight: u32,
}

impl TypedMessage for OnchainSpent {
    const TYPE: u16 = 5004;
}

impl SerMsg for OnchainSpent {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_tx(buf, &self.tx);
        put_u32(buf, self.input_num);
        put_u32(buf, self.blockheight);
    }
}

impl DeMsg for OnchainSpent {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        let tx = read_tx(reader)?;
        let input_num = read_u32(reader)?;
        let blockheight = read_u32(reader)?;
        Ok(OnchainSpent { tx, input_num, blockheight })
    }
}

/// Confirmation depth update for a transaction we watch
#[derive(Debug)]
pub struct OnchainDepth {
    pub txid: Txid,
    pub depth: u32,
}

impl TypedMessage for OnchainDepth {
    const TYPE: u16 = 5005;
}

impl SerMsg for OnchainDepth {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_txid(buf, &self.txid);
        put_u32(buf, self.depth);
    }
}

impl DeMsg for OnchainDepth {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        let txid = read_txid(reader)?;
        let depth = read_u32(reader)?;
        Ok(OnchainDepth { txid, depth })
    }
}

/// Ask the parent to broadcast a prepared transaction
#[derive(Debug)]
pub struct OnchainBroadcastTx {
    pub tx: Transaction,
}

impl TypedMessage for OnchainBroadcastTx {
    const TYPE: u16 = 5006;
}

impl SerMsg for OnchainBroadcastTx {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_tx(buf, &self.tx);
    }
}

impl DeMsg for OnchainBroadcastTx {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(OnchainBroadcastTx { tx: read_tx(reader)? })
    }
}

/// A payment preimage for some tracked HTLC is now known
#[derive(Debug)]
pub struct OnchainKnownPreimage {
    pub preimage: Secret,
}

impl TypedMessage for OnchainKnownPreimage {
    const TYPE: u16 = 5007;
}

impl SerMsg for OnchainKnownPreimage {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.preimage.0);
    }
}

impl DeMsg for OnchainKnownPreimage {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(OnchainKnownPreimage { preimage: Secret(read_array(reader)?) })
    }
}

/// Fatal failure report, written just before the engine exits nonzero
#[derive(Debug)]
pub struct OnchainStatusFail {
    pub kind: FailureKind,
    pub message: String,
}

impl TypedMessage for OnchainStatusFail {
    const TYPE: u16 = 5099;
}

impl SerMsg for OnchainStatusFail {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_u8(buf, self.kind.to_u8());
        put_varbytes(buf, self.message.as_bytes());
    }
}

impl DeMsg for OnchainStatusFail {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        let kind = FailureKind::from_u8(read_u8(reader)?)?;
        let message = String::from_utf8(read_varbytes(reader)?)
            .map_err(|_| Error::BadValue("status message"))?;
        Ok(OnchainStatusFail { kind, message })
    }
}

/// Announce the classified close state, sent once after classification
#[derive(Debug)]
pub struct OnchainInitReply {
    pub state: ChannelState,
}

impl TypedMessage for OnchainInitReply {
    const TYPE: u16 = 5101;
}

impl SerMsg for OnchainInitReply {
    fn write_body(&self, buf: &mut Vec<u8>) {
        put_u8(buf, self.state.to_u8());
    }
}

impl DeMsg for OnchainInitReply {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(OnchainInitReply { state: ChannelState::from_u8(read_u8(reader)?)? })
    }
}

#[derive(Debug)]
pub enum Message {
    OnchainInit(OnchainInit),
    OnchainHtlc(OnchainHtlc),
    OnchainUnwatchTx(OnchainUnwatchTx),
    OnchainSpent(OnchainSpent),
    OnchainDepth(OnchainDepth),
    OnchainBroadcastTx(OnchainBroadcastTx),
    OnchainKnownPreimage(OnchainKnownPreimage),
    OnchainStatusFail(OnchainStatusFail),
    OnchainInitReply(OnchainInitReply),
}

impl Message {
    /// Name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Message::OnchainInit(_) => "onchain_init",
            Message::OnchainHtlc(_) => "onchain_htlc",
            Message::OnchainUnwatchTx(_) => "onchain_unwatch_tx",
            Message::OnchainSpent(_) => "onchain_spent",
            Message::OnchainDepth(_) => "onchain_depth",
            Message::OnchainBroadcastTx(_) => "onchain_broadcast_tx",
            Message::OnchainKnownPreimage(_) => "onchain_known_preimage",
            Message::OnchainStatusFail(_) => "onchain_status_fail",
            Message::OnchainInitReply(_) => "onchain_init_reply",
        }
    }
}

fn read_body_no_trailing<T: DeMsg>(data: &[u8]) -> Result<T> {
    let mut cursor = data;
    let msg = T::read_body(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(Error::TrailingBytes(cursor.len(), T::TYPE));
    }
    Ok(msg)
}

fn read_message(data: &[u8], message_type: u16) -> Result<Message> {
    let message = match message_type {
        OnchainInit::TYPE => Message::OnchainInit(read_body_no_trailing(data)?),
        OnchainHtlc::TYPE => Message::OnchainHtlc(read_body_no_trailing(data)?),
        OnchainUnwatchTx::TYPE => Message::OnchainUnwatchTx(read_body_no_trailing(data)?),
        OnchainSpent::TYPE => Message::OnchainSpent(read_body_no_trailing(data)?),
        OnchainDepth::TYPE => Message::OnchainDepth(read_body_no_trailing(data)?),
        OnchainBroadcastTx::TYPE => Message::OnchainBroadcastTx(read_body_no_trailing(data)?),
        OnchainKnownPreimage::TYPE =>
            Message::OnchainKnownPreimage(read_body_no_trailing(data)?),
        OnchainStatusFail::TYPE => Message::OnchainStatusFail(read_body_no_trailing(data)?),
        OnchainInitReply::TYPE => Message::OnchainInitReply(read_body_no_trailing(data)?),
        _ => return Err(Error::UnexpectedType(message_type)),
    };
    Ok(message)
}

/// Read one length-framed message:
///
/// - u32 packet length
/// - u16 packet type
/// - body
pub fn read<R: Read>(reader: &mut R) -> Result<Message> {
    let len = read_u32(reader)?;
    if len < 2 {
        return Err(Error::ShortRead);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(len));
    }
    let message_type = read_u16(reader)?;
    let mut data = vec![0u8; len as usize - 2];
    fill(reader, &mut data).map_err(|e| match e {
        Error::Eof => Error::ShortRead,
        e => e,
    })?;
    read_message(&data, message_type)
}

/// Read one message from a type-prefixed (unframed) vector
pub fn from_vec(v: Vec<u8>) -> Result<Message> {
    if v.len() < 2 {
        return Err(Error::ShortRead);
    }
    let message_type = u16::from_be_bytes([v[0], v[1]]);
    read_message(&v[2..], message_type)
}

/// Write one message with length framing
pub fn write<W: Write, T: SerMsg>(writer: &mut W, msg: &T) -> Result<()> {
    write_vec(writer, msg.as_vec())
}

/// Write an already type-prefixed message with length framing
pub fn write_vec<W: Write>(writer: &mut W, buf: Vec<u8>) -> Result<()> {
    let len = buf.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}
