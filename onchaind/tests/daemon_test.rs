//! End-to-end runs of the engine against a scripted parent.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use lightning::ln::chan_utils::get_commitment_transaction_number_obscure_factor;
use test_log::test;

use onchain_protocol::model::{HtlcStub, PubKey, Secret, Side, Signature};
use onchain_protocol::msgs::{
    self, Message, OnchainDepth, OnchainHtlc, OnchainInit, OnchainSpent, SerMsg,
};
use onchaind::client::Client;
use onchaind::error::Error;
use onchaind::feerate::htlc_timeout_fee;
use onchaind::keys::{
    derive_basepoints, derive_keyset, per_commitment_point, Basepoints, BasepointSecrets,
    CommitmentKeys,
};
use onchaind::output::{OutputType, TxType};
use onchaind::{scripts, sweep, Onchaind};

const FUNDING_SAT: u64 = 100_000;
const TO_SELF_DELAY: u16 = 144;
const FEERATE_PER_KW: u32 = 5_000;
const DUST_LIMIT: u64 = 546;
const BLOCKHEIGHT: u32 = 700_000;
const COMMIT_NUM: u64 = 42;

/// Parent stand-in: scripted inbound messages, recorded outbound ones.
/// Optionally confirms every broadcast with a spend notification and a
/// 100-deep depth report, like a block would.
struct TestClient {
    inbound: VecDeque<Message>,
    outbound: Rc<RefCell<Vec<Message>>>,
    confirm_broadcasts: bool,
}

impl TestClient {
    fn new(inbound: Vec<Message>) -> (Self, Rc<RefCell<Vec<Message>>>) {
        let outbound = Rc::new(RefCell::new(Vec::new()));
        let client = TestClient {
            inbound: inbound.into(),
            outbound: Rc::clone(&outbound),
            confirm_broadcasts: false,
        };
        (client, outbound)
    }
}

impl Client for TestClient {
    fn read(&mut self) -> onchaind::Result<Message> {
        self.inbound.pop_front().ok_or(Error::Wire(onchain_protocol::Error::Eof))
    }

    fn write<M: SerMsg>(&mut self, msg: &M) -> onchaind::Result<()> {
        let decoded = msgs::from_vec(msg.as_vec()).expect("engine wrote undecodable message");
        if self.confirm_broadcasts {
            if let Message::OnchainBroadcastTx(broadcast) = &decoded {
                let txid = broadcast.tx.compute_txid();
                self.inbound.push_back(Message::OnchainSpent(OnchainSpent {
                    tx: broadcast.tx.clone(),
                    input_num: 0,
                    blockheight: BLOCKHEIGHT + TO_SELF_DELAY as u32,
                }));
                self.inbound
                    .push_back(Message::OnchainDepth(OnchainDepth { txid, depth: 100 }));
            }
        }
        self.outbound.borrow_mut().push(decoded);
        Ok(())
    }
}

struct TestChannel {
    secp: Secp256k1<All>,
    seed: [u8; 32],
    basepoints: Basepoints,
    secrets: BasepointSecrets,
    commitment_seed: [u8; 32],
    remote_payment_secret: SecretKey,
    remote_revocation_basepoint: PublicKey,
    remote_delayed_payment_basepoint: PublicKey,
    wallet_pubkey: PublicKey,
    local_closing_spk: ScriptBuf,
    remote_closing_spk: ScriptBuf,
    funding_outpoint: OutPoint,
}

fn key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

impl TestChannel {
    fn new() -> Self {
        let secp = Secp256k1::new();
        let seed = [42u8; 32];
        let (basepoints, secrets, commitment_seed) = derive_basepoints(&secp, &seed).unwrap();
        let pk = |byte| PublicKey::from_secret_key(&secp, &key(byte));
        TestChannel {
            seed,
            basepoints,
            secrets,
            commitment_seed,
            remote_payment_secret: key(21),
            remote_revocation_basepoint: pk(22),
            remote_delayed_payment_basepoint: pk(23),
            wallet_pubkey: pk(41),
            local_closing_spk: scripts::p2wpkh(&pk(51)),
            remote_closing_spk: scripts::p2wpkh(&pk(52)),
            funding_outpoint: OutPoint { txid: Txid::from_byte_array([0xfd; 32]), vout: 0 },
            secp,
        }
    }

    fn remote_payment_basepoint(&self) -> PublicKey {
        PublicKey::from_secret_key(&self.secp, &self.remote_payment_secret)
    }

    /// Locktime and sequence fields carrying the obscured commitment number
    fn mask(&self, commit_num: u64) -> (u32, u32) {
        let obscurer = get_commitment_transaction_number_obscure_factor(
            &self.basepoints.payment,
            &self.remote_payment_basepoint(),
            true, // we funded
        );
        let obscured = commit_num ^ obscurer;
        let locktime = 0x2000_0000 | (obscured & 0x00ff_ffff) as u32;
        let sequence = 0x8000_0000 | ((obscured >> 24) & 0x00ff_ffff) as u32;
        (locktime, sequence)
    }

    /// A commitment-shaped spend of the funding output
    fn commitment_tx(&self, commit_num: u64, outputs: Vec<TxOut>) -> Transaction {
        let (locktime, sequence) = self.mask(commit_num);
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(locktime),
            input: vec![TxIn {
                previous_output: self.funding_outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence(sequence),
                witness: Witness::default(),
            }],
            output: outputs,
        }
    }

    /// The keyset for one of our own commitments
    fn our_keyset(&self, commit_num: u64) -> CommitmentKeys {
        let point = per_commitment_point(&self.secp, &self.commitment_seed, commit_num).unwrap();
        derive_keyset(
            &self.secp,
            &point,
            &self.basepoints.payment,
            &self.remote_payment_basepoint(),
            &self.basepoints.delayed_payment,
            &self.remote_revocation_basepoint,
        )
        .unwrap()
    }

    /// The keyset for a commitment the counterparty broadcast
    fn their_keyset(&self, their_point: &PublicKey) -> CommitmentKeys {
        derive_keyset(
            &self.secp,
            their_point,
            &self.remote_payment_basepoint(),
            &self.basepoints.payment,
            &self.remote_delayed_payment_basepoint,
            &self.basepoints.revocation,
        )
        .unwrap()
    }

    fn init_msg(
        &self,
        tx: &Transaction,
        our_broadcast_txid: Txid,
        htlcs_count: u64,
        remote_htlc_sigs: Vec<Signature>,
        remote_per_commitment_point: PublicKey,
    ) -> Message {
        Message::OnchainInit(OnchainInit {
            seed: Secret(self.seed),
            shachain: vec![],
            funding_amount_satoshi: FUNDING_SAT,
            old_remote_per_commitment_point: PubKey::from_pubkey(
                &PublicKey::from_secret_key(&self.secp, &key(32)),
            ),
            remote_per_commitment_point: PubKey::from_pubkey(&remote_per_commitment_point),
            local_to_self_delay: TO_SELF_DELAY,
            remote_to_self_delay: TO_SELF_DELAY,
            feerate_per_kw: FEERATE_PER_KW,
            local_dust_limit_satoshi: DUST_LIMIT,
            remote_revocation_basepoint: PubKey::from_pubkey(&self.remote_revocation_basepoint),
            our_broadcast_txid,
            local_scriptpubkey: self.local_closing_spk.as_bytes().to_vec(),
            remote_scriptpubkey: self.remote_closing_spk.as_bytes().to_vec(),
            our_wallet_pubkey: PubKey::from_pubkey(&self.wallet_pubkey),
            funder: Side::Local,
            remote_payment_basepoint: PubKey::from_pubkey(&self.remote_payment_basepoint()),
            remote_delayed_payment_basepoint: PubKey::from_pubkey(
                &self.remote_delayed_payment_basepoint,
            ),
            tx: tx.clone(),
            tx_blockheight: BLOCKHEIGHT,
            remote_htlc_sigs,
            num_htlcs: htlcs_count,
        })
    }
}

fn depth(txid: Txid, depth: u32) -> Message {
    Message::OnchainDepth(OnchainDepth { txid, depth })
}

fn spent(tx: &Transaction, input_num: u32) -> Message {
    Message::OnchainSpent(OnchainSpent { tx: tx.clone(), input_num, blockheight: BLOCKHEIGHT })
}

fn htlc(stub: &HtlcStub) -> Message {
    Message::OnchainHtlc(OnchainHtlc { htlc: stub.clone() })
}

fn payout(spk: &ScriptBuf, sat: u64) -> TxOut {
    TxOut { value: Amount::from_sat(sat), script_pubkey: spk.clone() }
}

fn count_broadcasts(outbound: &[Message]) -> usize {
    outbound.iter().filter(|m| matches!(m, Message::OnchainBroadcastTx(_))).count()
}

#[test]
fn mutual_close_resolves_at_depth_100() {
    let chan = TestChannel::new();
    let mutual = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: chan.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffff_fffd),
            witness: Witness::default(),
        }],
        output: vec![
            payout(&chan.local_closing_spk, 60_000),
            payout(&chan.remote_closing_spk, 39_000),
        ],
    };
    let mutual_txid = mutual.compute_txid();

    let (client, outbound) = TestClient::new(vec![
        chan.init_msg(&mutual, Txid::from_byte_array([0xab; 32]), 0, vec![], key(31).public_key(&chan.secp)),
        depth(mutual_txid, 99),
        depth(mutual_txid, 100),
    ]);

    let mut daemon = Onchaind::new(client);
    daemon.serve().unwrap();

    assert_eq!(daemon.store().len(), 1);
    let funding = daemon.store().get(0);
    assert_eq!(funding.output_type, OutputType::FundingOutput);
    let res = funding.resolved.as_ref().unwrap();
    assert_eq!(res.tx_type, TxType::MutualClose);
    assert_eq!(res.txid, mutual_txid);
    assert_eq!(res.depth, 100);

    let outbound = outbound.borrow();
    assert!(matches!(
        outbound[0],
        Message::OnchainInitReply(ref r)
            if r.state == onchain_protocol::model::ChannelState::OnchaindMutual
    ));
    assert_eq!(count_broadcasts(&outbound), 0);
}

#[test]
fn our_unilateral_sweeps_delayed_output() {
    let chan = TestChannel::new();
    let keyset = chan.our_keyset(COMMIT_NUM);
    let local_wscript = scripts::to_self_wscript(TO_SELF_DELAY, &keyset);
    let commit = chan.commitment_tx(
        COMMIT_NUM,
        vec![
            payout(&local_wscript.to_p2wsh(), 60_000),
            payout(&scripts::p2wpkh(&keyset.other_payment_key), 35_000),
        ],
    );
    let commit_txid = commit.compute_txid();

    let (mut client, outbound) = TestClient::new(vec![
        chan.init_msg(&commit, commit_txid, 0, vec![], key(31).public_key(&chan.secp)),
        depth(commit_txid, TO_SELF_DELAY as u32),
        depth(commit_txid, 100),
    ]);
    client.confirm_broadcasts = true;

    let mut daemon = Onchaind::new(client);
    daemon.serve().unwrap();

    assert_eq!(daemon.store().len(), 3);
    let delayed = daemon.store().get(1);
    assert_eq!(delayed.output_type, OutputType::DelayedOutputToUs);
    let proposal = delayed.proposal.as_ref().unwrap();
    assert_eq!(proposal.depth_required, TO_SELF_DELAY as u32);
    assert_eq!(proposal.tx_type, TxType::OurUnilateralToUsReturnToWallet);

    // resolved by our own broadcast confirming
    let res = delayed.resolved.as_ref().unwrap();
    assert_eq!(res.tx_type, TxType::OurUnilateralToUsReturnToWallet);
    assert_eq!(res.txid, proposal.tx.as_ref().unwrap().compute_txid());
    assert_eq!(res.depth, 100);

    let to_them = daemon.store().get(2);
    assert_eq!(to_them.output_type, OutputType::OutputToThem);
    assert_eq!(to_them.resolved.as_ref().unwrap().tx_type, TxType::SelfResolve);

    let outbound = outbound.borrow();
    // fired when the commitment hit to_self_delay, and again on the next
    // depth report since the sweep had not confirmed yet
    assert_eq!(count_broadcasts(&outbound), 2);
    for msg in outbound.iter() {
        if let Message::OnchainBroadcastTx(b) = msg {
            assert_eq!(b.tx.input[0].previous_output, OutPoint { txid: commit_txid, vout: 0 });
            assert_eq!(b.tx.input[0].sequence, Sequence(TO_SELF_DELAY as u32));
            assert_eq!(b.tx.output[0].script_pubkey, scripts::p2wpkh(&chan.wallet_pubkey));
        }
    }
}

#[test]
fn our_unilateral_offered_htlc_brute_forces_feerate() {
    let chan = TestChannel::new();
    let keyset = chan.our_keyset(COMMIT_NUM);
    let local_wscript = scripts::to_self_wscript(TO_SELF_DELAY, &keyset);

    let cltv_expiry = BLOCKHEIGHT + 50;
    let stub = HtlcStub { cltv_expiry, ripemd: [0x5a; 20], owner: Side::Local };
    let htlc_wscript = scripts::offered_htlc_wscript(&keyset, &stub.ripemd);

    let htlc_sat = 10_000u64;
    let commit = chan.commitment_tx(
        COMMIT_NUM,
        vec![
            payout(&local_wscript.to_p2wsh(), 50_000),
            payout(&scripts::p2wpkh(&keyset.other_payment_key), 30_000),
            payout(&htlc_wscript.to_p2wsh(), htlc_sat),
        ],
    );
    let commit_txid = commit.compute_txid();

    // The counterparty signed the HTLC-timeout at this feerate
    let signed_feerate = 10_000u32;
    let fee = htlc_timeout_fee(signed_feerate);
    let skeleton = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(cltv_expiry),
        input: vec![TxIn {
            previous_output: OutPoint { txid: commit_txid, vout: 2 },
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0),
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(htlc_sat - fee),
            script_pubkey: local_wscript.to_p2wsh(),
        }],
    };
    let point = per_commitment_point(&chan.secp, &chan.commitment_seed, COMMIT_NUM).unwrap();
    let remote_payment_privkey = lightning::ln::chan_utils::derive_private_key(
        &chan.secp,
        &point,
        &chan.remote_payment_secret,
    );
    let remotesig =
        sweep::sign_tx_input(&chan.secp, &skeleton, 0, &htlc_wscript, htlc_sat, &remote_payment_privkey)
            .unwrap();

    let (client, _outbound) = TestClient::new(vec![chan.init_msg(
        &commit,
        commit_txid,
        1,
        vec![Signature::from_ecdsa(&remotesig)],
        key(31).public_key(&chan.secp),
    ), htlc(&stub)]);

    let mut daemon = Onchaind::new(client);
    // the scripted parent hangs up after the handler ran
    match daemon.serve() {
        Err(Error::Wire(onchain_protocol::Error::Eof)) => (),
        other => panic!("expected eof, got {:?}", other),
    }

    let out = daemon.store().get(3);
    assert_eq!(out.output_type, OutputType::OurHtlc);
    let proposal = out.proposal.as_ref().unwrap();
    assert_eq!(proposal.tx_type, TxType::OurHtlcTimeoutToUs);
    assert_eq!(proposal.depth_required, 50);

    // the engine found the fee the signature was made for
    let timeout_tx = proposal.tx.as_ref().unwrap();
    assert_eq!(timeout_tx.output[0].value, Amount::from_sat(htlc_sat - fee));
    assert_eq!(timeout_tx.lock_time, LockTime::from_consensus(cltv_expiry));
    assert_eq!(timeout_tx.input[0].witness.len(), 5);
}

#[test]
fn their_unilateral_ignores_their_htlc_at_expiry() {
    let chan = TestChannel::new();
    let their_point = key(31).public_key(&chan.secp);
    let keyset = chan.their_keyset(&their_point);

    let cltv_expiry = BLOCKHEIGHT + 10;
    let stub = HtlcStub { cltv_expiry, ripemd: [0x77; 20], owner: Side::Remote };
    // they offered it, so on their commitment it is an offered HTLC
    let htlc_wscript = scripts::offered_htlc_wscript(&keyset, &stub.ripemd);

    // commitment number 1 == revocations_received + 1: current point
    let commit = chan.commitment_tx(1, vec![payout(&htlc_wscript.to_p2wsh(), 20_000)]);
    let commit_txid = commit.compute_txid();

    let (client, outbound) = TestClient::new(vec![
        chan.init_msg(&commit, Txid::from_byte_array([0xab; 32]), 1, vec![], their_point),
        htlc(&stub),
        depth(commit_txid, 10),
        depth(commit_txid, 100),
    ]);

    let mut daemon = Onchaind::new(client);
    daemon.serve().unwrap();

    let out = daemon.store().get(1);
    assert_eq!(out.output_type, OutputType::TheirHtlc);
    let proposal = out.proposal.as_ref().unwrap();
    assert!(proposal.tx.is_none());
    assert_eq!(proposal.depth_required, 10);
    assert_eq!(proposal.tx_type, TxType::TheirHtlcTimeoutToThem);

    // marked irrevocably resolved by the timeout, no transaction of ours
    let res = out.resolved.as_ref().unwrap();
    assert_eq!(res.tx_type, TxType::SelfResolve);
    assert_eq!(res.txid, commit_txid);
    assert_eq!(res.depth, 100);

    let outbound = outbound.borrow();
    assert!(matches!(
        outbound[0],
        Message::OnchainInitReply(ref r)
            if r.state == onchain_protocol::model::ChannelState::OnchaindTheirUnilateral
    ));
    assert_eq!(count_broadcasts(&outbound), 0);
}

#[test]
fn funding_respend_is_fatal() {
    let chan = TestChannel::new();
    let mutual = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: chan.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffff_fffd),
            witness: Witness::default(),
        }],
        output: vec![payout(&chan.local_closing_spk, 99_000)],
    };

    // a different transaction spending the same funding outpoint
    let mut evil = mutual.clone();
    evil.output[0].value = Amount::from_sat(98_000);

    let (client, outbound) = TestClient::new(vec![
        chan.init_msg(&mutual, Txid::from_byte_array([0xab; 32]), 0, vec![], key(31).public_key(&chan.secp)),
        spent(&evil, 0),
    ]);

    match onchaind::run(client) {
        Err(Error::InternalError(msg)) => assert!(msg.contains("funding output spent again")),
        other => panic!("expected internal error, got {:?}", other),
    }

    let outbound = outbound.borrow();
    match outbound.last().unwrap() {
        Message::OnchainStatusFail(fail) => {
            assert_eq!(fail.kind, onchain_protocol::model::FailureKind::InternalError);
        }
        other => panic!("expected status fail, got {:?}", other),
    }
}

#[test]
fn irrelevant_spend_is_unwatched() {
    let chan = TestChannel::new();
    let mutual = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: chan.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffff_fffd),
            witness: Witness::default(),
        }],
        output: vec![payout(&chan.local_closing_spk, 99_000)],
    };
    let mutual_txid = mutual.compute_txid();

    let stranger = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid: Txid::from_byte_array([0x11; 32]), vout: 7 },
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffff_ffff),
            witness: Witness::default(),
        }],
        output: vec![payout(&chan.local_closing_spk, 1_000), payout(&chan.remote_closing_spk, 2_000)],
    };
    let stranger_txid = stranger.compute_txid();

    let (client, outbound) = TestClient::new(vec![
        chan.init_msg(&mutual, Txid::from_byte_array([0xab; 32]), 0, vec![], key(31).public_key(&chan.secp)),
        spent(&stranger, 0),
        depth(mutual_txid, 100),
    ]);

    let mut daemon = Onchaind::new(client);
    daemon.serve().unwrap();

    // no state change beyond the mutual-close resolution
    assert_eq!(daemon.store().len(), 1);
    assert_eq!(daemon.store().get(0).resolved.as_ref().unwrap().tx_type, TxType::MutualClose);

    let outbound = outbound.borrow();
    let unwatches: Vec<_> = outbound
        .iter()
        .filter_map(|m| match m {
            Message::OnchainUnwatchTx(u) => Some(u),
            _ => None,
        })
        .collect();
    assert_eq!(unwatches.len(), 1);
    assert_eq!(unwatches[0].txid, stranger_txid);
    assert_eq!(unwatches[0].num_outputs, 2);
}
