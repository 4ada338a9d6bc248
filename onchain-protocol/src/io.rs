use std::io::Read;

use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::{Transaction, Txid};

use crate::error::{Error, Result};

/// Fill `buf` completely.  A clean EOF before the first byte is `Eof`,
/// anything shorter after that is `ShortRead`.
pub(crate) fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let len = reader.read(&mut buf[done..])?;
        if len == 0 {
            return Err(if done == 0 { Error::Eof } else { Error::ShortRead });
        }
        done += len;
    }
    Ok(())
}

pub(crate) fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    fill(reader, &mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    fill(reader, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    fill(reader, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    fill(reader, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    fill(reader, &mut buf)?;
    Ok(buf)
}

/// u16-length-prefixed byte string
pub(crate) fn read_varbytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_u16(reader)? as usize;
    let mut buf = vec![0u8; len];
    fill(reader, &mut buf)?;
    Ok(buf)
}

pub(crate) fn read_txid<R: Read>(reader: &mut R) -> Result<Txid> {
    Ok(Txid::from_byte_array(read_array::<R, 32>(reader)?))
}

/// u32-length-prefixed consensus-encoded transaction
pub(crate) fn read_tx<R: Read>(reader: &mut R) -> Result<Transaction> {
    let len = read_u32(reader)? as usize;
    let mut buf = vec![0u8; len];
    fill(reader, &mut buf)?;
    Ok(consensus::encode::deserialize(&buf)?)
}

pub(crate) fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    buf.extend_from_slice(v);
}

pub(crate) fn put_varbytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u16(buf, v.len() as u16);
    buf.extend_from_slice(v);
}

pub(crate) fn put_txid(buf: &mut Vec<u8>, txid: &Txid) {
    buf.extend_from_slice(&txid.to_byte_array());
}

pub(crate) fn put_tx(buf: &mut Vec<u8>, tx: &Transaction) {
    let ser = consensus::encode::serialize(tx);
    put_u32(buf, ser.len() as u32);
    buf.extend_from_slice(&ser);
}
