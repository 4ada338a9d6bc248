use core::fmt::{self, Debug, Formatter};

use bitcoin::secp256k1::ecdsa;
use bitcoin::secp256k1::PublicKey;

use crate::error::{Error, Result};

macro_rules! secret_array_impl {
    ($ty:ident, $len:tt) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $ty(pub [u8; $len]);

        impl Debug for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "******")
            }
        }
    };
}

macro_rules! array_impl {
    ($ty:ident, $len:tt) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $ty(pub [u8; $len]);

        impl Debug for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0))
            }
        }
    };
}

secret_array_impl!(Secret, 32);
array_impl!(PubKey, 33);
array_impl!(Signature, 64);

impl PubKey {
    pub fn to_pubkey(&self) -> Result<PublicKey> {
        PublicKey::from_slice(&self.0).map_err(|_| Error::BadValue("pubkey"))
    }

    pub fn from_pubkey(key: &PublicKey) -> Self {
        PubKey(key.serialize())
    }
}

impl Signature {
    pub fn to_ecdsa(&self) -> Result<ecdsa::Signature> {
        ecdsa::Signature::from_compact(&self.0).map_err(|_| Error::BadValue("signature"))
    }

    pub fn from_ecdsa(sig: &ecdsa::Signature) -> Self {
        Signature(sig.serialize_compact())
    }
}

/// Which side of the channel a thing belongs to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn to_u8(self) -> u8 {
        match self {
            Side::Local => 0,
            Side::Remote => 1,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Side::Local),
            1 => Ok(Side::Remote),
            _ => Err(Error::BadValue("side")),
        }
    }
}

/// Channel state announced to the parent once the close is classified
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    OnchaindMutual,
    OnchaindOurUnilateral,
    OnchaindTheirUnilateral,
    OnchaindCheated,
}

impl ChannelState {
    pub fn to_u8(self) -> u8 {
        match self {
            ChannelState::OnchaindMutual => 1,
            ChannelState::OnchaindOurUnilateral => 2,
            ChannelState::OnchaindTheirUnilateral => 3,
            ChannelState::OnchaindCheated => 4,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(ChannelState::OnchaindMutual),
            2 => Ok(ChannelState::OnchaindOurUnilateral),
            3 => Ok(ChannelState::OnchaindTheirUnilateral),
            4 => Ok(ChannelState::OnchaindCheated),
            _ => Err(Error::BadValue("channel state")),
        }
    }
}

/// Failure category reported to the parent on fatal exit
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    BadCommand,
    InternalError,
    CryptoFailed,
}

impl FailureKind {
    pub fn to_u8(self) -> u8 {
        match self {
            FailureKind::BadCommand => 1,
            FailureKind::InternalError => 2,
            FailureKind::CryptoFailed => 3,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(FailureKind::BadCommand),
            2 => Ok(FailureKind::InternalError),
            3 => Ok(FailureKind::CryptoFailed),
            _ => Err(Error::BadValue("failure kind")),
        }
    }
}

/// The little the resolution engine needs to know about one HTLC
#[derive(Clone, PartialEq, Eq)]
pub struct HtlcStub {
    pub cltv_expiry: u32,
    /// ripemd160 of the payment hash, as committed in the HTLC script
    pub ripemd: [u8; 20],
    pub owner: Side,
}

impl Debug for HtlcStub {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtlcStub")
            .field("cltv_expiry", &self.cltv_expiry)
            .field("ripemd", &hex::encode(self.ripemd))
            .field("owner", &self.owner)
            .finish()
    }
}

/// One stored entry of the received-revocation shachain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShachainSecret {
    pub index: u64,
    pub secret: Secret,
}
