//! On-chain resolution engine for a single Lightning payment channel.
//!
//! Once the channel's funding output is spent, this engine classifies
//! the close (mutual, our unilateral, their unilateral, or a revoked
//! cheat), derives the per-commitment keys, matches every commitment
//! output to a known script, constructs and signs the sweeps it is
//! entitled to, and tracks everything until each output is resolved by
//! a transaction 100 blocks deep.
//!
//! All blockchain knowledge comes from the parent daemon over fd 0; see
//! the `onchain-protocol` crate for the wire contract.

pub mod client;
pub mod close;
pub mod daemon;
pub mod error;
pub mod feerate;
pub mod handlers;
pub mod keys;
pub mod output;
pub mod scripts;
pub mod sweep;

pub use daemon::{run, ChannelContext, Onchaind};
pub use error::{Error, Result};
