//! The duplex wire to the parent daemon.

use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;

use onchain_protocol::msgs::{self, Message, SerMsg};

use crate::error::Result;

/// stdin == requests
const REQ_FD: i32 = 0;

/// One read point, one write point; the engine has no other I/O
pub trait Client {
    fn read(&mut self) -> Result<Message>;
    fn write<M: SerMsg>(&mut self, msg: &M) -> Result<()>;
}

/// The real thing: fd 0, wired up by the parent before exec
pub struct StdinClient {
    conn: UnixStream,
}

impl StdinClient {
    /// Takes ownership of fd 0; call once per process
    pub fn new() -> Self {
        StdinClient { conn: unsafe { UnixStream::from_raw_fd(REQ_FD) } }
    }
}

impl Client for StdinClient {
    fn read(&mut self) -> Result<Message> {
        Ok(msgs::read(&mut self.conn)?)
    }

    fn write<M: SerMsg>(&mut self, msg: &M) -> Result<()> {
        Ok(msgs::write(&mut self.conn, msg)?)
    }
}
