//! Private pipe addresses

use crate::error::{Error, Result};
use crate::socket::Socket;
use native::Errno;
use rand::Rng;
use tracing::debug;

pub const PIPE_PREFIX: &str = "inproc://zmq-bridge-pipe-";

/// Supplies the random part of pipe addresses
pub trait SuffixSource: Send + Sync {
    fn next_suffix(&self) -> String;
}

/// 128 random bits, hex encoded
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSuffix;

impl SuffixSource for RandomSuffix {
    fn next_suffix(&self) -> String {
        let bits: u128 = rand::thread_rng().gen();
        format!("{bits:032x}")
    }
}

pub fn pipe_address(suffix: &str) -> String {
    format!("{PIPE_PREFIX}{suffix}")
}

/// Bind `socket` to a fresh pipe address, drawing a new suffix whenever the
/// address is already taken. Any other bind failure ends the search.
pub(crate) fn bind_unique(socket: &Socket, suffixes: &dyn SuffixSource, attempts: u32) -> Result<String> {
    let mut last = None;
    for attempt in 1..=attempts {
        let address = pipe_address(&suffixes.next_suffix());
        match socket.bind(&address) {
            Ok(()) => return Ok(address),
            Err(err) if err.errno() == Some(Errno::EADDRINUSE) => {
                debug!(attempt, %address, "pipe address taken");
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| Error::config("bind_attempts must be at least 1")))
}
