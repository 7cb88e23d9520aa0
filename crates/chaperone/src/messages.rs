// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use crate::payload::{Args, Payload};
use crate::policy::MethodPolicy;
use crate::Error;

/// A caller-supplied block, invoked zero or more times during one call.
///
/// The closure must be `Send`: under an in-place policy it is transported to
/// the server and executed there; otherwise it stays in the caller's domain
/// and each yield is relayed back by message.
pub type BlockFn = Box<dyn FnMut(Args) -> crate::Result<Payload> + Send>;

/// Messages accepted on the server inbox.
pub(crate) enum ServerMessage {
    /// Dispatch a method call.
    Call(CallRequest),
    /// Begin draining and terminate.
    Stop,
    /// Signal `reply` once the server has terminated.
    Join { reply: flume::Sender<()> },
    /// A pool worker has exited.
    WorkerStopped { worker: usize },
}

/// One method call travelling from a caller to the server.
pub(crate) struct CallRequest {
    pub method: String,
    pub args: Args,
    pub block: BlockSlot,
    pub transaction: Transaction,
    pub policy: MethodPolicy,
    pub reply: flume::Sender<Reply>,
}

impl fmt::Debug for CallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRequest")
            .field("method", &self.method)
            .field("transaction", &self.transaction)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

/// The block argument slot of a call.
pub(crate) enum BlockSlot {
    /// No block was given.
    None,
    /// The block itself, transported for in-place execution.
    InPlace(BlockFn),
    /// The block stays with the caller; yields are relayed by message.
    Relay,
}

impl fmt::Debug for BlockSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::InPlace(_) => f.write_str("InPlace(..)"),
            Self::Relay => f.write_str("Relay"),
        }
    }
}

/// Replies travelling back on a per-call reply channel, and on the
/// sub-channel of each relayed yield.
///
/// Per transaction a caller observes zero or more `Yield`s followed by
/// exactly one terminal `Return` or `Exception`. A yield sub-channel only
/// ever carries a terminal reply.
#[derive(Debug)]
pub(crate) enum Reply {
    Return(Payload),
    Exception(Error),
    Yield {
        args: Args,
        reply: flume::Sender<Reply>,
    },
}

/// Identifier of one end-to-end call: 120 random bits rendered base-36.
///
/// Opaque to the server; carried only so log lines of one transaction can be
/// correlated across domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transaction(String);

impl Transaction {
    pub(crate) fn generate() -> Self {
        let bits = rand::random::<u128>() >> 8;
        Self(to_base36(bits))
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_owned();
    }
    let mut rendered = Vec::new();
    while value > 0 {
        rendered.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    rendered.reverse();
    String::from_utf8(rendered).expect("base-36 digits are ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_renders_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(36 * 36 + 1), "101");
    }

    #[test]
    fn transactions_are_distinct_and_bounded() {
        let a = Transaction::generate();
        let b = Transaction::generate();

        assert_ne!(a, b);
        // 36^24 > 2^120, so 24 digits always suffice.
        assert!(a.to_string().len() <= 24);
    }
}
