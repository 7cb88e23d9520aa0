// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::messages::{BlockFn, Reply};
use crate::payload::{Args, Payload};
use crate::policy::MethodPolicy;
use crate::{Error, Result};

/// Implemented by objects that can live behind a wrapper.
///
/// This is the dispatch seam: the wrapper carries method names and payloads
/// across the domain boundary, and `receive` turns them back into concrete
/// operations. Implementations are an explicit method table, typically a
/// `match` over [`Invocation::method`].
///
/// The trait requires `Sync` because a pooled wrapper invokes the object
/// from several worker threads at once. A sequential wrapper
/// (`threads == 0`) still guarantees at most one in-flight invocation, so
/// operations that must not interleave can rely on that ordering.
pub trait Receiver: Send + Sync + 'static {
    /// Dispatches one method invocation.
    ///
    /// Returns the method's result payload, or the error to re-raise in the
    /// caller's domain. Unknown methods conventionally answer
    /// [`Error::NoSuchMethod`].
    fn receive(&self, invocation: Invocation<'_>) -> Result<Payload>;

    /// Whether the object answers the named method.
    ///
    /// Capability queries from [`Stub::responds_to`](crate::Stub::responds_to)
    /// are routed here by the server without going through `receive`.
    fn responds_to(&self, method: &str) -> bool;
}

/// One method invocation as seen by the wrapped object.
///
/// Carries the method name, the (already transported) arguments, and the
/// effective block. [`yield_to_block`](Self::yield_to_block) may be called
/// any number of times before the method returns.
pub struct Invocation<'a> {
    method: &'a str,
    args: Option<Args>,
    block: BlockAccess<'a>,
    policy: MethodPolicy,
}

/// How a yield reaches the caller's block.
pub(crate) enum BlockAccess<'a> {
    /// No block was given.
    None,
    /// The block was transported to the server; yields run it directly.
    InPlace(BlockFn),
    /// The block stayed with the caller; yields are relayed on the call's
    /// reply channel.
    Relay { reply: &'a flume::Sender<Reply> },
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        method: &'a str,
        args: Args,
        block: BlockAccess<'a>,
        policy: MethodPolicy,
    ) -> Self {
        Self {
            method,
            args: Some(args),
            block,
            policy,
        }
    }

    /// The invoked method's name.
    #[must_use]
    pub fn method(&self) -> &str {
        self.method
    }

    /// Takes the argument bundle. Subsequent calls return an empty bundle.
    pub fn take_args(&mut self) -> Args {
        self.args.take().unwrap_or_default()
    }

    /// Whether the caller supplied a block.
    #[must_use]
    pub fn has_block(&self) -> bool {
        !matches!(self.block, BlockAccess::None)
    }

    /// Invokes the caller's block with `args` and waits for its result.
    ///
    /// For a relayed block this sends a yield message back on the call's
    /// reply channel and blocks until the caller answers on a fresh
    /// sub-channel; block arguments are moved or copied per the method's
    /// policy. Fails with [`Error::NoBlock`] when no block was given, and
    /// with whatever error the block itself raised otherwise.
    pub fn yield_to_block(&mut self, args: Args) -> Result<Payload> {
        match &mut self.block {
            BlockAccess::None => Err(Error::NoBlock),
            BlockAccess::InPlace(block) => block(args),
            BlockAccess::Relay { reply } => relay_yield(reply, args, self.policy),
        }
    }
}

fn relay_yield(call_reply: &flume::Sender<Reply>, args: Args, policy: MethodPolicy) -> Result<Payload> {
    let (reply_tx, reply_rx) = flume::unbounded();
    let args = args.into_transport(policy.move_block_arguments());

    call_reply
        .send(Reply::Yield {
            args,
            reply: reply_tx,
        })
        .map_err(|_| Error::Closed)?;

    match reply_rx.recv() {
        Ok(Reply::Return(value)) => Ok(value),
        Ok(Reply::Exception(error)) => Err(error),
        // The caller only ever answers a yield with a terminal reply; a
        // dropped sub-channel means the caller is gone.
        Ok(Reply::Yield { .. }) | Err(_) => Err(Error::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yield_without_block_is_refused() {
        let mut invocation = Invocation::new(
            "each",
            Args::new(),
            BlockAccess::None,
            MethodPolicy::default(),
        );
        assert!(matches!(
            invocation.yield_to_block(Args::new()),
            Err(Error::NoBlock)
        ));
    }

    #[test]
    fn in_place_block_runs_directly_and_repeatedly() {
        let block: BlockFn = Box::new(|mut args| {
            let n: i32 = args.take(0)?.downcast()?;
            Ok(Payload::new(n * 2))
        });
        let mut invocation = Invocation::new(
            "each",
            Args::new(),
            BlockAccess::InPlace(block),
            MethodPolicy::default(),
        );

        for n in 1..=3 {
            let doubled: i32 = invocation
                .yield_to_block(Args::new().arg(n))
                .unwrap()
                .downcast()
                .unwrap();
            assert_eq!(doubled, n * 2);
        }
    }

    #[test]
    fn args_are_taken_once() {
        let mut invocation = Invocation::new(
            "echo",
            Args::new().arg(1_i32),
            BlockAccess::None,
            MethodPolicy::default(),
        );
        assert_eq!(invocation.take_args().len(), 1);
        assert!(invocation.take_args().is_empty());
    }
}
