// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use crate::messages::BlockFn;
use crate::payload::{Args, Payload};
use crate::receiver::Receiver;
use crate::server::RESPONDS_TO;
use crate::wrapper::Wrapper;
use crate::Result;

/// A cheap, clonable façade over a [`Wrapper`].
///
/// A stub has no state of its own: every invocation is forwarded to the
/// wrapper's `call` by method name. It exists to be handed to peers that
/// should be able to invoke the object without holding the wrapper itself.
pub struct Stub<T> {
    wrapper: Arc<Wrapper<T>>,
}

impl<T> Clone for Stub<T> {
    fn clone(&self) -> Self {
        Self {
            wrapper: Arc::clone(&self.wrapper),
        }
    }
}

impl<T: Receiver> Stub<T> {
    pub(crate) fn new(wrapper: Arc<Wrapper<T>>) -> Self {
        Self { wrapper }
    }

    /// The wrapper this stub forwards to.
    #[must_use]
    pub fn wrapper(&self) -> &Wrapper<T> {
        &self.wrapper
    }

    /// Forwards to [`Wrapper::call`].
    pub fn call(&self, method: &str, args: &mut Args) -> Result<Payload> {
        self.wrapper.call(method, args)
    }

    /// Forwards to [`Wrapper::call_with_block`].
    pub fn call_with_block(&self, method: &str, args: &mut Args, block: BlockFn) -> Result<Payload> {
        self.wrapper.call_with_block(method, args, block)
    }

    /// Asks the wrapped object whether it answers `method`.
    ///
    /// The query is dispatched through the server like any call, so it
    /// observes arrival order and shutdown refusal.
    pub fn responds_to(&self, method: &str) -> Result<bool> {
        self.wrapper
            .call(RESPONDS_TO, &mut Args::new().arg(method.to_owned()))?
            .downcast()
    }
}

impl<T> fmt::Debug for Stub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub").finish_non_exhaustive()
    }
}
