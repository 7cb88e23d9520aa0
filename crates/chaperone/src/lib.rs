// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A method-call façade over an object owned by a server thread.
//!
//! `chaperone` lets many threads invoke a single, non-shareable object
//! through a message-passing adapter. The object lives behind an internal
//! server that owns it and performs calls on its behalf; peers only ever
//! hold the [`Wrapper`] (or a [`Stub`] cloned from it) and talk to the
//! server over channels. The adapter differs from an ordinary mutex in
//! three ways:
//!
//! 1. **Ownership, not locking.** An isolated wrapper takes the object by
//!    value. Nothing else can touch it while the server runs, and a clean
//!    shutdown hands it back through [`Wrapper::recover_object`]. A *local*
//!    wrapper ([`Wrapper::wrap_local`]) instead shares the object with the
//!    caller, trading recovery for continued direct access.
//!
//! 2. **Per-method transport policies.** Every payload class of a call —
//!    arguments, results, block arguments, block results — is independently
//!    *moved* (ownership transferred, the sender's [`Payload`] handle left
//!    empty) or *copied* (deep clone, the sender unaffected), configured
//!    per method through [`TransportSpec`] and frozen at start.
//!
//! 3. **Reentrant blocks.** A call may carry a block the method yields to
//!    any number of times. By default each yield is relayed back and the
//!    block runs on the calling thread; with
//!    [`execute_blocks_in_place`](TransportSpec::execute_blocks_in_place)
//!    the block is transported once and runs in the server's domain.
//!
//! Execution is sequential by default (one invocation at a time, suitable
//! for objects whose operations must not interleave) or parallel through a
//! bounded worker pool ([`WrapperBuilder::with_threads`]). Shutdown is
//! graceful: [`Wrapper::async_stop`] lets in-flight and queued calls finish
//! while refusing new ones with [`Error::Closed`].
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use chaperone::{Args, Error, Invocation, Payload, Receiver, Wrapper};
//!
//! struct Greeter;
//!
//! impl Receiver for Greeter {
//!     fn receive(&self, mut invocation: Invocation<'_>) -> chaperone::Result<Payload> {
//!         let mut args = invocation.take_args();
//!         match invocation.method() {
//!             "greet" => {
//!                 let name: String = args.take(0)?.downcast()?;
//!                 Ok(Payload::new(format!("hello, {name}")))
//!             }
//!             other => Err(Error::NoSuchMethod(other.to_owned())),
//!         }
//!     }
//!
//!     fn responds_to(&self, method: &str) -> bool {
//!         method == "greet"
//!     }
//! }
//!
//! let wrapper = Arc::new(Wrapper::wrap(Greeter).start());
//!
//! let greeting: String = wrapper
//!     .call("greet", &mut Args::new().arg("world".to_owned()))?
//!     .downcast()?;
//! assert_eq!(greeting, "hello, world");
//!
//! wrapper.async_stop().join();
//! let _greeter = wrapper.recover_object()?;
//! # Ok::<(), chaperone::Error>(())
//! ```
//!
//! # Calls in flight
//!
//! A call is a small conversation, not a one-shot exchange. The caller
//! sends the request on the server inbox together with a fresh reply
//! channel, then loops on that channel: zero or more yields (each answered
//! on its own sub-channel), followed by exactly one terminal return or
//! exception. Calls are dispatched in arrival order; with a worker pool,
//! completions across transactions may interleave freely.

mod error;
mod messages;
mod payload;
mod policy;
mod receiver;
mod server;
mod stub;
mod wrapper;

pub use error::{Error, Result};
pub use messages::BlockFn;
pub use payload::{Args, Payload, Transferable};
pub use policy::{MethodPolicy, TransportSpec};
pub use receiver::{Invocation, Receiver};
pub use stub::Stub;
pub use wrapper::{Wrapper, WrapperBuilder};
