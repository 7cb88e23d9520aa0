// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::messages::{BlockFn, BlockSlot, CallRequest, Reply, ServerMessage, Transaction};
use crate::payload::{Args, Payload};
use crate::policy::{MethodPolicy, TransportSpec};
use crate::receiver::Receiver;
use crate::server::Server;
use crate::stub::Stub;
use crate::{Error, Result};

/// Collects configuration and starts the server behind a [`Wrapper`].
///
/// Obtained from [`Wrapper::wrap`] or [`Wrapper::wrap_local`]. All
/// configuration happens here; [`start`](Self::start) freezes it, spawns the
/// server thread, and returns the immutable wrapper. The wrapper value does
/// not exist before `start` returns, so no peer can observe a half-configured
/// one.
pub struct WrapperBuilder<T> {
    backing: Backing<T>,
    name: Option<String>,
    threads: usize,
    logging: bool,
    default_spec: TransportSpec,
    method_specs: Vec<(String, TransportSpec)>,
}

enum Backing<T> {
    /// The wrapper takes exclusive ownership; the object is recoverable
    /// after shutdown.
    Owned(T),
    /// The caller keeps shared access; the object is never relinquished.
    Shared(Arc<T>),
}

impl<T: Receiver> WrapperBuilder<T> {
    fn new(backing: Backing<T>) -> Self {
        Self {
            backing,
            name: None,
            threads: 0,
            logging: false,
            default_spec: TransportSpec::default(),
            method_specs: Vec::new(),
        }
    }

    /// Sets the wrapper's name, used to tag every log event.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the worker count. Zero (the default) executes calls one at a
    /// time on the server thread itself.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Enables per-message and lifecycle log events.
    #[must_use]
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Sets the base transport of the default policy.
    #[must_use]
    pub fn with_move_data(mut self, value: bool) -> Self {
        self.default_spec = self.default_spec.move_data(value);
        self
    }

    /// Sets argument transport of the default policy.
    #[must_use]
    pub fn with_move_arguments(mut self, value: bool) -> Self {
        self.default_spec = self.default_spec.move_arguments(value);
        self
    }

    /// Sets result transport of the default policy.
    #[must_use]
    pub fn with_move_results(mut self, value: bool) -> Self {
        self.default_spec = self.default_spec.move_results(value);
        self
    }

    /// Sets block-argument transport of the default policy.
    #[must_use]
    pub fn with_move_block_arguments(mut self, value: bool) -> Self {
        self.default_spec = self.default_spec.move_block_arguments(value);
        self
    }

    /// Sets block-result transport of the default policy.
    #[must_use]
    pub fn with_move_block_results(mut self, value: bool) -> Self {
        self.default_spec = self.default_spec.move_block_results(value);
        self
    }

    /// Makes blocks run on the server side by default.
    #[must_use]
    pub fn with_execute_blocks_in_place(mut self, value: bool) -> Self {
        self.default_spec = self.default_spec.execute_blocks_in_place(value);
        self
    }

    /// Registers a per-method transport override. The last spec registered
    /// for a method wins.
    #[must_use]
    pub fn configure_method(mut self, method: impl Into<String>, spec: TransportSpec) -> Self {
        self.method_specs.push((method.into(), spec));
        self
    }

    /// Freezes the configuration, spawns the server, and returns the
    /// wrapper.
    pub fn start(self) -> Wrapper<T> {
        let Self {
            backing,
            name,
            threads,
            logging,
            default_spec,
            method_specs,
        } = self;

        let name: Arc<str> = name.unwrap_or_else(|| default_name::<T>()).into();
        let default_policy = MethodPolicy::resolve(default_spec);
        let policies: HashMap<String, MethodPolicy> = method_specs
            .into_iter()
            .map(|(method, spec)| (method, MethodPolicy::resolve(spec)))
            .collect();

        let (inbox_tx, inbox_rx) = flume::unbounded();
        let (object, local) = match backing {
            Backing::Owned(object) => (Arc::new(object), false),
            Backing::Shared(object) => (object, true),
        };

        let handle = {
            let name = Arc::clone(&name);
            let worker_inbox = inbox_tx.clone();
            thread::Builder::new()
                .name(format!("{name}-server"))
                .spawn(move || Server::run(object, inbox_rx, worker_inbox, name, logging, threads))
                .expect("failed to spawn wrapper server thread")
        };

        let mode = if local {
            // Joining a local wrapper goes through the inbox; the thread
            // handle is not needed.
            Mode::Local
        } else {
            Mode::Isolated {
                completion: Mutex::new(Completion::Running(handle)),
            }
        };

        if logging {
            debug!(wrapper = %name, threads, local, "wrapper started");
        }

        Wrapper {
            name,
            threads,
            logging,
            default_policy,
            policies,
            inbox: inbox_tx,
            mode,
        }
    }
}

/// A shareable method-call façade over an object owned by a server thread.
///
/// Many peers may call through one wrapper concurrently; it is usually kept
/// behind an [`Arc`]. Configuration is frozen at construction. Calls are
/// marshalled to the server over channels and executed sequentially
/// (`threads == 0`) or by a bounded worker pool.
pub struct Wrapper<T> {
    name: Arc<str>,
    threads: usize,
    logging: bool,
    default_policy: MethodPolicy,
    policies: HashMap<String, MethodPolicy>,
    inbox: flume::Sender<ServerMessage>,
    mode: Mode<T>,
}

enum Mode<T> {
    Isolated { completion: Mutex<Completion<T>> },
    Local,
}

enum Completion<T> {
    /// The server thread has not been waited on yet.
    Running(thread::JoinHandle<Arc<T>>),
    /// The server terminated; `None` once the object has been recovered.
    Finished(Option<Arc<T>>),
}

impl<T: Receiver> Wrapper<T> {
    /// Starts configuring an isolated wrapper that takes ownership of
    /// `object`. The object can be taken back with
    /// [`recover_object`](Self::recover_object) after shutdown.
    #[must_use]
    pub fn wrap(object: T) -> WrapperBuilder<T> {
        WrapperBuilder::new(Backing::Owned(object))
    }

    /// Starts configuring a local wrapper that shares `object` with the
    /// caller. The caller's own handle stays usable alongside the wrapper;
    /// recovery is not available.
    #[must_use]
    pub fn wrap_local(object: Arc<T>) -> WrapperBuilder<T> {
        WrapperBuilder::new(Backing::Shared(object))
    }

    /// The wrapper's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The worker count; zero means sequential execution.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// Whether log events are emitted.
    #[must_use]
    pub const fn logging_enabled(&self) -> bool {
        self.logging
    }

    /// Whether this is a local wrapper sharing the object with the caller.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.mode, Mode::Local)
    }

    /// The transport policy for `method`: its registered override, or the
    /// wrapper's default.
    #[must_use]
    pub fn method_policy(&self, method: &str) -> MethodPolicy {
        self.policies
            .get(method)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// A cheap, clonable façade over this wrapper.
    ///
    /// Consumes one `Arc` handle; call on a clone to keep using the wrapper
    /// directly as well.
    #[must_use]
    pub fn stub(self: Arc<Self>) -> Stub<T> {
        Stub::new(self)
    }

    /// Invokes `method` on the wrapped object and returns its result.
    ///
    /// Arguments are moved or copied to the server per the method's policy;
    /// under move transport the handles left in `args` are emptied and any
    /// later use of them fails with [`Error::Moved`]. Errors raised by the
    /// method are re-raised here.
    pub fn call(&self, method: &str, args: &mut Args) -> Result<Payload> {
        self.drive(method, args, None)
    }

    /// Like [`call`](Self::call), with a block the method may yield to any
    /// number of times before returning.
    ///
    /// Under the method's policy the block either runs in the server's
    /// domain (`execute_blocks_in_place`) or stays here, with every yield
    /// relayed back and executed on the calling thread.
    pub fn call_with_block(&self, method: &str, args: &mut Args, block: BlockFn) -> Result<Payload> {
        self.drive(method, args, Some(block))
    }

    fn drive(&self, method: &str, args: &mut Args, block: Option<BlockFn>) -> Result<Payload> {
        let policy = self.method_policy(method);
        let transaction = Transaction::generate();
        let (reply_tx, reply_rx) = flume::unbounded();

        let (slot, mut local_block) = match block {
            None => (BlockSlot::None, None),
            Some(block) if policy.execute_blocks_in_place() => (BlockSlot::InPlace(block), None),
            Some(block) => (BlockSlot::Relay, Some(block)),
        };
        let sent_args = args.lift(policy.move_arguments())?;

        if self.logging {
            debug!(
                wrapper = %self.name,
                transaction = %transaction,
                method = method,
                "sending call"
            );
        }
        self.inbox
            .send(ServerMessage::Call(CallRequest {
                method: method.to_owned(),
                args: sent_args,
                block: slot,
                transaction: transaction.clone(),
                policy,
                reply: reply_tx,
            }))
            .map_err(|_| Error::Closed)?;

        // One call is a small conversation, not a one-shot exchange: any
        // number of yields may arrive before the terminal reply.
        loop {
            match reply_rx.recv() {
                Ok(Reply::Yield { args, reply }) => {
                    let outcome = match &mut local_block {
                        Some(block) => block(args),
                        None => Err(Error::NoBlock),
                    };
                    let answer = match outcome {
                        Ok(value) => {
                            Reply::Return(value.into_transport(policy.move_block_results()))
                        }
                        Err(error) => Reply::Exception(error),
                    };
                    if reply.send(answer).is_err() && self.logging {
                        debug!(
                            wrapper = %self.name,
                            transaction = %transaction,
                            "yield reply channel closed"
                        );
                    }
                }
                Ok(Reply::Return(value)) => return Ok(value),
                Ok(Reply::Exception(error)) => return Err(error),
                // The reply channel died in a teardown race; the server is
                // gone or going.
                Err(_) => return Err(Error::Closed),
            }
        }
    }

    /// Asks the server to stop accepting calls and wind down.
    ///
    /// In-flight and already-queued calls still complete; later calls are
    /// refused with [`Error::Closed`]. Idempotent and callable from any
    /// peer; a stop after full teardown is a no-op.
    pub fn async_stop(&self) -> &Self {
        let _ = self.inbox.send(ServerMessage::Stop);
        if self.logging {
            debug!(wrapper = %self.name, "stop requested");
        }
        self
    }

    /// Blocks until the server has terminated.
    ///
    /// Does not itself request a stop. A join after full teardown returns
    /// immediately.
    pub fn join(&self) -> &Self {
        match &self.mode {
            Mode::Isolated { completion } => self.await_completion(completion),
            Mode::Local => {
                let (reply_tx, reply_rx) = flume::unbounded();
                if self
                    .inbox
                    .send(ServerMessage::Join { reply: reply_tx })
                    .is_ok()
                {
                    // A disconnect means the server tore down without
                    // answering, which is just as final.
                    let _ = reply_rx.recv();
                }
            }
        }
        self
    }

    /// Waits for the server to terminate and hands back the wrapped object.
    ///
    /// Only isolated wrappers own their object; a local wrapper answers
    /// [`Error::RecoveryNotPermitted`]. The object can be recovered once;
    /// afterwards [`Error::AlreadyRecovered`] is reported.
    pub fn recover_object(&self) -> Result<T> {
        let Mode::Isolated { completion } = &self.mode else {
            return Err(Error::RecoveryNotPermitted);
        };
        self.await_completion(completion);

        let mut state = completion.lock().expect("completion state lock poisoned");
        let Completion::Finished(slot) = &mut *state else {
            unreachable!("await_completion leaves the state finished");
        };
        let object = slot.take().ok_or(Error::AlreadyRecovered)?;
        match Arc::try_unwrap(object) {
            Ok(object) => Ok(object),
            Err(_) => unreachable!("the server returns the last surviving object handle"),
        }
    }

    fn await_completion(&self, completion: &Mutex<Completion<T>>) {
        let mut state = completion.lock().expect("completion state lock poisoned");
        if matches!(&*state, Completion::Running(_)) {
            let Completion::Running(handle) =
                mem::replace(&mut *state, Completion::Finished(None))
            else {
                unreachable!("just matched the running state");
            };
            let object = match handle.join() {
                Ok(object) => Some(object),
                Err(_) => {
                    warn!(wrapper = %self.name, "server thread panicked");
                    None
                }
            };
            *state = Completion::Finished(object);
        }
    }
}

impl<T> Drop for Wrapper<T> {
    fn drop(&mut self) {
        // An abandoned wrapper should not leave its server parked forever.
        let _ = self.inbox.send(ServerMessage::Stop);
    }
}

impl<T> fmt::Debug for Wrapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapper")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("local", &matches!(self.mode, Mode::Local))
            .finish_non_exhaustive()
    }
}

fn default_name<T>() -> String {
    static NEXT_WRAPPER: AtomicU64 = AtomicU64::new(0);

    let type_name = any::type_name::<T>().rsplit("::").next().unwrap_or("object");
    format!("{type_name}#{}", NEXT_WRAPPER.fetch_add(1, Ordering::Relaxed))
}
