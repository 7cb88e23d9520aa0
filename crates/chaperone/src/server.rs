// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::messages::{BlockSlot, CallRequest, Reply, ServerMessage};
use crate::payload::{Args, Payload};
use crate::receiver::{BlockAccess, Invocation, Receiver};
use crate::{Error, Result};

/// Method name the stub uses for capability queries. Answered by the server
/// from [`Receiver::responds_to`] without invoking `receive`.
pub(crate) const RESPONDS_TO: &str = "responds_to";

/// The object-owning actor behind a wrapper.
///
/// Runs on its own thread, reading the inbox and executing calls either
/// inline (sequential mode) or through a bounded worker pool. The lifecycle
/// is Init, Running, Draining, Cleanup; the thread's return value is the
/// object handle, which `recover_object` unwraps for isolated wrappers.
pub(crate) struct Server<T> {
    object: Arc<T>,
    inbox: flume::Receiver<ServerMessage>,
    /// Job queue sender, present iff pooled. Dropping it closes the queue.
    jobs: Option<flume::Sender<CallRequest>>,
    workers_alive: usize,
    join_replies: Vec<flume::Sender<()>>,
    name: Arc<str>,
    logging: bool,
    threads: usize,
}

impl<T: Receiver> Server<T> {
    /// Runs the whole lifecycle to completion and returns the object handle.
    pub(crate) fn run(
        object: Arc<T>,
        inbox: flume::Receiver<ServerMessage>,
        worker_inbox: flume::Sender<ServerMessage>,
        name: Arc<str>,
        logging: bool,
        threads: usize,
    ) -> Arc<T> {
        let mut server = Self {
            object,
            inbox,
            jobs: None,
            workers_alive: 0,
            join_replies: Vec::new(),
            name,
            logging,
            threads,
        };
        // worker_inbox is consumed here; after init only the wrapper and the
        // workers hold inbox senders, so a fully abandoned wrapper
        // disconnects the inbox and the server winds down on its own.
        server.init(worker_inbox);
        server.running();
        server.draining();
        server.cleanup()
    }

    fn init(&mut self, worker_inbox: flume::Sender<ServerMessage>) {
        if self.threads == 0 {
            return;
        }

        let (jobs_tx, jobs_rx) = flume::unbounded();
        for worker in 0..self.threads {
            let object = Arc::clone(&self.object);
            let jobs = jobs_rx.clone();
            let inbox = worker_inbox.clone();
            let name = Arc::clone(&self.name);
            let logging = self.logging;

            thread::Builder::new()
                .name(format!("{}-worker-{worker}", self.name))
                .spawn(move || worker_loop(worker, object, &jobs, &inbox, &name, logging))
                .expect("failed to spawn wrapper worker thread");
        }

        self.jobs = Some(jobs_tx);
        self.workers_alive = self.threads;
        if self.logging {
            debug!(wrapper = %self.name, workers = self.threads, "worker pool started");
        }
    }

    /// Dispatches inbox messages until a stop trigger is seen.
    fn running(&mut self) {
        if self.logging {
            debug!(wrapper = %self.name, threads = self.threads, "server running");
        }
        loop {
            let message = match self.inbox.recv() {
                Ok(message) => message,
                // Every sender is gone; nobody can call or stop us anymore.
                Err(_) => return,
            };
            match message {
                ServerMessage::Call(request) => self.dispatch(request),
                ServerMessage::Join { reply } => self.join_replies.push(reply),
                ServerMessage::Stop => {
                    if self.logging {
                        debug!(wrapper = %self.name, "stop received");
                    }
                    return;
                }
                ServerMessage::WorkerStopped { worker } => {
                    warn!(wrapper = %self.name, worker, "worker stopped while running");
                    self.workers_alive = self.workers_alive.saturating_sub(1);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, request: CallRequest) {
        match &self.jobs {
            Some(jobs) => {
                if let Err(flume::SendError(request)) = jobs.send(request) {
                    // Queue closed under us; nothing will execute this call.
                    refuse(request, &self.name, self.logging);
                }
            }
            None => execute_call(self.object.as_ref(), request, None, &self.name, self.logging),
        }
    }

    /// Closes the job queue and waits for every worker to exit. Calls
    /// arriving in the meantime are refused; in-flight and already-queued
    /// jobs still complete. A no-op in sequential mode.
    fn draining(&mut self) {
        self.jobs = None;
        if self.workers_alive > 0 && self.logging {
            debug!(wrapper = %self.name, workers = self.workers_alive, "draining worker pool");
        }
        while self.workers_alive > 0 {
            let message = match self.inbox.recv() {
                Ok(message) => message,
                Err(_) => return,
            };
            match message {
                ServerMessage::Call(request) => refuse(request, &self.name, self.logging),
                ServerMessage::Join { reply } => self.join_replies.push(reply),
                ServerMessage::Stop => {}
                ServerMessage::WorkerStopped { worker } => {
                    if self.logging {
                        debug!(wrapper = %self.name, worker, "worker stopped");
                    }
                    self.workers_alive = self.workers_alive.saturating_sub(1);
                }
            }
        }
    }

    /// Answers pending joins, refuses whatever is still buffered, and hands
    /// the object back. Dropping the inbox receiver afterwards disconnects
    /// the reply channel of any call racing the teardown, which its caller
    /// reports as [`Error::Closed`].
    fn cleanup(mut self) -> Arc<T> {
        for reply in self.join_replies.drain(..) {
            let _ = reply.send(());
        }
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                ServerMessage::Call(request) => refuse(request, &self.name, self.logging),
                ServerMessage::Join { reply } => {
                    let _ = reply.send(());
                }
                ServerMessage::Stop | ServerMessage::WorkerStopped { .. } => {}
            }
        }
        if self.logging {
            debug!(wrapper = %self.name, "server terminated");
        }
        self.object
    }
}

fn worker_loop<T: Receiver>(
    worker: usize,
    object: Arc<T>,
    jobs: &flume::Receiver<CallRequest>,
    inbox: &flume::Sender<ServerMessage>,
    name: &str,
    logging: bool,
) {
    if logging {
        debug!(wrapper = name, worker, "worker started");
    }
    while let Ok(request) = jobs.recv() {
        execute_call(object.as_ref(), request, Some(worker), name, logging);
    }
    // The server unwraps the object once the last WorkerStopped arrives, so
    // this handle must be gone before the message is sent.
    drop(object);
    if logging {
        debug!(wrapper = name, worker, "worker exiting");
    }
    let _ = inbox.send(ServerMessage::WorkerStopped { worker });
}

/// Executes one call against the object and sends the terminal reply.
fn execute_call<T: Receiver>(
    object: &T,
    request: CallRequest,
    worker: Option<usize>,
    name: &str,
    logging: bool,
) {
    let CallRequest {
        method,
        args,
        block,
        transaction,
        policy,
        reply,
    } = request;

    if logging {
        debug!(
            wrapper = name,
            transaction = %transaction,
            method = %method,
            worker = ?worker,
            "executing method"
        );
    }

    let outcome = if method == RESPONDS_TO {
        answer_capability_query(object, args)
    } else {
        let access = match block {
            BlockSlot::None => BlockAccess::None,
            BlockSlot::InPlace(block) => BlockAccess::InPlace(block),
            BlockSlot::Relay => BlockAccess::Relay { reply: &reply },
        };
        let invocation = Invocation::new(&method, args, access, policy);
        // A panicking method must not take the server down; its message
        // travels to the caller like any raised error.
        panic::catch_unwind(AssertUnwindSafe(|| object.receive(invocation)))
            .unwrap_or_else(|payload| Err(Error::raised(panic_message(payload.as_ref()))))
    };

    let terminal = match outcome {
        Ok(value) => Reply::Return(value.into_transport(policy.move_results())),
        Err(error) => Reply::Exception(error),
    };
    if reply.send(terminal).is_err() {
        warn!(
            wrapper = name,
            transaction = %transaction,
            method = %method,
            "reply channel closed, dropping terminal reply"
        );
    }
}

fn answer_capability_query<T: Receiver>(object: &T, mut args: Args) -> Result<Payload> {
    let method: String = args.take(0)?.downcast()?;
    Ok(Payload::new(object.responds_to(&method)))
}

/// Best-effort refusal of a call that can no longer be executed.
fn refuse(request: CallRequest, name: &str, logging: bool) {
    if logging {
        debug!(
            wrapper = name,
            transaction = %request.transaction,
            method = %request.method,
            "refusing call"
        );
    }
    if request.reply.send(Reply::Exception(Error::Closed)).is_err() {
        warn!(
            wrapper = name,
            transaction = %request.transaction,
            "reply channel closed, dropping refusal"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "wrapped method panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::messages::Transaction;
    use crate::policy::MethodPolicy;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Doubler;

    impl Receiver for Doubler {
        fn receive(&self, mut invocation: Invocation<'_>) -> Result<Payload> {
            match invocation.method() {
                "double" => {
                    let n: i32 = invocation.take_args().take(0)?.downcast()?;
                    Ok(Payload::new(n * 2))
                }
                other => Err(Error::NoSuchMethod(other.to_owned())),
            }
        }

        fn responds_to(&self, method: &str) -> bool {
            method == "double"
        }
    }

    fn request(method: &str, args: Args) -> (CallRequest, flume::Receiver<Reply>) {
        let (reply_tx, reply_rx) = flume::unbounded();
        (
            CallRequest {
                method: method.to_owned(),
                args,
                block: BlockSlot::None,
                transaction: Transaction::generate(),
                policy: MethodPolicy::default(),
                reply: reply_tx,
            },
            reply_rx,
        )
    }

    fn start_server(threads: usize) -> (flume::Sender<ServerMessage>, thread::JoinHandle<Arc<Doubler>>) {
        let (inbox_tx, inbox_rx) = flume::unbounded();
        let worker_inbox = inbox_tx.clone();
        let handle = thread::spawn(move || {
            Server::run(
                Arc::new(Doubler),
                inbox_rx,
                worker_inbox,
                Arc::from("test-server"),
                false,
                threads,
            )
        });
        (inbox_tx, handle)
    }

    #[test]
    fn sequential_server_answers_calls_in_order() {
        let (inbox, handle) = start_server(0);

        let mut replies = Vec::new();
        for n in [1_i32, 2, 3] {
            let (request, reply_rx) = request("double", Args::new().arg(n));
            inbox.send(ServerMessage::Call(request)).unwrap();
            replies.push(reply_rx);
        }
        for (reply_rx, expected) in replies.into_iter().zip([2_i32, 4, 6]) {
            let Reply::Return(value) = reply_rx.recv_timeout(TIMEOUT).unwrap() else {
                panic!("expected a return");
            };
            assert_eq!(value.downcast::<i32>().unwrap(), expected);
        }

        inbox.send(ServerMessage::Stop).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn calls_buffered_behind_stop_are_refused() {
        let (inbox, handle) = start_server(0);

        inbox.send(ServerMessage::Stop).unwrap();
        let (request, reply_rx) = request("double", Args::new().arg(1_i32));
        inbox.send(ServerMessage::Call(request)).ok();

        match reply_rx.recv_timeout(TIMEOUT) {
            Ok(Reply::Exception(Error::Closed)) | Err(_) => {}
            other => panic!("expected a refusal, got {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn pooled_server_joins_workers_and_returns_sole_object_handle() {
        let (inbox, handle) = start_server(4);

        let (request, reply_rx) = request("double", Args::new().arg(21_i32));
        inbox.send(ServerMessage::Call(request)).unwrap();
        let Reply::Return(value) = reply_rx.recv_timeout(TIMEOUT).unwrap() else {
            panic!("expected a return");
        };
        assert_eq!(value.downcast::<i32>().unwrap(), 42);

        let (join_tx, join_rx) = flume::unbounded();
        inbox.send(ServerMessage::Join { reply: join_tx }).unwrap();
        inbox.send(ServerMessage::Stop).unwrap();
        join_rx.recv_timeout(TIMEOUT).unwrap();

        let object = handle.join().unwrap();
        assert!(Arc::try_unwrap(object).is_ok());
    }
}
