//! The state machine core.
//!
//! Every transaction is driven by one actor task running [`run`]: events
//! arrive through an unbounded mailbox and are processed strictly in order,
//! so all state transitions of one transaction are serialized while
//! different transactions progress in parallel. Events are a tagged-variant
//! enum carrying typed payloads; the per-variant behavior lives behind
//! [`TsxLogic`], the transition guards in one table per variant.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::message::{Request, Response};
use crate::timer::TimerKind;
use crate::transaction::key::TsxKey;
use crate::transaction::{Inner, TsxKind};
use crate::transport::{ClientTransport, IncomingRequest, IncomingResponse, ServerTransport};

/// Transaction states across all four RFC 3261 §17 machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum State {
    Calling = 0,
    Trying = 1,
    Proceeding = 2,
    Completed = 3,
    Confirmed = 4,
    Accepted = 5,
    Terminated = 6,
}

impl State {
    pub(crate) fn from_u8(value: u8) -> State {
        match value {
            0 => State::Calling,
            1 => State::Trying,
            2 => State::Proceeding,
            3 => State::Completed,
            4 => State::Confirmed,
            5 => State::Accepted,
            _ => State::Terminated,
        }
    }
}

/// The events a transaction actor processes. Each variant carries its typed
/// payload; TU-originated variants carry a channel the caller awaits so the
/// state change is visible once the call returns.
pub(crate) enum TsxEvent {
    PeerRequest(IncomingRequest, oneshot::Sender<()>),
    PeerResponse(IncomingResponse, oneshot::Sender<()>),
    TuRespond(Response, oneshot::Sender<Result<()>>),
    Timer { kind: TimerKind, epoch: u64 },
    Terminate(oneshot::Sender<()>),
}

/// The transport a transaction sends through, by direction.
pub(crate) enum Peer {
    Client(Arc<dyn ClientTransport>),
    Server(Arc<dyn ServerTransport>),
}

impl Peer {
    pub(crate) fn reliable(&self) -> bool {
        match self {
            Peer::Client(t) => t.reliable(),
            Peer::Server(t) => t.reliable(),
        }
    }

    fn client(&self) -> Result<&Arc<dyn ClientTransport>> {
        match self {
            Peer::Client(t) => Ok(t),
            Peer::Server(_) => Err(Error::InvalidArgument(
                "requests are only sent by client transactions",
            )),
        }
    }

    fn server(&self) -> Result<&Arc<dyn ServerTransport>> {
        match self {
            Peer::Server(t) => Ok(t),
            Peer::Client(_) => Err(Error::InvalidArgument(
                "responses are only sent by server transactions",
            )),
        }
    }
}

/// Notified when a transaction reaches `Terminated`, so the owning store
/// can drop it. The transaction holds no direct manager back-pointer.
pub(crate) trait TsxObserver: Send + Sync + 'static {
    fn on_terminated(&self, key: &TsxKey, kind: TsxKind);
}

fn allowed(kind: TsxKind, from: State, to: State) -> bool {
    use State::*;
    match kind {
        TsxKind::ClientInvite => matches!(
            (from, to),
            (Calling, Proceeding)
                | (Calling, Completed)
                | (Calling, Accepted)
                | (Proceeding, Completed)
                | (Proceeding, Accepted)
        ),
        TsxKind::ClientNonInvite => matches!(
            (from, to),
            (Trying, Proceeding) | (Trying, Completed) | (Proceeding, Completed)
        ),
        TsxKind::ServerInvite => matches!(
            (from, to),
            (Proceeding, Completed) | (Proceeding, Accepted) | (Completed, Confirmed)
        ),
        TsxKind::ServerNonInvite => matches!(
            (from, to),
            (Trying, Proceeding) | (Trying, Completed) | (Proceeding, Completed)
        ),
    }
}

/// The actor-side view of one transaction: the shared inner state, the
/// transport to send through, and the termination observer.
pub(crate) struct TsxCore {
    pub(crate) inner: Arc<Inner>,
    peer: Peer,
    observer: Arc<dyn TsxObserver>,
}

impl TsxCore {
    pub(crate) fn new(inner: Arc<Inner>, peer: Peer, observer: Arc<dyn TsxObserver>) -> Self {
        TsxCore {
            inner,
            peer,
            observer,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.inner.state()
    }

    pub(crate) fn reliable(&self) -> bool {
        self.peer.reliable()
    }

    pub(crate) fn request(&self) -> &Request {
        &self.inner.request
    }

    pub(crate) fn timers(&self) -> &crate::timer::TimerTable {
        &self.inner.timers
    }

    pub(crate) fn timing(&self) -> crate::timing::TimingConfig {
        self.inner.timing
    }

    /// Moves the machine to `to`, running the guards of this variant's
    /// table. Transitioning to the current state is a no-op; `Terminated`
    /// is reachable from every state and triggers teardown.
    pub(crate) fn transition(&self, to: State) -> Result<State> {
        let from = self.state();
        if from == to {
            return Ok(to);
        }
        if from == State::Terminated {
            // Terminal: every further event is a no-op.
            return Ok(State::Terminated);
        }
        if to != State::Terminated && !allowed(self.inner.kind, from, to) {
            return Err(Error::InvalidStateTransition { from, to });
        }

        self.inner.set_state(to);
        log::trace!("transaction {}: {:?} -> {:?}", self.inner.key, from, to);
        self.inner.deliver_state(to);

        if to == State::Terminated {
            self.inner.timers.cancel_all();
            self.inner.cancel.cancel();
            self.inner.close_handlers();
            self.observer.on_terminated(&self.inner.key, self.inner.kind);
        }
        Ok(to)
    }

    /// Delivers `err` to the error handlers and drives the machine to
    /// `Terminated`. The delivery happens first so the handlers still run.
    pub(crate) fn fail(&self, err: Error) {
        log::debug!("transaction {} failed: {}", self.inner.key, err);
        self.inner.deliver_error(&err);
        let _ = self.transition(State::Terminated);
    }

    /// Sends `request` through the client transport, aborting if the
    /// transaction context is cancelled mid-send.
    pub(crate) async fn send_request(&self, request: &Request) -> Result<()> {
        let transport = self.peer.client()?;
        log::debug!("=> {} ({})", request, self.inner.key);
        tokio::select! {
            biased;
            result = transport.send_request(request, &self.inner.opts) => result,
            _ = self.inner.cancel.cancelled() => Err(Error::Canceled),
        }
    }

    /// Sends `response` through the server transport, aborting if the
    /// transaction context is cancelled mid-send.
    pub(crate) async fn send_response(&self, response: &Response) -> Result<()> {
        let transport = self.peer.server()?;
        log::debug!("=> {} ({})", response, self.inner.key);
        tokio::select! {
            biased;
            result = transport.send_response(response, &self.inner.opts) => result,
            _ = self.inner.cancel.cancelled() => Err(Error::Canceled),
        }
    }
}

/// Per-variant transaction behavior. The default bodies make unexpected
/// event kinds no-ops, matching the "silently ignored" rule for events a
/// variant never consumes.
#[async_trait::async_trait]
pub(crate) trait TsxLogic: Send + 'static {
    /// Entry actions of the initial state (initial send, timer arming).
    async fn on_start(&mut self, core: &TsxCore) -> Result<()> {
        let _ = core;
        Ok(())
    }

    /// An inbound request matched to this transaction.
    async fn on_request(&mut self, core: &TsxCore, request: IncomingRequest) -> Result<()> {
        log::debug!(
            "transaction {} ignoring {} request",
            core.inner.key,
            request.method()
        );
        Ok(())
    }

    /// An inbound response matched to this transaction.
    async fn on_response(&mut self, core: &TsxCore, response: IncomingResponse) -> Result<()> {
        log::debug!(
            "transaction {} ignoring {} response",
            core.inner.key,
            response.response.code()
        );
        Ok(())
    }

    /// A TU-supplied response to send.
    async fn on_respond(&mut self, core: &TsxCore, response: Response) -> Result<()> {
        let _ = (core, response);
        Err(Error::InvalidArgument(
            "respond is only valid for server transactions",
        ))
    }

    /// A timer firing that survived the epoch check.
    async fn on_timer(&mut self, core: &TsxCore, kind: TimerKind) -> Result<()> {
        let _ = (core, kind);
        Ok(())
    }
}

/// The generic actor loop: drains the mailbox until the machine reaches
/// `Terminated`, then drops the channel so pending TU calls resolve.
pub(crate) async fn run<L: TsxLogic>(
    mut logic: L,
    core: TsxCore,
    mut events: UnboundedReceiver<TsxEvent>,
    fresh: bool,
) {
    if fresh {
        if let Err(err) = logic.on_start(&core).await {
            core.fail(err);
        }
    }

    while core.state() != State::Terminated {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    let _ = core.transition(State::Terminated);
                    break;
                }
            },
            _ = core.inner.cancel.cancelled() => {
                let _ = core.transition(State::Terminated);
                break;
            }
        };

        match event {
            TsxEvent::PeerRequest(request, done) => {
                if let Err(err) = logic.on_request(&core, request).await {
                    log::debug!("transaction {}: request handling: {}", core.inner.key, err);
                }
                let _ = done.send(());
            }
            TsxEvent::PeerResponse(response, done) => {
                if let Err(err) = logic.on_response(&core, response).await {
                    log::debug!("transaction {}: response handling: {}", core.inner.key, err);
                }
                let _ = done.send(());
            }
            TsxEvent::TuRespond(response, done) => {
                let result = logic.on_respond(&core, response).await;
                if let Err(err) = &result {
                    // State guard violations go back to the caller only;
                    // transport failures also reach the error handlers.
                    if !matches!(err, Error::InvalidStateTransition { .. }) {
                        core.inner.deliver_error(err);
                    }
                }
                let _ = done.send(result);
            }
            TsxEvent::Timer { kind, epoch } => {
                if !core.inner.timers.take_fired(kind, epoch) {
                    continue;
                }
                if let Err(err) = logic.on_timer(&core, kind).await {
                    log::debug!("transaction {}: timer {}: {}", core.inner.key, kind, err);
                }
            }
            TsxEvent::Terminate(done) => {
                let _ = core.transition(State::Terminated);
                let _ = done.send(());
            }
        }
    }
}
