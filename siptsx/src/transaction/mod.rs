//! SIP Transaction Layer.

pub mod key;
pub mod manager;
pub mod snapshot;

mod client;
mod client_inv;
mod server;
mod server_inv;
mod store;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(test)]
mod tests;

pub use client::ClientTransaction;
pub use client_inv::InvClientTransaction;
pub use manager::TransactionManager;
pub use server::ServerTransaction;
pub use server_inv::InvServerTransaction;

pub(crate) use store::Store;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fsm::{Peer, State, TsxCore, TsxEvent, TsxObserver};
use crate::message::{Request, Response, StatusCode};
use crate::timer::TimerTable;
use crate::timing::TimingConfig;
use crate::transport::{IncomingRequest, IncomingResponse, SendOptions};

use key::TsxKey;

/// The four transaction variants of RFC 3261 §17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TsxKind {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TsxKind {
    /// Whether this variant sends requests (as opposed to responses).
    pub fn is_client(&self) -> bool {
        matches!(self, TsxKind::ClientInvite | TsxKind::ClientNonInvite)
    }

    /// The state a fresh transaction of this variant starts in.
    pub(crate) fn initial_state(&self) -> State {
        match self {
            TsxKind::ClientInvite => State::Calling,
            TsxKind::ClientNonInvite => State::Trying,
            TsxKind::ServerInvite => State::Proceeding,
            TsxKind::ServerNonInvite => State::Trying,
        }
    }
}

impl fmt::Display for TsxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsxKind::ClientInvite => f.write_str("client-invite"),
            TsxKind::ClientNonInvite => f.write_str("client-non-invite"),
            TsxKind::ServerInvite => f.write_str("server-invite"),
            TsxKind::ServerNonInvite => f.write_str("server-non-invite"),
        }
    }
}

type ResponseHandler = Box<dyn FnMut(&Response) + Send>;
type AckHandler = Box<dyn FnMut(&Request) + Send>;
type ErrorHandler = Box<dyn FnMut(&Error) + Send>;
type StateHandler = Box<dyn FnMut(State) + Send>;

/// Responses received before the first handler registration are buffered,
/// bounded so a flood before registration cannot grow without limit.
const PENDING_RESPONSES: usize = 8;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    response: Vec<(u64, ResponseHandler)>,
    ack: Vec<(u64, AckHandler)>,
    error: Vec<(u64, ErrorHandler)>,
    state: Vec<(u64, StateHandler)>,
    pending: VecDeque<Response>,
    response_registered: bool,
    closed: bool,
}

impl Handlers {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Clone, Copy)]
enum HandlerSlot {
    Response,
    Ack,
    Error,
    State,
}

/// Deregisters the handler it was returned for. Dropping the guard leaves
/// the handler in place; only an explicit [`HandlerGuard::cancel`] removes
/// it.
pub struct HandlerGuard {
    slot: HandlerSlot,
    id: u64,
    inner: Weak<Inner>,
}

impl HandlerGuard {
    /// Removes the handler. Events already being delivered still reach it.
    pub fn cancel(self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut handlers = inner.handlers.lock().expect("Lock failed");
            match self.slot {
                HandlerSlot::Response => handlers.response.retain(|(id, _)| *id != self.id),
                HandlerSlot::Ack => handlers.ack.retain(|(id, _)| *id != self.id),
                HandlerSlot::Error => handlers.error.retain(|(id, _)| *id != self.id),
                HandlerSlot::State => handlers.state.retain(|(id, _)| *id != self.id),
            }
        }
    }
}

pub(crate) struct Inner {
    pub(crate) key: TsxKey,
    pub(crate) kind: TsxKind,
    pub(crate) timing: TimingConfig,
    pub(crate) request: Request,
    pub(crate) opts: SendOptions,
    state: AtomicU8,
    state_entered: Mutex<tokio::time::Instant>,
    last_response: RwLock<Option<Response>>,
    handlers: Mutex<Handlers>,
    pub(crate) timers: TimerTable,
    pub(crate) events: UnboundedSender<TsxEvent>,
    pub(crate) cancel: CancellationToken,
}

impl Inner {
    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
        *self.state_entered.lock().expect("Lock failed") = tokio::time::Instant::now();
    }

    pub(crate) fn state_age(&self) -> Duration {
        self.state_entered
            .lock()
            .expect("Lock failed")
            .elapsed()
    }

    pub(crate) fn last_response(&self) -> Option<Response> {
        self.last_response.read().expect("Lock failed").clone()
    }

    pub(crate) fn set_last_response(&self, response: Response) {
        *self.last_response.write().expect("Lock failed") = Some(response);
    }

    /// Delivers `response` to the response handlers, buffering while none
    /// was ever registered.
    pub(crate) fn deliver_response(&self, response: &Response) {
        let mut handlers = self.handlers.lock().expect("Lock failed");
        if handlers.closed {
            return;
        }
        if !handlers.response_registered {
            if handlers.pending.len() == PENDING_RESPONSES {
                log::warn!("transaction {}: pending response buffer full", self.key);
                handlers.pending.pop_front();
            }
            handlers.pending.push_back(response.clone());
            return;
        }
        for (_, handler) in handlers.response.iter_mut() {
            handler(response);
        }
    }

    pub(crate) fn deliver_ack(&self, request: &Request) {
        let mut handlers = self.handlers.lock().expect("Lock failed");
        if handlers.closed {
            return;
        }
        for (_, handler) in handlers.ack.iter_mut() {
            handler(request);
        }
    }

    pub(crate) fn deliver_error(&self, err: &Error) {
        let mut handlers = self.handlers.lock().expect("Lock failed");
        if handlers.closed {
            return;
        }
        for (_, handler) in handlers.error.iter_mut() {
            handler(err);
        }
    }

    pub(crate) fn deliver_state(&self, state: State) {
        let mut handlers = self.handlers.lock().expect("Lock failed");
        if handlers.closed {
            return;
        }
        for (_, handler) in handlers.state.iter_mut() {
            handler(state);
        }
    }

    /// Drops every registered handler and the pending buffer. Called on
    /// entry to `Terminated`, after the final state notification, so no
    /// callback of any kind runs afterwards.
    pub(crate) fn close_handlers(&self) {
        let mut handlers = self.handlers.lock().expect("Lock failed");
        handlers.closed = true;
        handlers.response.clear();
        handlers.ack.clear();
        handlers.error.clear();
        handlers.state.clear();
        handlers.pending.clear();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        log::trace!("transaction dropped: {}", self.key);
    }
}

/// The handle shared by every transaction variant. Cloning is cheap; all
/// clones observe the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Transaction {
    /// The key this transaction is stored under.
    pub fn key(&self) -> &TsxKey {
        &self.inner.key
    }

    /// The variant of this transaction.
    pub fn kind(&self) -> TsxKind {
        self.inner.kind
    }

    /// A consistent snapshot of the current state, updated only by the
    /// transaction's own actor.
    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// The request this transaction was created for.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// The most recent response sent (server) or received (client).
    pub fn last_response(&self) -> Option<Response> {
        self.inner.last_response()
    }

    /// The status code of [`Transaction::last_response`].
    pub fn last_status_code(&self) -> Option<StatusCode> {
        self.inner
            .last_response
            .read()
            .expect("Lock failed")
            .as_ref()
            .map(|r| r.code())
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == State::Terminated
    }

    /// The transaction's cancellable context. Cancelled when the
    /// transaction terminates; cancelling it terminates the transaction.
    pub fn context(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Registers a state-change handler, called once per transition in
    /// registration order.
    pub fn on_state_changed<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(State) + Send + 'static,
    {
        let mut handlers = self.inner.handlers.lock().expect("Lock failed");
        let id = handlers.next_id();
        handlers.state.push((id, Box::new(handler)));
        self.guard(HandlerSlot::State, id)
    }

    /// Registers an error handler. Protocol timeouts and transport
    /// failures are delivered here before the transaction terminates.
    pub fn on_error<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(&Error) + Send + 'static,
    {
        let mut handlers = self.inner.handlers.lock().expect("Lock failed");
        let id = handlers.next_id();
        handlers.error.push((id, Box::new(handler)));
        self.guard(HandlerSlot::Error, id)
    }

    /// Drives the transaction to `Terminated`. Idempotent; returns once
    /// the state change is visible.
    pub async fn terminate(&self) {
        let (done, wait) = oneshot::channel();
        if self.inner.events.send(TsxEvent::Terminate(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn guard(&self, slot: HandlerSlot, id: u64) -> HandlerGuard {
        HandlerGuard {
            slot,
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn state_age(&self) -> Duration {
        self.inner.state_age()
    }

    pub(crate) fn register_response_handler(
        &self,
        handler: ResponseHandler,
    ) -> HandlerGuard {
        let mut handlers = self.inner.handlers.lock().expect("Lock failed");
        let id = handlers.next_id();
        handlers.response.push((id, handler));
        if !handlers.response_registered {
            handlers.response_registered = true;
            // Flush what arrived before anyone was listening.
            let pending: Vec<_> = handlers.pending.drain(..).collect();
            let (_, handler) = handlers
                .response
                .last_mut()
                .expect("handler was just pushed");
            for response in &pending {
                handler(response);
            }
        }
        self.guard(HandlerSlot::Response, id)
    }

    pub(crate) fn register_ack_handler(&self, handler: AckHandler) -> HandlerGuard {
        let mut handlers = self.inner.handlers.lock().expect("Lock failed");
        let id = handlers.next_id();
        handlers.ack.push((id, handler));
        self.guard(HandlerSlot::Ack, id)
    }

    pub(crate) async fn fire_request(&self, request: IncomingRequest) -> Result<()> {
        let (done, wait) = oneshot::channel();
        if self
            .inner
            .events
            .send(TsxEvent::PeerRequest(request, done))
            .is_err()
        {
            // Terminated concurrently; retransmissions at this point are
            // absorbed silently.
            return Ok(());
        }
        let _ = wait.await;
        Ok(())
    }

    pub(crate) async fn fire_response(&self, response: IncomingResponse) -> Result<()> {
        let (done, wait) = oneshot::channel();
        if self
            .inner
            .events
            .send(TsxEvent::PeerResponse(response, done))
            .is_err()
        {
            return Ok(());
        }
        let _ = wait.await;
        Ok(())
    }

    pub(crate) async fn fire_respond(&self, response: Response) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.inner
            .events
            .send(TsxEvent::TuRespond(response, done))
            .map_err(|_| Error::TransactionTerminated(self.inner.key.clone()))?;
        wait.await
            .map_err(|_| Error::TransactionTerminated(self.inner.key.clone()))?
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.inner.key.to_string())
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything needed to run a freshly built transaction: the public handle,
/// the actor-side core, and the mailbox receiver the actor drains.
pub(crate) struct Built {
    pub(crate) tsx: Transaction,
    pub(crate) core: TsxCore,
    pub(crate) events: UnboundedReceiver<TsxEvent>,
}

/// Assembles the shared state of a transaction without spawning its actor.
/// The caller stores the handle first and only then spawns, so a key
/// conflict never leaves a task behind.
pub(crate) fn build(
    kind: TsxKind,
    key: TsxKey,
    request: Request,
    opts: SendOptions,
    timing: TimingConfig,
    peer: Peer,
    observer: Arc<dyn TsxObserver>,
    state: State,
) -> Built {
    let (events, mailbox) = unbounded_channel();
    let inner = Arc::new(Inner {
        key,
        kind,
        timing,
        request,
        opts,
        state: AtomicU8::new(state as u8),
        state_entered: Mutex::new(tokio::time::Instant::now()),
        last_response: RwLock::new(None),
        handlers: Mutex::new(Handlers::default()),
        timers: TimerTable::new(events.clone()),
        events,
        cancel: CancellationToken::new(),
    });
    log::trace!("transaction created: {} [{}]", inner.key, kind);

    let core = TsxCore::new(inner.clone(), peer, observer);
    Built {
        tsx: Transaction { inner },
        core,
        events: mailbox,
    }
}

/// A client transaction of either variant.
#[derive(Clone, Debug, EnumAsInner)]
pub enum ClientTsx {
    /// A non-INVITE client transaction.
    NonInvite(ClientTransaction),
    /// An INVITE client transaction.
    Invite(InvClientTransaction),
}

impl ClientTsx {
    fn tsx(&self) -> &Transaction {
        match self {
            ClientTsx::NonInvite(tsx) => tsx.base(),
            ClientTsx::Invite(tsx) => tsx.base(),
        }
    }

    pub fn key(&self) -> &TsxKey {
        self.tsx().key()
    }

    pub fn kind(&self) -> TsxKind {
        self.tsx().kind()
    }

    pub fn state(&self) -> State {
        self.tsx().state()
    }

    pub fn request(&self) -> &Request {
        self.tsx().request()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.tsx().last_response()
    }

    pub fn context(&self) -> CancellationToken {
        self.tsx().context()
    }

    /// Registers a response handler; responses received before the first
    /// registration are replayed to it immediately.
    pub fn on_response<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(&Response) + Send + 'static,
    {
        self.tsx().register_response_handler(Box::new(handler))
    }

    pub fn on_state_changed<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(State) + Send + 'static,
    {
        self.tsx().on_state_changed(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.tsx().on_error(handler)
    }

    /// Hands a matched inbound response to the transaction.
    pub async fn recv_response(&self, response: IncomingResponse) -> Result<()> {
        self.tsx().fire_response(response).await
    }

    pub async fn terminate(&self) {
        self.tsx().terminate().await
    }

    pub fn snapshot(&self) -> snapshot::TsxSnapshot {
        self.tsx().snapshot()
    }

    pub(crate) fn state_age(&self) -> Duration {
        self.tsx().state_age()
    }
}

/// A server transaction of either variant.
#[derive(Clone, Debug, EnumAsInner)]
pub enum ServerTsx {
    /// A non-INVITE server transaction.
    NonInvite(ServerTransaction),
    /// An INVITE server transaction.
    Invite(InvServerTransaction),
}

impl ServerTsx {
    fn tsx(&self) -> &Transaction {
        match self {
            ServerTsx::NonInvite(tsx) => tsx.base(),
            ServerTsx::Invite(tsx) => tsx.base(),
        }
    }

    pub fn key(&self) -> &TsxKey {
        self.tsx().key()
    }

    pub fn kind(&self) -> TsxKind {
        self.tsx().kind()
    }

    pub fn state(&self) -> State {
        self.tsx().state()
    }

    pub fn request(&self) -> &Request {
        self.tsx().request()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.tsx().last_response()
    }

    pub fn last_status_code(&self) -> Option<StatusCode> {
        self.tsx().last_status_code()
    }

    pub fn context(&self) -> CancellationToken {
        self.tsx().context()
    }

    /// Sends `code` built from the original request.
    pub async fn respond(&self, code: StatusCode) -> Result<()> {
        let response = Response::for_request(code, self.tsx().request());
        self.respond_with(response).await
    }

    /// Sends a caller-built response through the transaction.
    pub async fn respond_with(&self, response: Response) -> Result<()> {
        self.tsx().fire_respond(response).await
    }

    /// Registers a handler for ACKs matched to this transaction.
    pub fn on_ack<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(&Request) + Send + 'static,
    {
        self.tsx().register_ack_handler(Box::new(handler))
    }

    pub fn on_state_changed<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(State) + Send + 'static,
    {
        self.tsx().on_state_changed(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.tsx().on_error(handler)
    }

    /// Hands a matched inbound request (a retransmission, an ACK or a
    /// fallback-matched message) to the transaction.
    pub async fn recv_request(&self, request: IncomingRequest) -> Result<()> {
        self.tsx().fire_request(request).await
    }

    pub async fn terminate(&self) {
        self.tsx().terminate().await
    }

    pub fn snapshot(&self) -> snapshot::TsxSnapshot {
        self.tsx().snapshot()
    }

    pub(crate) fn state_age(&self) -> Duration {
        self.tsx().state_age()
    }
}
