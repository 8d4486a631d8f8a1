//! The transaction manager: the layer's façade towards the transport
//! below and the TU above.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use util::ArcStr;

use crate::error::{Error, Result};
use crate::fsm::{self, Peer, State, TsxObserver};
use crate::message::{make_branch, Response, SipMethod, StatusCode, Via};
use crate::message::Request;
use crate::timing::TimingConfig;
use crate::transport::resolve::{DnsLookup, ResponseTargets};
use crate::transport::{
    ClientTransport, IncomingRequest, IncomingResponse, SendOptions, ServerTransport,
};

use super::client::ClientLogic;
use super::client_inv::InvClientLogic;
use super::key::TsxKey;
use super::server::ServerLogic;
use super::server_inv::InvServerLogic;
use super::snapshot::TsxSnapshot;
use super::{
    build, ClientTransaction, ClientTsx, InvClientTransaction, InvServerTransaction,
    ServerTransaction, ServerTsx, Store, TsxKind,
};

type ClientHook = Box<dyn Fn(&ClientTsx) + Send + Sync>;
type ServerHook = Box<dyn Fn(&ServerTsx) + Send + Sync>;

/// How long a transaction may sit in an early state before the reaper
/// terminates it. Local policy, not an RFC 3261 requirement.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

struct ManagerInner {
    timing: TimingConfig,
    clients: Store<ClientTsx>,
    servers: Store<ServerTsx>,
    closed: AtomicBool,
    client_hooks: Vec<ClientHook>,
    server_hooks: Vec<ServerHook>,
    stale_after: Option<Duration>,
    dns: Option<Arc<dyn DnsLookup>>,
    cancel: CancellationToken,
}

/// Removes a terminated transaction from its store. Transactions reach
/// their manager only through this observer; they hold no back-pointer.
struct StoreDetach {
    inner: Weak<ManagerInner>,
}

impl TsxObserver for StoreDetach {
    fn on_terminated(&self, key: &TsxKey, kind: TsxKind) {
        if let Some(inner) = self.inner.upgrade() {
            let removed = if kind.is_client() {
                inner.clients.remove(key).is_some()
            } else {
                inner.servers.remove(key).is_some()
            };
            if removed {
                log::trace!("transaction detached: {}", key);
            }
        }
    }
}

/// The transaction manager.
///
/// Owns the client and server transaction stores, creates transactions on
/// behalf of the TU, and intercepts inbound messages: matched ones are
/// routed into their transaction, unmatched ones are handed back to the
/// caller for the next layer.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use siptsx::transaction::TransactionManager;
/// # use siptsx::transport::{SendOptions, local_pair};
/// # use siptsx::message::*;
/// # async fn example() -> siptsx::Result<()> {
/// let manager = TransactionManager::builder().build().await;
/// let ((transport, _rx), _peer) = local_pair(
///     "127.0.0.1:5060".parse().unwrap(),
///     "127.0.0.1:5070".parse().unwrap(),
/// );
///
/// let mut request = Request::new(
///     SipMethod::Options,
///     Uri::sip(Some("bob"), Host::from("127.0.0.1"), Some(5070)),
/// );
/// # request.headers.push(Header::CSeq(CSeq::new(1, SipMethod::Options)));
/// let tsx = manager
///     .new_client_tsx(request, Arc::new(transport), SendOptions::default())
///     .await?;
/// tsx.on_response(|response| println!("<= {}", response));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TransactionManager(Arc<ManagerInner>);

impl TransactionManager {
    /// Returns a builder to create a `TransactionManager`.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The timing defaults transactions are created with.
    pub fn timing(&self) -> TimingConfig {
        self.0.timing
    }

    /// Whether [`TransactionManager::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Creates, stores and starts a client transaction for `request`.
    ///
    /// The top Via gets a fresh RFC 3261 branch when it carries none. ACK
    /// never forms a client transaction; the ACK for a 2xx is sent
    /// statelessly by the TU, the ACK for a non-2xx by the INVITE
    /// transaction itself.
    pub async fn new_client_tsx(
        &self,
        mut request: Request,
        transport: Arc<dyn ClientTransport>,
        opts: SendOptions,
    ) -> Result<ClientTsx> {
        self.ensure_open()?;
        if request.method() == &SipMethod::Ack {
            return Err(Error::MethodNotAllowed(SipMethod::Ack));
        }

        match request.headers.top_via_mut() {
            Some(via) if via.branch().is_some_and(|b| !b.is_empty()) => {}
            Some(via) => via.branch = Some(ArcStr::from(make_branch())),
            None => return Err(Error::InvalidMessage("missing Via header")),
        }

        let key = TsxKey::client(&request)?;
        let kind = if request.method() == &SipMethod::Invite {
            TsxKind::ClientInvite
        } else {
            TsxKind::ClientNonInvite
        };

        let built = build(
            kind,
            key.clone(),
            request,
            opts,
            self.0.timing,
            Peer::Client(transport),
            self.observer(),
            kind.initial_state(),
        );
        let handle = match kind {
            TsxKind::ClientInvite => ClientTsx::Invite(InvClientTransaction::new(built.tsx.clone())),
            _ => ClientTsx::NonInvite(ClientTransaction::new(built.tsx.clone())),
        };

        self.0.clients.insert(key, handle.clone())?;
        for hook in &self.0.client_hooks {
            hook(&handle);
        }

        match kind {
            TsxKind::ClientInvite => {
                tokio::spawn(fsm::run(InvClientLogic::new(), built.core, built.events, true));
            }
            _ => {
                tokio::spawn(fsm::run(ClientLogic::new(), built.core, built.events, true));
            }
        }
        Ok(handle)
    }

    /// Creates, stores and starts a server transaction for an inbound
    /// request. The response destination defaults to the request's source
    /// address.
    pub async fn new_server_tsx(
        &self,
        request: IncomingRequest,
        mut opts: SendOptions,
    ) -> Result<ServerTsx> {
        self.ensure_open()?;
        let method = request.request.method().clone();
        if method == SipMethod::Ack {
            return Err(Error::MethodNotAllowed(SipMethod::Ack));
        }

        let key = TsxKey::server(&request.request)?;
        if opts.destination.is_none() {
            opts.destination = Some(request.packet.remote);
        }
        let kind = if method == SipMethod::Invite {
            TsxKind::ServerInvite
        } else {
            TsxKind::ServerNonInvite
        };

        let built = build(
            kind,
            key.clone(),
            request.request,
            opts,
            self.0.timing,
            Peer::Server(request.transport),
            self.observer(),
            kind.initial_state(),
        );
        let handle = match kind {
            TsxKind::ServerInvite => ServerTsx::Invite(InvServerTransaction::new(built.tsx.clone())),
            _ => ServerTsx::NonInvite(ServerTransaction::new(built.tsx.clone())),
        };

        self.0.servers.insert(key, handle.clone())?;
        for hook in &self.0.server_hooks {
            hook(&handle);
        }

        match kind {
            TsxKind::ServerInvite => {
                tokio::spawn(fsm::run(InvServerLogic::new(), built.core, built.events, true));
            }
            _ => {
                tokio::spawn(fsm::run(ServerLogic::new(), built.core, built.events, true));
            }
        }
        Ok(handle)
    }

    /// The inbound request interceptor.
    ///
    /// Matched requests are consumed by their transaction and `None` is
    /// returned. Unmatched requests come back to the caller for the next
    /// layer; that includes every ACK for a 2xx, whose branch never matches
    /// the INVITE transaction. A stray ACK is never answered. On a closed
    /// manager everything else is rejected with 503, malformed requests
    /// with 400 (or 500 for internal failures).
    #[tracing::instrument(name = "tsx_on_request", level = "debug", skip_all)]
    pub async fn on_request(&self, request: IncomingRequest) -> Result<Option<IncomingRequest>> {
        log::debug!("<= {} from /{}", request.request, request.packet.remote);
        let is_ack = request.request.method() == &SipMethod::Ack;

        if self.is_closed() {
            if is_ack {
                return Ok(Some(request));
            }
            self.reject(&request, StatusCode::SERVICE_UNAVAILABLE).await;
            return Ok(None);
        }

        let key = match TsxKey::server(&request.request) {
            Ok(key) => key,
            Err(err) if is_ack => {
                log::debug!("unkeyable ACK forwarded: {}", err);
                return Ok(Some(request));
            }
            Err(err) => {
                let code = if err.is_client_fault() {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::SERVER_INTERNAL_ERROR
                };
                log::debug!("rejecting {} with {}: {}", request.request, code, err);
                self.reject(&request, code).await;
                return Ok(None);
            }
        };

        if let Some(tsx) = self.0.servers.find(&key) {
            if is_ack && key.is_rfc2543() && !ack_to_tag_matches(&tsx, &request) {
                return Ok(Some(request));
            }
            tsx.recv_request(request).await?;
            return Ok(None);
        }
        Ok(Some(request))
    }

    /// The inbound response interceptor. Matched responses are consumed by
    /// their client transaction; unmatched responses are discarded, as the
    /// protocol requires.
    #[tracing::instrument(name = "tsx_on_response", level = "debug", skip_all)]
    pub async fn on_response(&self, response: IncomingResponse) -> Result<()> {
        log::debug!("<= {} from /{}", response.response, response.packet.remote);
        let key = match TsxKey::for_response(&response.response) {
            Ok(key) => key,
            Err(err) => {
                log::debug!("unkeyable response discarded: {}", err);
                return Ok(());
            }
        };
        match self.0.clients.find(&key) {
            Some(tsx) => tsx.recv_response(response).await,
            None => {
                log::debug!("unmatched response {} discarded", response.response);
                Ok(())
            }
        }
    }

    /// Marks the manager closed and terminates every live transaction.
    /// Idempotent; later creation attempts fail with
    /// [`Error::ManagerClosed`].
    pub async fn close(&self) -> Result<()> {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("closing transaction manager");
        self.0.cancel.cancel();

        let clients = self.0.clients.all();
        let servers = self.0.servers.all();
        join_all(clients.iter().map(|tsx| tsx.terminate())).await;
        join_all(servers.iter().map(|tsx| tsx.terminate())).await;
        Ok(())
    }

    /// Rebuilds a client transaction from a snapshot. Still-future timers
    /// are re-armed to their recorded deadlines; expired ones fire right
    /// after restore.
    pub async fn restore_client_tsx(
        &self,
        snapshot: TsxSnapshot,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<ClientTsx> {
        self.ensure_open()?;
        if !snapshot.kind.is_client() {
            return Err(Error::InvalidArgument("snapshot is not a client transaction"));
        }
        if snapshot.state == State::Terminated {
            return Err(Error::InvalidArgument("snapshot is already terminated"));
        }

        let built = build(
            snapshot.kind,
            snapshot.key.clone(),
            snapshot.request,
            snapshot.send_options,
            snapshot.timing_config,
            Peer::Client(transport),
            self.observer(),
            snapshot.state,
        );
        if let Some(response) = snapshot.last_response {
            built.tsx.inner().set_last_response(response);
        }
        let handle = match snapshot.kind {
            TsxKind::ClientInvite => ClientTsx::Invite(InvClientTransaction::new(built.tsx.clone())),
            _ => ClientTsx::NonInvite(ClientTransaction::new(built.tsx.clone())),
        };

        self.0.clients.insert(snapshot.key, handle.clone())?;
        for hook in &self.0.client_hooks {
            hook(&handle);
        }
        for timer in &snapshot.timers {
            built.tsx.inner().timers.restore(timer.kind, timer.deadline_unix_ns);
        }

        match snapshot.kind {
            TsxKind::ClientInvite => {
                tokio::spawn(fsm::run(InvClientLogic::new(), built.core, built.events, false));
            }
            _ => {
                tokio::spawn(fsm::run(ClientLogic::new(), built.core, built.events, false));
            }
        }
        Ok(handle)
    }

    /// Rebuilds a server transaction from a snapshot, symmetric to
    /// [`TransactionManager::restore_client_tsx`].
    pub async fn restore_server_tsx(
        &self,
        snapshot: TsxSnapshot,
        transport: Arc<dyn ServerTransport>,
    ) -> Result<ServerTsx> {
        self.ensure_open()?;
        if snapshot.kind.is_client() {
            return Err(Error::InvalidArgument("snapshot is not a server transaction"));
        }
        if snapshot.state == State::Terminated {
            return Err(Error::InvalidArgument("snapshot is already terminated"));
        }

        let built = build(
            snapshot.kind,
            snapshot.key.clone(),
            snapshot.request,
            snapshot.send_options,
            snapshot.timing_config,
            Peer::Server(transport),
            self.observer(),
            snapshot.state,
        );
        if let Some(response) = snapshot.last_response {
            built.tsx.inner().set_last_response(response);
        }
        let handle = match snapshot.kind {
            TsxKind::ServerInvite => ServerTsx::Invite(InvServerTransaction::new(built.tsx.clone())),
            _ => ServerTsx::NonInvite(ServerTransaction::new(built.tsx.clone())),
        };

        self.0.servers.insert(snapshot.key, handle.clone())?;
        for hook in &self.0.server_hooks {
            hook(&handle);
        }
        for timer in &snapshot.timers {
            built.tsx.inner().timers.restore(timer.kind, timer.deadline_unix_ns);
        }

        match snapshot.kind {
            TsxKind::ServerInvite => {
                tokio::spawn(fsm::run(InvServerLogic::new(), built.core, built.events, false));
            }
            _ => {
                tokio::spawn(fsm::run(ServerLogic::new(), built.core, built.events, false));
            }
        }
        Ok(handle)
    }

    /// The lazy destination sequence for answering along `via`, using the
    /// resolver this manager was built with.
    pub fn response_targets<'a>(&'a self, via: &'a Via) -> Result<ResponseTargets<'a>> {
        match &self.0.dns {
            Some(dns) => Ok(ResponseTargets::new(via, dns.as_ref())),
            None => Err(Error::InvalidArgument("no DNS resolver configured")),
        }
    }

    async fn reject(&self, request: &IncomingRequest, code: StatusCode) {
        let response = Response::for_request(code, &request.request);
        let opts = SendOptions::to(request.packet.remote);
        if let Err(err) = request.transport.send_response(&response, &opts).await {
            log::debug!("failed to reject {}: {}", request.request, err);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ManagerClosed);
        }
        Ok(())
    }

    fn observer(&self) -> Arc<dyn TsxObserver> {
        Arc::new(StoreDetach {
            inner: Arc::downgrade(&self.0),
        })
    }

    pub(crate) fn client_count(&self) -> usize {
        self.0.clients.len()
    }

    pub(crate) fn server_count(&self) -> usize {
        self.0.servers.len()
    }
}

fn ack_to_tag_matches(tsx: &ServerTsx, request: &IncomingRequest) -> bool {
    let ack_tag = request
        .request
        .headers
        .to_header()
        .and_then(|to| to.tag().cloned());
    let final_tag = tsx
        .last_response()
        .and_then(|response| response.headers.to_header().and_then(|to| to.tag().cloned()));
    ack_tag == final_tag
}

fn stale_eligible(kind: TsxKind, state: State) -> bool {
    matches!(
        (kind, state),
        (TsxKind::ClientInvite, State::Proceeding)
            | (TsxKind::ServerInvite, State::Proceeding)
            | (TsxKind::ClientNonInvite, State::Trying | State::Proceeding)
            | (TsxKind::ServerNonInvite, State::Trying | State::Proceeding)
    )
}

fn spawn_reaper(inner: Weak<ManagerInner>, stale_after: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let period = (stale_after / 4)
            .max(Duration::from_millis(50))
            .min(Duration::from_secs(30));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let Some(inner) = inner.upgrade() else { break };

            for tsx in inner.clients.all() {
                if stale_eligible(tsx.kind(), tsx.state()) && tsx.state_age() > stale_after {
                    log::warn!("terminating stale transaction {}", tsx.key());
                    tsx.terminate().await;
                }
            }
            for tsx in inner.servers.all() {
                if stale_eligible(tsx.kind(), tsx.state()) && tsx.state_age() > stale_after {
                    log::warn!("terminating stale transaction {}", tsx.key());
                    tsx.terminate().await;
                }
            }
        }
    });
}

/// Builder for creating a new [`TransactionManager`].
pub struct Builder {
    timing: TimingConfig,
    stale_after: Option<Duration>,
    dns: Option<Arc<dyn DnsLookup>>,
    client_hooks: Vec<ClientHook>,
    server_hooks: Vec<ServerHook>,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            timing: TimingConfig::default(),
            stale_after: Some(DEFAULT_STALE_AFTER),
            dns: None,
            client_hooks: Vec::new(),
            server_hooks: Vec::new(),
        }
    }

    /// Sets the timing config transactions are created with.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Sets the staleness policy: a transaction sitting in an early state
    /// (Trying/Proceeding) longer than this is terminated. `None` disables
    /// the reaper. Defaults to five minutes. This is local policy; RFC 3261
    /// does not mandate it.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Injects the DNS resolver used by
    /// [`TransactionManager::response_targets`].
    pub fn with_resolver(mut self, dns: Arc<dyn DnsLookup>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Adds a hook called after each client transaction is created, before
    /// its first event.
    pub fn on_new_client_tsx<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ClientTsx) + Send + Sync + 'static,
    {
        self.client_hooks.push(Box::new(hook));
        self
    }

    /// Adds a hook called after each server transaction is created, before
    /// its first event.
    pub fn on_new_server_tsx<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ServerTsx) + Send + Sync + 'static,
    {
        self.server_hooks.push(Box::new(hook));
        self
    }

    /// Finalize the builder into a `TransactionManager`.
    pub async fn build(self) -> TransactionManager {
        let inner = Arc::new(ManagerInner {
            timing: self.timing,
            clients: Store::new(),
            servers: Store::new(),
            closed: AtomicBool::new(false),
            client_hooks: self.client_hooks,
            server_hooks: self.server_hooks,
            stale_after: self.stale_after,
            dns: self.dns,
            cancel: CancellationToken::new(),
        });

        if let Some(stale_after) = inner.stale_after {
            spawn_reaper(Arc::downgrade(&inner), stale_after, inner.cancel.clone());
        }
        TransactionManager(inner)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
