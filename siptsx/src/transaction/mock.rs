//! Shared fixtures for the transaction tests.

use std::sync::Arc;

use crate::message::{
    make_branch, make_tag, CSeq, CallId, Header, Host, HostPort, NameAddr, Request, Response,
    SipMethod, TransportKind, Uri, Via,
};
use crate::timing::TimingConfig;
use crate::transaction::TransactionManager;
use crate::transport::mock::MockTransport;
use crate::transport::{IncomingRequest, IncomingResponse, Packet, ServerTransport};

pub(crate) const PEER_ADDR: &str = "127.0.0.1:5070";

pub(crate) async fn manager() -> TransactionManager {
    TransactionManager::builder().build().await
}

pub(crate) async fn manager_with_timing(timing: TimingConfig) -> TransactionManager {
    TransactionManager::builder().with_timing(timing).build().await
}

pub(crate) async fn manager_with_udp() -> (TransactionManager, Arc<MockTransport>) {
    (manager().await, MockTransport::udp())
}

pub(crate) async fn manager_with_tcp() -> (TransactionManager, Arc<MockTransport>) {
    (manager().await, MockTransport::tcp())
}

/// A request with a fresh RFC 3261 branch.
pub(crate) fn request(method: SipMethod) -> Request {
    request_with_branch(method, &make_branch())
}

/// A request with a caller-chosen branch, e.g. a non-magic-cookie one for
/// RFC 2543 matching tests.
pub(crate) fn request_with_branch(method: SipMethod, branch: &str) -> Request {
    let cseq_method = if method == SipMethod::Ack {
        SipMethod::Invite
    } else {
        method.clone()
    };

    let mut request = Request::new(
        method,
        Uri::sip(Some("bob"), Host::from("127.0.0.1"), Some(5070)),
    );
    request.headers.push(Header::Via(Via::new(
        TransportKind::Udp,
        HostPort::new(Host::from("127.0.0.1"), Some(5060)),
        branch,
    )));
    request.headers.push(Header::From(
        NameAddr::new(Uri::sip(Some("alice"), Host::from("127.0.0.1"), None)).with_tag(&make_tag()),
    ));
    request.headers.push(Header::To(NameAddr::new(Uri::sip(
        Some("bob"),
        Host::from("127.0.0.1"),
        None,
    ))));
    request.headers.push(Header::CallId(CallId::generate()));
    request.headers.push(Header::CSeq(CSeq::new(1, cseq_method)));
    request.headers.push(Header::MaxForwards(70));
    request
}

pub(crate) fn incoming(request: Request, transport: Arc<MockTransport>) -> IncomingRequest {
    IncomingRequest::new(
        request,
        transport as Arc<dyn ServerTransport>,
        Packet::new(PEER_ADDR.parse().unwrap()),
    )
}

/// An inbound response as the peer would answer `request`, carrying the
/// same branch and CSeq so it matches the transaction.
pub(crate) fn response_for(request: &Request, code: crate::message::StatusCode) -> IncomingResponse {
    IncomingResponse::new(
        Response::for_request(code, request),
        Packet::new(PEER_ADDR.parse().unwrap()),
    )
}

/// The ACK a peer sends for a final response to `request`.
pub(crate) fn ack_for(request: &Request, response: &Response) -> Request {
    Request::ack_for(request, response).expect("request has the headers an ACK needs")
}

/// Lets the transaction actors drain their mailboxes. Needed after timer
/// firings; TU calls and recv_* already wait for their own processing.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
