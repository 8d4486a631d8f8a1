//! A non-INVITE exchange: OPTIONS answered through a server transaction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use siptsx::message::{
    make_branch, make_tag, CSeq, CallId, Header, Host, HostPort, NameAddr, Request, SipMessage,
    SipMethod, StatusCode, TransportKind, Uri, Via,
};
use siptsx::transport::{local_pair, IncomingRequest, IncomingResponse, Packet, SendOptions};
use siptsx::{State, TransactionManager};
use tracing::info;

#[tokio::main]
async fn main() -> siptsx::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let alice_addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
    let bob_addr: SocketAddr = "127.0.0.1:5070".parse().unwrap();
    let ((alice_tp, mut alice_rx), (bob_tp, mut bob_rx)) = local_pair(alice_addr, bob_addr);
    let alice_tp = Arc::new(alice_tp);
    let bob_tp = Arc::new(bob_tp);

    let alice = TransactionManager::builder().build().await;
    let bob = TransactionManager::builder().build().await;

    let mut options = Request::new(
        SipMethod::Options,
        Uri::sip(Some("bob"), Host::from("127.0.0.1"), Some(5070)),
    );
    options.headers.push(Header::Via(Via::new(
        TransportKind::Udp,
        HostPort::new(Host::from("127.0.0.1"), Some(5060)),
        &make_branch(),
    )));
    options.headers.push(Header::From(
        NameAddr::new(Uri::sip(Some("alice"), Host::from("127.0.0.1"), None)).with_tag(&make_tag()),
    ));
    options.headers.push(Header::To(NameAddr::new(Uri::sip(
        Some("bob"),
        Host::from("127.0.0.1"),
        None,
    ))));
    options.headers.push(Header::CallId(CallId::generate()));
    options
        .headers
        .push(Header::CSeq(CSeq::new(1, SipMethod::Options)));

    let tsx = alice
        .new_client_tsx(options, alice_tp, SendOptions::default())
        .await?;
    tsx.on_response(|response| info!("alice saw {}", response));

    // Bob: the OPTIONS is unmatched, take it into a server transaction
    // and answer 200.
    let Some(SipMessage::Request(request)) = bob_rx.recv().await else {
        panic!("expected the OPTIONS request");
    };
    let incoming = IncomingRequest::new(request, bob_tp.clone(), Packet::new(alice_addr));
    let unmatched = bob
        .on_request(incoming)
        .await?
        .expect("a fresh OPTIONS has no transaction");
    let uas = bob.new_server_tsx(unmatched, SendOptions::default()).await?;
    uas.respond(StatusCode::OK).await?;

    // Alice: route the response back into the client transaction.
    let Some(SipMessage::Response(response)) = alice_rx.recv().await else {
        panic!("expected the 200 OK");
    };
    alice
        .on_response(IncomingResponse::new(response, Packet::new(bob_addr)))
        .await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(
        "client transaction is now {:?}, server transaction {:?}",
        tsx.state(),
        uas.state()
    );
    assert_eq!(tsx.state(), State::Completed);

    alice.close().await?;
    bob.close().await?;
    Ok(())
}
