//! A complete INVITE transaction between two in-process endpoints.
//!
//! Alice drives a client INVITE transaction; Bob answers through a server
//! transaction with 180 then 200. The ACK for the 2xx is Alice's own,
//! sent outside the transaction on a fresh branch, and reaches Bob as an
//! unmatched request. Run with `RUST_LOG=siptsx=trace` to watch the state
//! machines.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use siptsx::message::{
    make_branch, make_tag, ArcStr, CSeq, CallId, Header, Host, HostPort, NameAddr, Request,
    SipMessage, SipMethod, StatusCode, TransportKind, Uri, Via,
};
use siptsx::transport::{
    local_pair, ClientTransport, IncomingRequest, IncomingResponse, LocalTransport, Packet,
    SendOptions,
};
use siptsx::TransactionManager;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> siptsx::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let alice_addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
    let bob_addr: SocketAddr = "127.0.0.1:5070".parse().unwrap();
    let ((alice_tp, alice_rx), (bob_tp, bob_rx)) = local_pair(alice_addr, bob_addr);
    let alice_tp = Arc::new(alice_tp);
    let bob_tp = Arc::new(bob_tp);

    let alice = TransactionManager::builder().build().await;
    let bob = TransactionManager::builder().build().await;

    tokio::spawn(uas_loop(bob.clone(), bob_tp.clone(), bob_rx, alice_addr));
    tokio::spawn(uac_loop(alice.clone(), alice_rx, bob_addr));

    let invite = build_invite();
    let tsx = alice
        .new_client_tsx(invite, alice_tp.clone(), SendOptions::default())
        .await?;

    let (codes_tx, mut codes_rx) = tokio::sync::mpsc::unbounded_channel();
    let _guard = tsx.on_response(move |response| {
        let _ = codes_tx.send(response.code());
    });

    while let Some(code) = codes_rx.recv().await {
        info!("alice saw {}", code);
        if code.is_success() {
            break;
        }
    }

    // The ACK for a 2xx is the TU's, sent statelessly on its own branch.
    let response = tsx.last_response().expect("a 2xx was delivered");
    let mut ack = Request::ack_for(tsx.request(), &response)?;
    ack.headers.top_via_mut().unwrap().branch = Some(ArcStr::from(make_branch()));
    alice_tp.send_request(&ack, &SendOptions::default()).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.close().await?;
    bob.close().await?;
    info!("done");
    Ok(())
}

fn build_invite() -> Request {
    let mut invite = Request::new(
        SipMethod::Invite,
        Uri::sip(Some("bob"), Host::from("127.0.0.1"), Some(5070)),
    );
    invite.headers.push(Header::Via(Via::new(
        TransportKind::Udp,
        HostPort::new(Host::from("127.0.0.1"), Some(5060)),
        &make_branch(),
    )));
    invite.headers.push(Header::From(
        NameAddr::new(Uri::sip(Some("alice"), Host::from("127.0.0.1"), None)).with_tag(&make_tag()),
    ));
    invite.headers.push(Header::To(NameAddr::new(Uri::sip(
        Some("bob"),
        Host::from("127.0.0.1"),
        None,
    ))));
    invite.headers.push(Header::CallId(CallId::generate()));
    invite
        .headers
        .push(Header::CSeq(CSeq::new(1, SipMethod::Invite)));
    invite.headers.push(Header::MaxForwards(70));
    invite
}

async fn uas_loop(
    manager: TransactionManager,
    transport: Arc<LocalTransport>,
    mut inbound: UnboundedReceiver<SipMessage>,
    peer: SocketAddr,
) {
    while let Some(msg) = inbound.recv().await {
        let SipMessage::Request(request) = msg else {
            continue;
        };
        let incoming = IncomingRequest::new(request, transport.clone(), Packet::new(peer));
        match manager.on_request(incoming).await {
            Ok(Some(unmatched)) => match unmatched.request.method() {
                SipMethod::Invite => {
                    let tsx = match manager.new_server_tsx(unmatched, SendOptions::default()).await
                    {
                        Ok(tsx) => tsx,
                        Err(err) => {
                            warn!("bob could not take the INVITE: {}", err);
                            continue;
                        }
                    };
                    tokio::spawn(async move {
                        tsx.respond(StatusCode::RINGING).await.ok();
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        tsx.respond(StatusCode::OK).await.ok();
                    });
                }
                SipMethod::Ack => info!("bob: call established"),
                method => info!("bob ignoring {}", method),
            },
            Ok(None) => {}
            Err(err) => warn!("bob failed to handle a request: {}", err),
        }
    }
}

async fn uac_loop(
    manager: TransactionManager,
    mut inbound: UnboundedReceiver<SipMessage>,
    peer: SocketAddr,
) {
    while let Some(msg) = inbound.recv().await {
        let SipMessage::Response(response) = msg else {
            continue;
        };
        let incoming = IncomingResponse::new(response, Packet::new(peer));
        if let Err(err) = manager.on_response(incoming).await {
            warn!("alice failed to handle a response: {}", err);
        }
    }
}
