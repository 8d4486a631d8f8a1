//! An in-memory transport delivering typed messages between two endpoints
//! in the same process. Used by the demos and by tests that exercise two
//! transaction managers against each other without sockets or a parser.

use std::net::SocketAddr;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::{Error, Result};
use crate::message::{Host, HostPort, Request, Response, SipMessage, TransportKind};
use crate::transport::{ClientTransport, SendOptions, ServerTransport, TransportInfo};

/// One end of an in-process message pipe.
///
/// Both [`ClientTransport`] and [`ServerTransport`] are implemented, so one
/// end can carry client and server transactions at the same time like a
/// real socket would. The transport reports itself as UDP so the full
/// retransmission machinery runs; [`LocalTransport::reliable_pair`] flips
/// it to reliable behavior.
pub struct LocalTransport {
    kind: TransportKind,
    reliable: bool,
    addr: SocketAddr,
    peer: UnboundedSender<SipMessage>,
}

/// A connected pair of [`LocalTransport`]s plus the receive side of each.
pub fn local_pair(
    a: SocketAddr,
    b: SocketAddr,
) -> (
    (LocalTransport, UnboundedReceiver<SipMessage>),
    (LocalTransport, UnboundedReceiver<SipMessage>),
) {
    pair_with(TransportKind::Udp, false, a, b)
}

impl LocalTransport {
    /// A pair that reports a reliable transport, turning off the
    /// retransmission timers.
    pub fn reliable_pair(
        a: SocketAddr,
        b: SocketAddr,
    ) -> (
        (LocalTransport, UnboundedReceiver<SipMessage>),
        (LocalTransport, UnboundedReceiver<SipMessage>),
    ) {
        pair_with(TransportKind::Tcp, true, a, b)
    }

    fn deliver(&self, msg: SipMessage) -> Result<()> {
        self.peer.send(msg).map_err(|_| Error::TransportClosed)
    }
}

fn pair_with(
    kind: TransportKind,
    reliable: bool,
    a: SocketAddr,
    b: SocketAddr,
) -> (
    (LocalTransport, UnboundedReceiver<SipMessage>),
    (LocalTransport, UnboundedReceiver<SipMessage>),
) {
    let (a_tx, a_rx) = unbounded_channel();
    let (b_tx, b_rx) = unbounded_channel();

    let end_a = LocalTransport {
        kind,
        reliable,
        addr: a,
        peer: b_tx,
    };
    let end_b = LocalTransport {
        kind,
        reliable,
        addr: b,
        peer: a_tx,
    };

    ((end_a, a_rx), (end_b, b_rx))
}

impl TransportInfo for LocalTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn reliable(&self) -> bool {
        self.reliable
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn sent_by(&self) -> HostPort {
        HostPort::new(Host::Ip(self.addr.ip()), Some(self.addr.port()))
    }
}

#[async_trait::async_trait]
impl ClientTransport for LocalTransport {
    async fn send_request(&self, request: &Request, _opts: &SendOptions) -> Result<()> {
        self.deliver(request.clone().into())
    }
}

#[async_trait::async_trait]
impl ServerTransport for LocalTransport {
    async fn send_response(&self, response: &Response, _opts: &SendOptions) -> Result<()> {
        self.deliver(response.clone().into())
    }
}
