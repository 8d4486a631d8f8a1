//! Transport contracts consumed by the transaction layer.
//!
//! The concrete wire transports (socket I/O, connection pooling, stream
//! framing) live outside this crate. The layer only needs the two send
//! traits plus the reliability metadata that drives timer arming, and the
//! envelopes inbound messages arrive in. [`ToBytes`] is the encode half a
//! wire transport uses at the socket boundary.

mod local;
pub mod resolve;

pub use local::{local_pair, LocalTransport};

use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Header, Headers, HostPort, Request, Response, TransportKind};

/// Metadata shared by every transport instance.
///
/// `reliable()` decides whether the retransmission timers (A/E/G) run and
/// whether the wait timers (D/I/J/K) collapse to zero.
pub trait TransportInfo {
    /// The transport protocol, as written into Via.
    fn kind(&self) -> TransportKind;

    /// Whether the network layer guarantees delivery and ordering.
    fn reliable(&self) -> bool {
        self.kind().is_reliable()
    }

    /// Whether the transport is secured (TLS).
    fn secured(&self) -> bool {
        self.kind().is_secure()
    }

    /// Whether messages arrive as a byte stream rather than datagrams.
    fn streamed(&self) -> bool {
        self.kind().is_reliable()
    }

    /// The port assumed when a Via sent-by names none.
    fn default_port(&self) -> u16 {
        self.kind().default_port()
    }

    /// The local socket address bound to this transport.
    fn local_addr(&self) -> SocketAddr;

    /// The sent-by value this transport writes into Via.
    fn sent_by(&self) -> HostPort;
}

/// The sending half a client transaction drives.
#[async_trait::async_trait]
pub trait ClientTransport: TransportInfo + Send + Sync + 'static {
    /// Sends a request towards its destination.
    async fn send_request(&self, request: &Request, opts: &SendOptions) -> Result<()>;
}

/// The sending half a server transaction drives.
#[async_trait::async_trait]
pub trait ServerTransport: TransportInfo + Send + Sync + 'static {
    /// Sends a response towards its destination.
    async fn send_response(&self, response: &Response, opts: &SendOptions) -> Result<()>;
}

/// This trait is used to convert a message into its wire bytes.
///
/// The transaction layer hands typed messages to the transport; a wire
/// transport calls this at the socket boundary. Content-Length is computed
/// from the actual body, replacing whatever the headers carried.
pub trait ToBytes {
    /// Converts the message into a byte buffer.
    fn to_bytes(&self) -> Result<Bytes>;
}

impl ToBytes for Request {
    fn to_bytes(&self) -> Result<Bytes> {
        encode(&self.req_line, &self.headers, &self.body)
    }
}

impl ToBytes for Response {
    fn to_bytes(&self) -> Result<Bytes> {
        encode(&self.status_line, &self.headers, &self.body)
    }
}

fn encode(start_line: &impl fmt::Display, headers: &Headers, body: &Bytes) -> Result<Bytes> {
    let estimated_message_size = if body.is_empty() { 800 } else { 1500 };
    let buf = BytesMut::with_capacity(estimated_message_size);

    let mut buf_writer = buf.writer();

    write!(buf_writer, "{}\r\n", start_line)?;
    for header in headers.iter() {
        // Replaced below with the length of the actual body.
        if matches!(header, Header::ContentLength(_)) {
            continue;
        }
        write!(buf_writer, "{}\r\n", header)?;
    }
    write!(buf_writer, "{}\r\n", Header::ContentLength(body.len() as u32))?;
    write!(buf_writer, "\r\n")?;
    buf_writer.write_all(body)?;

    Ok(buf_writer.into_inner().freeze())
}

/// Per-transaction send options, passed through to the transport on every
/// send the transaction performs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// An explicit destination overriding whatever the transport would
    /// derive from the message. Server transactions default this to the
    /// source address of the request.
    pub destination: Option<SocketAddr>,
}

impl SendOptions {
    pub fn to(destination: SocketAddr) -> Self {
        SendOptions {
            destination: Some(destination),
        }
    }
}

/// Receive-side envelope data attached to every inbound message.
#[derive(Debug, Clone)]
pub struct Packet {
    /// The sender's address.
    pub remote: SocketAddr,
    /// The local address the message arrived on, when known.
    pub local: Option<SocketAddr>,
    /// When the message was received.
    pub time: SystemTime,
}

impl Packet {
    pub fn new(remote: SocketAddr) -> Self {
        Packet {
            remote,
            local: None,
            time: SystemTime::now(),
        }
    }
}

/// An inbound request together with the transport it arrived on.
#[derive(Clone)]
pub struct IncomingRequest {
    pub request: Request,
    pub transport: Arc<dyn ServerTransport>,
    pub packet: Packet,
}

impl IncomingRequest {
    pub fn new(request: Request, transport: Arc<dyn ServerTransport>, packet: Packet) -> Self {
        IncomingRequest {
            request,
            transport,
            packet,
        }
    }

    pub fn method(&self) -> &crate::message::SipMethod {
        self.request.method()
    }
}

/// An inbound response.
#[derive(Debug, Clone)]
pub struct IncomingResponse {
    pub response: Response,
    pub packet: Packet,
}

impl IncomingResponse {
    pub fn new(response: Response, packet: Packet) -> Self {
        IncomingResponse { response, packet }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::error::Error;
    use crate::message::{Host, SipMessage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A transport that records everything sent through it.
    pub struct MockTransport {
        kind: TransportKind,
        reliable: bool,
        addr: SocketAddr,
        sent: Mutex<Vec<SipMessage>>,
        fail_next: AtomicBool,
    }

    impl MockTransport {
        pub fn udp() -> Arc<Self> {
            Arc::new(MockTransport {
                kind: TransportKind::Udp,
                reliable: false,
                addr: "127.0.0.1:5060".parse().unwrap(),
                sent: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
            })
        }

        pub fn tcp() -> Arc<Self> {
            Arc::new(MockTransport {
                kind: TransportKind::Tcp,
                reliable: true,
                addr: "127.0.0.1:5060".parse().unwrap(),
                sent: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
            })
        }

        /// Makes the next send fail with `TransportClosed`.
        pub fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<SipMessage> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn sent_requests(&self) -> Vec<Request> {
            self.sent()
                .into_iter()
                .filter_map(|m| m.into_request().ok())
                .collect()
        }

        pub fn sent_responses(&self) -> Vec<Response> {
            self.sent()
                .into_iter()
                .filter_map(|m| m.into_response().ok())
                .collect()
        }

        fn record(&self, msg: SipMessage) -> Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::TransportClosed);
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    impl TransportInfo for MockTransport {
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
    impl ClientTransport for MockTransport {
        async fn send_request(&self, request: &Request, _opts: &SendOptions) -> Result<()> {
            self.record(request.clone().into())
        }
    }

    #[async_trait::async_trait]
    impl ServerTransport for MockTransport {
        async fn send_response(&self, response: &Response, _opts: &SendOptions) -> Result<()> {
            self.record(response.clone().into())
        }
    }
}
