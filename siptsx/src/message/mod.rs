//! The parsed message model consumed by the transaction layer.
//!
//! Wire parsing stays outside this crate: inbound messages arrive already
//! parsed, and the transaction layer hands outbound messages to the
//! transport as typed values. A wire transport turns them into bytes at
//! the socket boundary through [`ToBytes`](crate::transport::ToBytes).
//! Only the headers the transaction machinery interprets are modeled as
//! variants, everything else rides along verbatim.

mod code;
mod headers;
mod method;
mod transport;
mod uri;

pub use code::{CodeKind, StatusCode};
pub use headers::{CSeq, CallId, Header, Headers, NameAddr, Via};
pub use method::SipMethod;
pub use transport::TransportKind;
pub use uri::{Host, HostPort, Scheme, Uri};
pub use util::ArcStr;

use std::fmt;

use bytes::Bytes;
use enum_as_inner::EnumAsInner;
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The RFC 3261 branch prefix that marks a Via branch as transaction key
/// material.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// The request line of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLine {
    pub method: SipMethod,
    pub uri: Uri,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// The status line of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: ArcStr,
}

impl StatusLine {
    pub fn new(code: StatusCode) -> Self {
        StatusLine {
            code,
            reason: ArcStr::from(code.reason()),
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}", self.code, self.reason)
    }
}

/// A parsed SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub req_line: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: SipMethod, uri: Uri) -> Self {
        Request {
            req_line: RequestLine { method, uri },
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn method(&self) -> &SipMethod {
        &self.req_line.method
    }

    pub fn top_via(&self) -> Result<&Via> {
        self.headers
            .top_via()
            .ok_or(Error::InvalidMessage("missing Via header"))
    }

    pub fn cseq(&self) -> Result<&CSeq> {
        self.headers
            .cseq()
            .ok_or(Error::InvalidMessage("missing CSeq header"))
    }

    pub fn from_header(&self) -> Result<&NameAddr> {
        self.headers
            .from_header()
            .ok_or(Error::InvalidMessage("missing From header"))
    }

    pub fn to_header(&self) -> Result<&NameAddr> {
        self.headers
            .to_header()
            .ok_or(Error::InvalidMessage("missing To header"))
    }

    pub fn call_id(&self) -> Result<&CallId> {
        self.headers
            .call_id()
            .ok_or(Error::InvalidMessage("missing Call-ID header"))
    }

    /// Builds the ACK for a non-2xx final response, as sent from within the
    /// INVITE client transaction. The ACK reuses the INVITE's top Via (and
    /// with it the branch), From, Call-ID and CSeq number; the To header is
    /// taken from the response so the peer's tag is echoed.
    pub fn ack_for(original: &Request, response: &Response) -> Result<Request> {
        let via = original.top_via()?.clone();
        let from = original.from_header()?.clone();
        let to = response.to_header()?.clone();
        let call_id = original.call_id()?.clone();
        let cseq = CSeq::new(original.cseq()?.seq, SipMethod::Ack);

        let mut headers = Headers::with_capacity(5);
        headers.push(Header::Via(via));
        headers.push(Header::From(from));
        headers.push(Header::To(to));
        headers.push(Header::CallId(call_id));
        headers.push(Header::CSeq(cseq));

        Ok(Request {
            req_line: RequestLine {
                method: SipMethod::Ack,
                uri: original.req_line.uri.clone(),
            },
            headers,
            body: Bytes::new(),
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.req_line)
    }
}

/// A parsed SIP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status_line: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(code: StatusCode) -> Self {
        Response {
            status_line: StatusLine::new(code),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    pub fn top_via(&self) -> Result<&Via> {
        self.headers
            .top_via()
            .ok_or(Error::InvalidMessage("missing Via header"))
    }

    pub fn cseq(&self) -> Result<&CSeq> {
        self.headers
            .cseq()
            .ok_or(Error::InvalidMessage("missing CSeq header"))
    }

    pub fn to_header(&self) -> Result<&NameAddr> {
        self.headers
            .to_header()
            .ok_or(Error::InvalidMessage("missing To header"))
    }

    /// Builds a response for `request` with the headers RFC 3261 §8.2.6
    /// requires copied over: every Via hop in order, From, To, Call-ID and
    /// CSeq. Non-provisional responses get a To tag when the request carried
    /// none; the tag is derived from the branch so retransmitted requests
    /// produce the same tag.
    pub fn for_request(code: StatusCode, request: &Request) -> Response {
        let mut headers = Headers::with_capacity(request.headers.len());

        headers.extend(request.headers.vias().cloned().map(Header::Via));
        if let Some(from) = request.headers.from_header() {
            headers.push(Header::From(from.clone()));
        }
        if let Some(to) = request.headers.to_header() {
            let mut to = to.clone();
            if to.tag().is_none() && code.as_u16() > 100 {
                let tag = request
                    .headers
                    .top_via()
                    .and_then(|via| via.branch().cloned())
                    .unwrap_or_else(|| ArcStr::from(make_tag().as_str()));
                to.tag = Some(tag);
            }
            headers.push(Header::To(to));
        }
        if let Some(call_id) = request.headers.call_id() {
            headers.push(Header::CallId(call_id.clone()));
        }
        if let Some(cseq) = request.headers.cseq() {
            headers.push(Header::CSeq(cseq.clone()));
        }

        Response {
            status_line: StatusLine::new(code),
            headers,
            body: Bytes::new(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status_line)
    }
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner, Serialize, Deserialize)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl From<Request> for SipMessage {
    fn from(request: Request) -> Self {
        SipMessage::Request(request)
    }
}

impl From<Response> for SipMessage {
    fn from(response: Response) -> Self {
        SipMessage::Response(response)
    }
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A fresh RFC 3261 branch parameter.
pub fn make_branch() -> String {
    format!("{}{}", MAGIC_COOKIE, random_token(12))
}

/// A fresh From/To tag.
pub fn make_tag() -> String {
    random_token(8)
}
