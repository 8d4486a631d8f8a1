//! Transaction keys, RFC 3261 §17.1.3 / §17.2.3 with the RFC 2543 §17.2.3
//! fallback form.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use util::ArcStr;

use crate::error::{Error, Result};
use crate::message::{Host, HostPort, Request, Response, SipMethod, MAGIC_COOKIE};

/// The canonical identifier inbound messages are matched by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TsxKey {
    /// Magic-cookie keys.
    Rfc3261(Rfc3261),
    /// Fallback matching for peers predating the magic cookie.
    Rfc2543(Rfc2543),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rfc3261 {
    Client(ClientKey),
    Server(ServerKey),
}

/// Client keys: branch plus CSeq method. The branch compares
/// case-sensitively; the method is canonicalized on construction, so the
/// derived equality is case-insensitive on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey {
    pub branch: ArcStr,
    pub method: SipMethod,
}

/// Server keys: branch, the sent-by of the topmost Via, and the method
/// (with ACK folded onto INVITE so the ACK for a non-2xx final matches the
/// original INVITE transaction).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerKey {
    pub branch: ArcStr,
    pub sent_by: HostPort,
    pub method: SipMethod,
}

/// The RFC 2543 fallback tuple. The To tag is deliberately not part of the
/// key: the original INVITE carries none while its ACK carries the
/// response's tag, so ACK matching compares the tag against the stored
/// final response instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rfc2543 {
    pub method: SipMethod,
    pub uri: ArcStr,
    pub from_tag: Option<ArcStr>,
    pub call_id: ArcStr,
    pub cseq: u32,
    pub via: ArcStr,
}

impl TsxKey {
    /// The client key of an outbound request.
    pub fn client(request: &Request) -> Result<TsxKey> {
        let via = request.top_via()?;
        let branch = via
            .branch()
            .filter(|b| !b.is_empty())
            .ok_or(Error::InvalidMessage("missing Via branch"))?;
        Ok(TsxKey::client_with(request.cseq()?.method.clone(), branch))
    }

    /// A client key from its parts.
    pub fn client_with(method: SipMethod, branch: &str) -> TsxKey {
        TsxKey::Rfc3261(Rfc3261::Client(ClientKey {
            branch: ArcStr::from(branch),
            method,
        }))
    }

    /// The client key an inbound response is matched by: topmost Via branch
    /// plus the CSeq method.
    pub fn for_response(response: &Response) -> Result<TsxKey> {
        let via = response.top_via()?;
        let branch = via
            .branch()
            .filter(|b| !b.is_empty())
            .ok_or(Error::InvalidMessage("missing Via branch"))?;
        Ok(TsxKey::client_with(response.cseq()?.method.clone(), branch))
    }

    /// The server key an inbound request is matched by. Requests whose
    /// topmost branch lacks the magic cookie fall back to the RFC 2543
    /// tuple. ACK derives its method slot from CSeq, i.e. INVITE.
    pub fn server(request: &Request) -> Result<TsxKey> {
        let via = request.top_via()?;
        let method = match request.method() {
            SipMethod::Ack => SipMethod::Invite,
            method => method.clone(),
        };

        match via.branch() {
            Some(branch) if branch.starts_with(MAGIC_COOKIE) => {
                Ok(TsxKey::Rfc3261(Rfc3261::Server(ServerKey {
                    branch: branch.clone(),
                    sent_by: via.sent_by.clone(),
                    method,
                })))
            }
            _ => Ok(TsxKey::Rfc2543(Rfc2543 {
                method,
                uri: ArcStr::from(request.req_line.uri.to_string()),
                from_tag: request.from_header()?.tag().cloned(),
                call_id: request.call_id()?.0.clone(),
                cseq: request.cseq()?.seq,
                via: ArcStr::from(via.to_string()),
            })),
        }
    }

    /// Whether this key uses the fallback form.
    pub fn is_rfc2543(&self) -> bool {
        matches!(self, TsxKey::Rfc2543(_))
    }

    /// The method slot of the key.
    pub fn method(&self) -> &SipMethod {
        match self {
            TsxKey::Rfc3261(Rfc3261::Client(key)) => &key.method,
            TsxKey::Rfc3261(Rfc3261::Server(key)) => &key.method,
            TsxKey::Rfc2543(key) => &key.method,
        }
    }

    /// The branch, for magic-cookie keys.
    pub fn branch(&self) -> Option<&ArcStr> {
        match self {
            TsxKey::Rfc3261(Rfc3261::Client(key)) => Some(&key.branch),
            TsxKey::Rfc3261(Rfc3261::Server(key)) => Some(&key.branch),
            TsxKey::Rfc2543(_) => None,
        }
    }

    /// A key is valid when its identifying slots are non-empty.
    pub fn is_valid(&self) -> bool {
        match self {
            TsxKey::Rfc3261(Rfc3261::Client(key)) => !key.branch.is_empty(),
            TsxKey::Rfc3261(Rfc3261::Server(key)) => !key.branch.is_empty(),
            TsxKey::Rfc2543(key) => !key.call_id.is_empty(),
        }
    }

    /// The length-prefixed binary form. [`TsxKey::decode`] round-trips it.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            TsxKey::Rfc3261(Rfc3261::Client(key)) => {
                buf.put_u8(1);
                put_str(&mut buf, &key.branch);
                put_str(&mut buf, key.method.as_str());
            }
            TsxKey::Rfc3261(Rfc3261::Server(key)) => {
                buf.put_u8(2);
                put_str(&mut buf, &key.branch);
                put_str(&mut buf, &key.sent_by.to_string());
                put_str(&mut buf, key.method.as_str());
            }
            TsxKey::Rfc2543(key) => {
                buf.put_u8(3);
                put_str(&mut buf, key.method.as_str());
                put_str(&mut buf, &key.uri);
                put_opt_str(&mut buf, key.from_tag.as_deref());
                put_str(&mut buf, &key.call_id);
                buf.put_u32(key.cseq);
                put_str(&mut buf, &key.via);
            }
        }
        buf.freeze()
    }

    /// Decodes the binary form produced by [`TsxKey::encode`].
    pub fn decode(mut buf: &[u8]) -> Result<TsxKey> {
        let buf = &mut buf;
        match get_u8(buf)? {
            1 => {
                let branch = get_str(buf)?;
                let method = SipMethod::from(get_str(buf)?.as_str());
                Ok(TsxKey::client_with(method, &branch))
            }
            2 => {
                let branch = get_str(buf)?;
                let sent_by = parse_host_port(&get_str(buf)?)?;
                let method = SipMethod::from(get_str(buf)?.as_str());
                Ok(TsxKey::Rfc3261(Rfc3261::Server(ServerKey {
                    branch: ArcStr::from(branch),
                    sent_by,
                    method,
                })))
            }
            3 => {
                let method = SipMethod::from(get_str(buf)?.as_str());
                let uri = get_str(buf)?;
                let from_tag = get_opt_str(buf)?;
                let call_id = get_str(buf)?;
                let cseq = get_u32(buf)?;
                let via = get_str(buf)?;
                Ok(TsxKey::Rfc2543(Rfc2543 {
                    method,
                    uri: ArcStr::from(uri),
                    from_tag: from_tag.map(ArcStr::from),
                    call_id: ArcStr::from(call_id),
                    cseq,
                    via: ArcStr::from(via),
                }))
            }
            _ => Err(Error::InvalidArgument("unknown key tag")),
        }
    }
}

impl fmt::Display for TsxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsxKey::Rfc3261(Rfc3261::Client(key)) => {
                write!(f, "client|{}|{}", key.branch, key.method)
            }
            TsxKey::Rfc3261(Rfc3261::Server(key)) => {
                write!(f, "server|{}|{}|{}", key.branch, key.sent_by, key.method)
            }
            TsxKey::Rfc2543(key) => {
                write!(
                    f,
                    "legacy|{}|{}|{}|{}",
                    key.method, key.call_id, key.cseq, key.uri
                )
            }
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::InvalidArgument("truncated key"));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::InvalidArgument("truncated key"));
    }
    Ok(buf.get_u32())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::InvalidArgument("truncated key"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::InvalidArgument("truncated key"));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| Error::InvalidArgument("key is not utf-8"))?;
    buf.advance(len);
    Ok(s)
}

fn get_opt_str(buf: &mut &[u8]) -> Result<Option<String>> {
    match get_u8(buf)? {
        0 => Ok(None),
        _ => Ok(Some(get_str(buf)?)),
    }
}

fn parse_host_port(s: &str) -> Result<HostPort> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let end = rest
            .find(']')
            .ok_or(Error::InvalidArgument("malformed host"))?;
        let host = &rest[..end];
        let port = rest[end + 1..].strip_prefix(':');
        (host, port)
    } else {
        match s.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (s, None),
        }
    };
    let port = match port {
        Some(p) => Some(
            p.parse::<u16>()
                .map_err(|_| Error::InvalidArgument("malformed port"))?,
        ),
        None => None,
    };
    Ok(HostPort::new(Host::from(host), port))
}
