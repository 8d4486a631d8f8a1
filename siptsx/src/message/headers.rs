use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use util::ArcStr;

use super::{Host, HostPort, SipMethod, TransportKind, Uri};

/// A Via hop. Only the parameters the transaction layer consumes are
/// modeled; anything else a parser hands over lands in `params`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Via {
    pub transport: TransportKind,
    pub sent_by: HostPort,
    pub branch: Option<ArcStr>,
    pub received: Option<IpAddr>,
    pub rport: Option<u16>,
    pub maddr: Option<Host>,
}

impl Via {
    /// A Via hop with a branch and no receive-side parameters.
    pub fn new(transport: TransportKind, sent_by: HostPort, branch: &str) -> Self {
        Via {
            transport,
            sent_by,
            branch: Some(ArcStr::from(branch)),
            received: None,
            rport: None,
            maddr: None,
        }
    }

    /// The branch parameter, if present.
    pub fn branch(&self) -> Option<&ArcStr> {
        self.branch.as_ref()
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by)?;
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={}", maddr)?;
        }
        if let Some(received) = &self.received {
            write!(f, ";received={}", received)?;
        }
        if let Some(rport) = self.rport {
            write!(f, ";rport={}", rport)?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={}", branch)?;
        }
        Ok(())
    }
}

/// The CSeq header: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn new(seq: u32, method: SipMethod) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A From or To header value: display name, URI and tag parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameAddr {
    pub display: Option<ArcStr>,
    pub uri: Uri,
    pub tag: Option<ArcStr>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display: None,
            uri,
            tag: None,
        }
    }

    /// The same address with the given tag set.
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(ArcStr::from(tag));
        self
    }

    /// The tag parameter, if present.
    pub fn tag(&self) -> Option<&ArcStr> {
        self.tag.as_ref()
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{}\" ", display)?;
        }
        write!(f, "<{}>", self.uri)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        Ok(())
    }
}

/// The Call-ID header value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub ArcStr);

impl CallId {
    pub fn new(id: &str) -> Self {
        CallId(ArcStr::from(id))
    }

    /// A random Call-ID for locally originated requests.
    pub fn generate() -> Self {
        CallId(ArcStr::from(uuid::Uuid::new_v4().simple().to_string()))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message header. Headers the layer does not interpret are carried
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Header {
    Via(Via),
    From(NameAddr),
    To(NameAddr),
    CSeq(CSeq),
    CallId(CallId),
    MaxForwards(u32),
    ContentLength(u32),
    Other(ArcStr, ArcStr),
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Via(via) => write!(f, "Via: {}", via),
            Header::From(from) => write!(f, "From: {}", from),
            Header::To(to) => write!(f, "To: {}", to),
            Header::CSeq(cseq) => write!(f, "CSeq: {}", cseq),
            Header::CallId(call_id) => write!(f, "Call-ID: {}", call_id),
            Header::MaxForwards(hops) => write!(f, "Max-Forwards: {}", hops),
            Header::ContentLength(len) => write!(f, "Content-Length: {}", len),
            Header::Other(name, value) => write!(f, "{}: {}", name, value),
        }
    }
}

/// An ordered header list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Headers(Vec::with_capacity(capacity))
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend<I: IntoIterator<Item = Header>>(&mut self, other: I) {
        self.0.extend(other);
    }

    /// The topmost Via hop.
    pub fn top_via(&self) -> Option<&Via> {
        self.0.iter().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    /// Mutable access to the topmost Via hop.
    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.0.iter_mut().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    /// Every Via hop, topmost first.
    pub fn vias(&self) -> impl Iterator<Item = &Via> {
        self.0.iter().filter_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        self.0.iter().find_map(|h| match h {
            Header::CSeq(cseq) => Some(cseq),
            _ => None,
        })
    }

    pub fn from_header(&self) -> Option<&NameAddr> {
        self.0.iter().find_map(|h| match h {
            Header::From(from) => Some(from),
            _ => None,
        })
    }

    pub fn to_header(&self) -> Option<&NameAddr> {
        self.0.iter().find_map(|h| match h {
            Header::To(to) => Some(to),
            _ => None,
        })
    }

    pub fn to_header_mut(&mut self) -> Option<&mut NameAddr> {
        self.0.iter_mut().find_map(|h| match h {
            Header::To(to) => Some(to),
            _ => None,
        })
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.0.iter().find_map(|h| match h {
            Header::CallId(call_id) => Some(call_id),
            _ => None,
        })
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Header> for Headers {
    fn from_iter<I: IntoIterator<Item = Header>>(iter: I) -> Self {
        Headers(iter.into_iter().collect())
    }
}
