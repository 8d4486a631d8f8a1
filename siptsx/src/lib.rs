//! # siptsx
//!
//! The SIP transaction layer of a signaling stack: the four RFC 3261 §17
//! state machines (INVITE/non-INVITE, client/server) with their
//! retransmission and timeout timers, transaction matching per §17.1.3 /
//! §17.2.3 including the RFC 2543 fallback, a manager façade with inbound
//! interceptors, destination resolution for responses per §18.2.2 /
//! RFC 3263 §5, and JSON snapshots for warm restart.
//!
//! Message parsing, the concrete wire transports and the transaction user
//! (dialog/UA logic) live outside this crate; the contracts they plug into
//! are in [`message`] and [`transport`].
//!
//! # Examples
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use siptsx::{TransactionManager, message::*, transport::{SendOptions, local_pair}};
//! # async fn example() -> siptsx::Result<()> {
//! let manager = TransactionManager::builder().build().await;
//! let ((transport, _inbound), _peer) = local_pair(
//!     "127.0.0.1:5060".parse().unwrap(),
//!     "127.0.0.1:5070".parse().unwrap(),
//! );
//!
//! let mut invite = Request::new(
//!     SipMethod::Invite,
//!     Uri::sip(Some("bob"), Host::from("127.0.0.1"), Some(5070)),
//! );
//! # invite.headers.push(Header::CSeq(CSeq::new(1, SipMethod::Invite)));
//! # invite.headers.push(Header::Via(Via::new(
//! #     TransportKind::Udp,
//! #     HostPort::new(Host::from("127.0.0.1"), Some(5060)),
//! #     &make_branch(),
//! # )));
//! let tsx = manager
//!     .new_client_tsx(invite, Arc::new(transport), SendOptions::default())
//!     .await?;
//! tsx.on_response(|response| println!("<= {}", response));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod message;
pub mod timer;
pub mod timing;
pub mod transaction;
pub mod transport;

mod fsm;

pub use error::{Error, Result};
pub use fsm::State;
pub use timing::TimingConfig;
pub use transaction::{ClientTsx, ServerTsx, TransactionManager};
