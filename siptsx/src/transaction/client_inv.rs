use std::ops::Deref;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::fsm::{State, TsxCore, TsxLogic};
use crate::message::{CodeKind, Request};
use crate::timer::TimerKind;
use crate::transport::IncomingResponse;

use super::{HandlerGuard, Transaction};

/// Represents a Client INVITE transaction.
///
/// Created by [`TransactionManager::new_client_tsx`] for an INVITE request.
/// The transaction sends the INVITE, retransmits it on Timer A over
/// unreliable transports, delivers matched responses to the handlers
/// registered with [`InvClientTransaction::on_response`], and answers
/// non-2xx finals with an automatically built ACK on the same branch.
///
/// [`TransactionManager::new_client_tsx`]: super::TransactionManager::new_client_tsx
#[derive(Clone, Debug)]
pub struct InvClientTransaction {
    tsx: Transaction,
}

impl InvClientTransaction {
    pub(crate) fn new(tsx: Transaction) -> Self {
        InvClientTransaction { tsx }
    }

    pub(crate) fn base(&self) -> &Transaction {
        &self.tsx
    }

    /// Registers a response handler; responses received before the first
    /// registration are replayed to it immediately.
    pub fn on_response<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(&crate::message::Response) + Send + 'static,
    {
        self.tsx.register_response_handler(Box::new(handler))
    }

    /// Hands a matched inbound response to the transaction.
    pub async fn recv_response(&self, response: IncomingResponse) -> Result<()> {
        self.tsx.fire_response(response).await
    }
}

impl Deref for InvClientTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.tsx
    }
}

pub(crate) struct InvClientLogic {
    timer_a: Duration,
    ack: Option<Request>,
}

impl InvClientLogic {
    pub(crate) fn new() -> Self {
        InvClientLogic {
            timer_a: Duration::ZERO,
            ack: None,
        }
    }
}

#[async_trait]
impl TsxLogic for InvClientLogic {
    async fn on_start(&mut self, core: &TsxCore) -> Result<()> {
        if let Err(err) = core.send_request(core.request()).await {
            core.fail(err);
            return Ok(());
        }
        let timing = core.timing();
        if !core.reliable() {
            self.timer_a = timing.timer_a();
            core.timers().start(TimerKind::A, self.timer_a);
        }
        core.timers().start(TimerKind::B, timing.timer_b());
        Ok(())
    }

    async fn on_response(&mut self, core: &TsxCore, response: IncomingResponse) -> Result<()> {
        let response = response.response;
        match (core.state(), response.code().kind()) {
            (State::Calling, CodeKind::Provisional) => {
                core.timers().cancel(TimerKind::A);
                core.inner.set_last_response(response.clone());
                core.transition(State::Proceeding)?;
                core.inner.deliver_response(&response);
            }
            (State::Proceeding, CodeKind::Provisional) => {
                core.inner.set_last_response(response.clone());
                core.inner.deliver_response(&response);
            }
            (State::Calling | State::Proceeding, CodeKind::Success) => {
                core.timers().cancel(TimerKind::A);
                core.timers().cancel(TimerKind::B);
                core.inner.set_last_response(response.clone());
                core.transition(State::Accepted)?;
                core.timers().start(TimerKind::M, core.timing().timer_m());
                core.inner.deliver_response(&response);
            }
            (State::Accepted, CodeKind::Success) => {
                // A 2xx from another fork of the INVITE.
                core.inner.set_last_response(response.clone());
                core.inner.deliver_response(&response);
            }
            (State::Calling | State::Proceeding, _) => {
                core.timers().cancel(TimerKind::A);
                core.timers().cancel(TimerKind::B);
                core.inner.set_last_response(response.clone());

                // 17.1.1.3: the ACK for a non-2xx final is the transaction's
                // own, on the same branch as the INVITE.
                let ack = Request::ack_for(core.request(), &response)?;
                if let Err(err) = core.send_request(&ack).await {
                    core.fail(err);
                    return Ok(());
                }
                self.ack = Some(ack);

                core.transition(State::Completed)?;
                core.inner.deliver_response(&response);

                if core.reliable() {
                    core.transition(State::Terminated)?;
                } else {
                    core.timers()
                        .start(TimerKind::D, core.timing().timer_d(false));
                }
            }
            (State::Completed, kind) if kind != CodeKind::Provisional => {
                // 17.1.1.2: a retransmitted final re-triggers the ACK but
                // is not passed up to the TU again.
                if let Some(ack) = self.ack.clone() {
                    if let Err(err) = core.send_request(&ack).await {
                        core.fail(err);
                    }
                }
            }
            (state, _) => {
                log::debug!(
                    "transaction {}: ignoring {} in {:?}",
                    core.inner.key,
                    response.code(),
                    state
                );
            }
        }
        Ok(())
    }

    async fn on_timer(&mut self, core: &TsxCore, kind: TimerKind) -> Result<()> {
        match (core.state(), kind) {
            (State::Calling, TimerKind::A) => {
                if let Err(err) = core.send_request(core.request()).await {
                    core.fail(err);
                    return Ok(());
                }
                // After a restore the previous interval is unknown; fall
                // back to T1 rather than rescheduling at zero.
                self.timer_a = if self.timer_a.is_zero() {
                    core.timing().timer_a()
                } else {
                    core.timing().backoff(self.timer_a)
                };
                core.timers().start(TimerKind::A, self.timer_a);
            }
            (State::Calling | State::Proceeding, TimerKind::B) => {
                core.fail(Error::TransactionTimedOut(core.inner.key.clone()));
            }
            (State::Completed, TimerKind::D) => {
                core.transition(State::Terminated)?;
            }
            (State::Accepted, TimerKind::M) => {
                core.transition(State::Terminated)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SipMethod, StatusCode};
    use crate::transaction::mock;
    use crate::transport::SendOptions;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn test_state_calling() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);

        let tsx = manager
            .new_client_tsx(request, transport.clone(), SendOptions::default())
            .await
            .unwrap();
        mock::settle().await;

        assert_eq!(tsx.state(), State::Calling);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_state_proceeding() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);

        let tsx = manager
            .new_client_tsx(request.clone(), transport, SendOptions::default())
            .await
            .unwrap();
        tsx.recv_response(mock::response_for(&request, StatusCode::RINGING))
            .await
            .unwrap();

        assert_eq!(tsx.state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_non_2xx_final_sends_ack() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);
        let branch = request.top_via().unwrap().branch().unwrap().clone();

        let tsx = manager
            .new_client_tsx(request.clone(), transport.clone(), SendOptions::default())
            .await
            .unwrap();
        mock::settle().await;

        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();
        let _guard = tsx.as_invite().unwrap().on_response(move |response| {
            assert_eq!(response.code(), StatusCode::BUSY_HERE);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        tsx.recv_response(mock::response_for(&request, StatusCode::BUSY_HERE))
            .await
            .unwrap();

        assert_eq!(tsx.state(), State::Completed);
        let sent = transport.sent_requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].method(), &SipMethod::Ack);
        assert_eq!(sent[1].top_via().unwrap().branch().unwrap(), &branch);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        // A retransmitted final re-sends the ACK without notifying the TU.
        tsx.recv_response(mock::response_for(&request, StatusCode::BUSY_HERE))
            .await
            .unwrap();
        assert_eq!(transport.sent_requests().len(), 3);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_a_backoff() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);

        let tsx = manager
            .new_client_tsx(request, transport.clone(), SendOptions::default())
            .await
            .unwrap();
        mock::settle().await;
        assert_eq!(transport.sent_count(), 1);

        // Intervals double from T1 and cap at T2: 500ms, 1s, 2s, 4s, 4s.
        for (step, wait_ms) in [(2, 500), (3, 1000), (4, 2000), (5, 4000), (6, 4000)] {
            time::sleep(Duration::from_millis(wait_ms + 1)).await;
            mock::settle().await;
            assert_eq!(transport.sent_count(), step);
        }
        assert_eq!(tsx.state(), State::Calling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_b_times_out() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);

        let tsx = manager
            .new_client_tsx(request, transport, SendOptions::default())
            .await
            .unwrap();

        let timed_out = Arc::new(AtomicUsize::new(0));
        let seen = timed_out.clone();
        let _guard = tsx.on_error(move |err| {
            assert!(err.is_timeout());
            seen.fetch_add(1, Ordering::SeqCst);
        });

        time::sleep(Duration::from_millis(500 * 64 + 1)).await;
        mock::settle().await;

        assert_eq!(tsx.state(), State::Terminated);
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_d_terminates() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);

        let tsx = manager
            .new_client_tsx(request.clone(), transport, SendOptions::default())
            .await
            .unwrap();
        tsx.recv_response(mock::response_for(&request, StatusCode::BUSY_HERE))
            .await
            .unwrap();
        assert_eq!(tsx.state(), State::Completed);

        time::sleep(Duration::from_secs(32) + Duration::from_millis(1)).await;
        mock::settle().await;
        assert_eq!(tsx.state(), State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_2xx_enters_accepted_until_timer_m() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);

        let tsx = manager
            .new_client_tsx(request.clone(), transport.clone(), SendOptions::default())
            .await
            .unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();
        let _guard = tsx.as_invite().unwrap().on_response(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        tsx.recv_response(mock::response_for(&request, StatusCode::OK))
            .await
            .unwrap();
        assert_eq!(tsx.state(), State::Accepted);

        // A forked 2xx is still delivered, no ACK is generated here.
        tsx.recv_response(mock::response_for(&request, StatusCode::OK))
            .await
            .unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(transport.sent_requests().len(), 1);

        time::sleep(Duration::from_millis(500 * 64 + 1)).await;
        mock::settle().await;
        assert_eq!(tsx.state(), State::Terminated);
    }

    #[tokio::test]
    async fn test_reliable_final_terminates_directly() {
        let (manager, transport) = mock::manager_with_tcp().await;
        let request = mock::request(SipMethod::Invite);

        let tsx = manager
            .new_client_tsx(request.clone(), transport.clone(), SendOptions::default())
            .await
            .unwrap();
        tsx.recv_response(mock::response_for(&request, StatusCode::BUSY_HERE))
            .await
            .unwrap();

        assert_eq!(tsx.state(), State::Terminated);
        // Initial INVITE plus the auto-ACK; no retransmissions on TCP.
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);

        transport.fail_next();
        let tsx = manager
            .new_client_tsx(request, transport, SendOptions::default())
            .await
            .unwrap();

        let failed = Arc::new(AtomicUsize::new(0));
        let seen = failed.clone();
        let _guard = tsx.on_error(move |err| {
            assert_matches!(err, Error::TransportClosed);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        mock::settle().await;

        assert_eq!(tsx.state(), State::Terminated);
    }
}
