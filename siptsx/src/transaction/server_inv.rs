use std::ops::Deref;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::fsm::{State, TsxCore, TsxLogic};
use crate::message::{CodeKind, Response, SipMethod, StatusCode};
use crate::timer::TimerKind;
use crate::transport::IncomingRequest;

use super::{HandlerGuard, Transaction};

/// Represents a Server INVITE transaction.
///
/// Starts in `Proceeding` and answers `100 Trying` on its own if the TU has
/// not produced a provisional response when Timer 100 fires. ACKs for
/// non-2xx finals are matched back to this transaction and move it to
/// `Confirmed`; ACKs for 2xx use a different branch and never match under
/// RFC 3261 rules, so they reach the TU through the manager instead.
#[derive(Clone, Debug)]
pub struct InvServerTransaction {
    tsx: Transaction,
}

impl InvServerTransaction {
    pub(crate) fn new(tsx: Transaction) -> Self {
        InvServerTransaction { tsx }
    }

    pub(crate) fn base(&self) -> &Transaction {
        &self.tsx
    }

    /// Registers a handler for ACKs matched to this transaction.
    pub fn on_ack<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(&crate::message::Request) + Send + 'static,
    {
        self.tsx.register_ack_handler(Box::new(handler))
    }

    /// Sends `code` built from the original INVITE.
    pub async fn respond(&self, code: StatusCode) -> Result<()> {
        let response = Response::for_request(code, self.tsx.request());
        self.respond_with(response).await
    }

    /// Sends a caller-built response through the transaction.
    pub async fn respond_with(&self, response: Response) -> Result<()> {
        self.tsx.fire_respond(response).await
    }

    /// Hands a matched inbound request to the transaction.
    pub async fn recv_request(&self, request: IncomingRequest) -> Result<()> {
        self.tsx.fire_request(request).await
    }
}

impl Deref for InvServerTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.tsx
    }
}

pub(crate) struct InvServerLogic {
    timer_g: Duration,
}

impl InvServerLogic {
    pub(crate) fn new() -> Self {
        InvServerLogic {
            timer_g: Duration::ZERO,
        }
    }
}

impl InvServerLogic {
    /// Sends a response; a failure here is fatal for the transaction and
    /// handed both to the error handlers and back to the caller.
    async fn send_or_fail(&self, core: &TsxCore, response: &Response) -> Result<()> {
        if let Err(err) = core.send_response(response).await {
            core.inner.deliver_error(&err);
            let _ = core.transition(State::Terminated);
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl TsxLogic for InvServerLogic {
    async fn on_start(&mut self, core: &TsxCore) -> Result<()> {
        core.timers()
            .start(TimerKind::T100, core.timing().time_100());
        Ok(())
    }

    async fn on_respond(&mut self, core: &TsxCore, response: Response) -> Result<()> {
        let code = response.code();
        match (core.state(), code.kind()) {
            (State::Proceeding, CodeKind::Provisional) => {
                core.timers().cancel(TimerKind::T100);
                self.send_or_fail(core, &response).await?;
                core.inner.set_last_response(response);
            }
            (State::Proceeding, CodeKind::Success) => {
                core.timers().cancel(TimerKind::T100);
                self.send_or_fail(core, &response).await?;
                core.inner.set_last_response(response);
                core.transition(State::Accepted)?;
                core.timers().start(TimerKind::L, core.timing().timer_l());
            }
            (State::Accepted, CodeKind::Success) => {
                // 2xx passthrough while forked branches settle. A send
                // failure is reported but the transaction stays: at least
                // one 2xx already went out and the TU may retry (17.2.1).
                core.inner.set_last_response(response.clone());
                core.send_response(&response).await?;
            }
            (State::Proceeding, _) => {
                core.timers().cancel(TimerKind::T100);
                self.send_or_fail(core, &response).await?;
                core.inner.set_last_response(response);
                core.transition(State::Completed)?;

                if !core.reliable() {
                    self.timer_g = core.timing().timer_g();
                    core.timers().start(TimerKind::G, self.timer_g);
                }
                core.timers().start(TimerKind::H, core.timing().timer_h());
            }
            (from, kind) => {
                let to = match kind {
                    CodeKind::Provisional => State::Proceeding,
                    CodeKind::Success => State::Accepted,
                    _ => State::Completed,
                };
                return Err(Error::InvalidStateTransition { from, to });
            }
        }
        Ok(())
    }

    async fn on_request(&mut self, core: &TsxCore, request: IncomingRequest) -> Result<()> {
        match request.request.method() {
            SipMethod::Ack => match core.state() {
                State::Completed => {
                    core.timers().cancel(TimerKind::G);
                    core.timers().cancel(TimerKind::H);
                    core.transition(State::Confirmed)?;
                    core.inner.deliver_ack(&request.request);
                    if core.reliable() {
                        core.transition(State::Terminated)?;
                    } else {
                        core.timers()
                            .start(TimerKind::I, core.timing().timer_i(false));
                    }
                }
                State::Accepted => {
                    // Reachable only through RFC 2543 fallback matching;
                    // magic-cookie ACKs for 2xx carry a new branch.
                    core.inner.deliver_ack(&request.request);
                }
                _ => {}
            },
            SipMethod::Invite => match core.state() {
                State::Proceeding => {
                    // Retransmitted INVITE: re-send the latest provisional.
                    if let Some(last) = core.inner.last_response() {
                        if let Err(err) = core.send_response(&last).await {
                            core.fail(err);
                        }
                    }
                }
                State::Completed => {
                    if let Some(last) = core.inner.last_response() {
                        if let Err(err) = core.send_response(&last).await {
                            core.fail(err);
                        }
                    }
                }
                _ => {}
            },
            method => {
                log::debug!(
                    "transaction {}: ignoring {} request",
                    core.inner.key,
                    method
                );
            }
        }
        Ok(())
    }

    async fn on_timer(&mut self, core: &TsxCore, kind: TimerKind) -> Result<()> {
        match (core.state(), kind) {
            (State::Proceeding, TimerKind::T100) => {
                // The TU stayed quiet: answer 100 Trying on its behalf.
                if core.inner.last_response().is_none() {
                    let trying = Response::for_request(StatusCode::TRYING, core.request());
                    if let Err(err) = core.send_response(&trying).await {
                        core.fail(err);
                        return Ok(());
                    }
                    core.inner.set_last_response(trying);
                }
            }
            (State::Completed, TimerKind::G) => {
                if let Some(last) = core.inner.last_response() {
                    if let Err(err) = core.send_response(&last).await {
                        core.fail(err);
                        return Ok(());
                    }
                }
                self.timer_g = if self.timer_g.is_zero() {
                    core.timing().timer_g()
                } else {
                    core.timing().backoff(self.timer_g)
                };
                core.timers().start(TimerKind::G, self.timer_g);
            }
            (State::Completed, TimerKind::H) => {
                // No ACK within 64·T1.
                core.fail(Error::TransactionTimedOut(core.inner.key.clone()));
            }
            (State::Confirmed, TimerKind::I) => {
                core.transition(State::Terminated)?;
            }
            (State::Accepted, TimerKind::L) => {
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
    use crate::transaction::mock;
    use crate::transport::SendOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    #[tokio::test(start_paused = true)]
    async fn test_auto_100_after_time_100() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Invite), transport.clone());

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        assert_eq!(tsx.state(), State::Proceeding);
        assert_eq!(transport.sent_count(), 0);

        time::sleep(Duration::from_millis(201)).await;
        mock::settle().await;

        let sent = transport.sent_responses();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].code(), StatusCode::TRYING);

        // A later 180 is the TU's own; no further auto-100.
        tsx.respond(StatusCode::RINGING).await.unwrap();
        let sent = transport.sent_responses();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].code(), StatusCode::RINGING);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tu_provisional_preempts_auto_100() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Invite), transport.clone());

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::RINGING).await.unwrap();

        time::sleep(Duration::from_millis(300)).await;
        mock::settle().await;

        // Only the 180; Timer 100 was cancelled.
        let sent = transport.sent_responses();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].code(), StatusCode::RINGING);
        assert_eq!(tsx.state(), State::Proceeding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_retransmits_and_confirms() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Invite);
        let incoming = mock::incoming(request.clone(), transport.clone());

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::BUSY_HERE).await.unwrap();
        assert_eq!(tsx.state(), State::Completed);
        assert_eq!(transport.sent_count(), 1);

        // A retransmitted INVITE re-sends the final.
        tsx.recv_request(mock::incoming(request.clone(), transport.clone()))
            .await
            .unwrap();
        assert_eq!(transport.sent_count(), 2);

        // Timer G fires and re-sends again.
        time::sleep(Duration::from_millis(501)).await;
        mock::settle().await;
        assert_eq!(transport.sent_count(), 3);

        let acked = Arc::new(AtomicUsize::new(0));
        let seen = acked.clone();
        let _guard = tsx.as_invite().unwrap().on_ack(move |ack| {
            assert_eq!(ack.method(), &SipMethod::Ack);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let ack = mock::ack_for(&request, &transport.sent_responses()[0]);
        tsx.recv_request(mock::incoming(ack, transport.clone()))
            .await
            .unwrap();
        assert_eq!(tsx.state(), State::Confirmed);
        assert_eq!(acked.load(Ordering::SeqCst), 1);

        // Timer I = T4.
        time::sleep(Duration::from_secs(5) + Duration::from_millis(1)).await;
        mock::settle().await;
        assert_eq!(tsx.state(), State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_h_without_ack() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Invite), transport);

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::BUSY_HERE).await.unwrap();

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
    async fn test_accepted_until_timer_l() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Invite), transport.clone());

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::OK).await.unwrap();
        assert_eq!(tsx.state(), State::Accepted);

        // A second 2xx passes straight through.
        tsx.respond(StatusCode::OK).await.unwrap();
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(tsx.state(), State::Accepted);

        time::sleep(Duration::from_millis(500 * 64 + 1)).await;
        mock::settle().await;
        assert_eq!(tsx.state(), State::Terminated);
    }

    #[tokio::test]
    async fn test_accepted_survives_retransmit_failure() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Invite), transport.clone());

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::OK).await.unwrap();

        transport.fail_next();
        let err = tsx.respond(StatusCode::OK).await.unwrap_err();
        assert!(matches!(err, Error::TransportClosed));

        // Still Accepted: the first 2xx was delivered.
        assert_eq!(tsx.state(), State::Accepted);
    }

    #[tokio::test]
    async fn test_respond_after_final_is_rejected() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Invite), transport);

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::BUSY_HERE).await.unwrap();

        let err = tsx.respond(StatusCode::RINGING).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(tsx.state(), State::Completed);
    }
}
