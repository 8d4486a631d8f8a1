use std::ops::Deref;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::fsm::{State, TsxCore, TsxLogic};
use crate::message::CodeKind;
use crate::timer::TimerKind;
use crate::transport::IncomingResponse;

use super::{HandlerGuard, Transaction};

/// Represents a Client non-INVITE transaction.
#[derive(Clone, Debug)]
pub struct ClientTransaction {
    tsx: Transaction,
}

impl ClientTransaction {
    pub(crate) fn new(tsx: Transaction) -> Self {
        ClientTransaction { tsx }
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

impl Deref for ClientTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.tsx
    }
}

pub(crate) struct ClientLogic {
    timer_e: Duration,
}

impl ClientLogic {
    pub(crate) fn new() -> Self {
        ClientLogic {
            timer_e: Duration::ZERO,
        }
    }
}

#[async_trait]
impl TsxLogic for ClientLogic {
    async fn on_start(&mut self, core: &TsxCore) -> Result<()> {
        if let Err(err) = core.send_request(core.request()).await {
            core.fail(err);
            return Ok(());
        }
        let timing = core.timing();
        if !core.reliable() {
            self.timer_e = timing.timer_e();
            core.timers().start(TimerKind::E, self.timer_e);
        }
        core.timers().start(TimerKind::F, timing.timer_f());
        Ok(())
    }

    async fn on_response(&mut self, core: &TsxCore, response: IncomingResponse) -> Result<()> {
        let response = response.response;
        match (core.state(), response.code().kind()) {
            (State::Trying, CodeKind::Provisional) => {
                core.inner.set_last_response(response.clone());
                core.transition(State::Proceeding)?;
                core.inner.deliver_response(&response);
            }
            (State::Proceeding, CodeKind::Provisional) => {
                core.inner.set_last_response(response.clone());
                core.inner.deliver_response(&response);
            }
            (State::Trying | State::Proceeding, _) => {
                core.timers().cancel(TimerKind::E);
                core.timers().cancel(TimerKind::F);
                core.inner.set_last_response(response.clone());
                core.transition(State::Completed)?;
                core.inner.deliver_response(&response);

                if core.reliable() {
                    core.transition(State::Terminated)?;
                } else {
                    core.timers()
                        .start(TimerKind::K, core.timing().timer_k(false));
                }
            }
            (State::Completed, _) => {
                // 17.1.2.2: retransmitted finals are absorbed silently.
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
            (State::Trying | State::Proceeding, TimerKind::E) => {
                if let Err(err) = core.send_request(core.request()).await {
                    core.fail(err);
                    return Ok(());
                }
                // Backoff doubles while Trying and pins to T2 once a
                // provisional arrived (17.1.2.2). After a restore the
                // previous interval is unknown; fall back to T1.
                self.timer_e = if core.state() != State::Trying {
                    core.timing().t2
                } else if self.timer_e.is_zero() {
                    core.timing().timer_e()
                } else {
                    core.timing().backoff(self.timer_e)
                };
                core.timers().start(TimerKind::E, self.timer_e);
            }
            (State::Trying | State::Proceeding, TimerKind::F) => {
                core.fail(Error::TransactionTimedOut(core.inner.key.clone()));
            }
            (State::Completed, TimerKind::K) => {
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn test_state_trying() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Options);

        let tsx = manager
            .new_client_tsx(request, transport.clone(), SendOptions::default())
            .await
            .unwrap();
        mock::settle().await;

        assert_eq!(tsx.state(), State::Trying);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_e_retransmission() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Options);

        let tsx = manager
            .new_client_tsx(request, transport.clone(), SendOptions::default())
            .await
            .unwrap();
        mock::settle().await;
        assert_eq!(transport.sent_count(), 1);

        // For the default values of T1 and T2, this results in
        // intervals of 500 ms, 1 s, 2 s, 4 s, 4 s.
        for (step, wait_ms) in [(2, 500), (3, 1000), (4, 2000), (5, 4000), (6, 4000)] {
            time::sleep(Duration::from_millis(wait_ms + 1)).await;
            mock::settle().await;
            assert_eq!(transport.sent_count(), step);
        }
        assert_eq!(tsx.state(), State::Trying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_f_times_out() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Options);

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
    async fn test_timer_k_terminates() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Options);

        let tsx = manager
            .new_client_tsx(request.clone(), transport, SendOptions::default())
            .await
            .unwrap();

        tsx.recv_response(mock::response_for(&request, StatusCode::OK))
            .await
            .unwrap();
        assert_eq!(tsx.state(), State::Completed);

        // Timer K = T4.
        time::sleep(Duration::from_secs(5) + Duration::from_millis(1)).await;
        mock::settle().await;
        assert_eq!(tsx.state(), State::Terminated);
    }

    #[tokio::test]
    async fn test_proceeding_then_completed() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Options);

        let tsx = manager
            .new_client_tsx(request.clone(), transport, SendOptions::default())
            .await
            .unwrap();

        let codes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = codes.clone();
        let _guard = tsx.as_non_invite().unwrap().on_response(move |response| {
            seen.lock().unwrap().push(response.code());
        });

        tsx.recv_response(mock::response_for(&request, StatusCode::RINGING))
            .await
            .unwrap();
        assert_eq!(tsx.state(), State::Proceeding);

        tsx.recv_response(mock::response_for(&request, StatusCode::OK))
            .await
            .unwrap();
        assert_eq!(tsx.state(), State::Completed);

        // A retransmitted final is absorbed without another delivery.
        tsx.recv_response(mock::response_for(&request, StatusCode::OK))
            .await
            .unwrap();

        assert_eq!(
            *codes.lock().unwrap(),
            vec![StatusCode::RINGING, StatusCode::OK]
        );
    }

    #[tokio::test]
    async fn test_reliable_final_terminates_directly() {
        let (manager, transport) = mock::manager_with_tcp().await;
        let request = mock::request(SipMethod::Options);

        let tsx = manager
            .new_client_tsx(request.clone(), transport.clone(), SendOptions::default())
            .await
            .unwrap();
        tsx.recv_response(mock::response_for(&request, StatusCode::OK))
            .await
            .unwrap();

        assert_eq!(tsx.state(), State::Terminated);
        assert_eq!(transport.sent_count(), 1);
    }
}
