use std::ops::Deref;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::fsm::{State, TsxCore, TsxLogic};
use crate::message::{CodeKind, Response, StatusCode};
use crate::timer::TimerKind;
use crate::transport::IncomingRequest;

use super::{HandlerGuard, Transaction};

/// Represents a Server non-INVITE transaction.
#[derive(Clone, Debug)]
pub struct ServerTransaction {
    tsx: Transaction,
}

impl ServerTransaction {
    pub(crate) fn new(tsx: Transaction) -> Self {
        ServerTransaction { tsx }
    }

    pub(crate) fn base(&self) -> &Transaction {
        &self.tsx
    }

    /// Registers a handler for ACKs matched to this transaction. Non-INVITE
    /// transactions never receive one under RFC 3261 matching; the handler
    /// only fires for RFC 2543 peers.
    pub fn on_ack<F>(&self, handler: F) -> HandlerGuard
    where
        F: FnMut(&crate::message::Request) + Send + 'static,
    {
        self.tsx.register_ack_handler(Box::new(handler))
    }

    /// Sends `code` built from the original request.
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

impl Deref for ServerTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.tsx
    }
}

pub(crate) struct ServerLogic;

impl ServerLogic {
    pub(crate) fn new() -> Self {
        ServerLogic
    }

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
impl TsxLogic for ServerLogic {
    async fn on_respond(&mut self, core: &TsxCore, response: Response) -> Result<()> {
        let code = response.code();
        match (core.state(), code.kind()) {
            (State::Trying, CodeKind::Provisional) => {
                self.send_or_fail(core, &response).await?;
                core.inner.set_last_response(response);
                core.transition(State::Proceeding)?;
            }
            (State::Proceeding, CodeKind::Provisional) => {
                self.send_or_fail(core, &response).await?;
                core.inner.set_last_response(response);
            }
            (State::Trying | State::Proceeding, _) => {
                self.send_or_fail(core, &response).await?;
                core.inner.set_last_response(response);
                core.transition(State::Completed)?;

                if core.reliable() {
                    core.transition(State::Terminated)?;
                } else {
                    core.timers()
                        .start(TimerKind::J, core.timing().timer_j(false));
                }
            }
            (from, kind) => {
                let to = match kind {
                    CodeKind::Provisional => State::Proceeding,
                    _ => State::Completed,
                };
                return Err(Error::InvalidStateTransition { from, to });
            }
        }
        Ok(())
    }

    async fn on_request(&mut self, core: &TsxCore, request: IncomingRequest) -> Result<()> {
        match core.state() {
            State::Proceeding | State::Completed => {
                // 17.2.2: a retransmission re-triggers the latest response.
                if let Some(last) = core.inner.last_response() {
                    if let Err(err) = core.send_response(&last).await {
                        core.fail(err);
                    }
                }
            }
            state => {
                log::debug!(
                    "transaction {}: absorbing {} retransmit in {:?}",
                    core.inner.key,
                    request.method(),
                    state
                );
            }
        }
        Ok(())
    }

    async fn on_timer(&mut self, core: &TsxCore, kind: TimerKind) -> Result<()> {
        if let (State::Completed, TimerKind::J) = (core.state(), kind) {
            core.transition(State::Terminated)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;
    use crate::transaction::mock;
    use crate::transport::SendOptions;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn test_trying_then_proceeding() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Options), transport.clone());

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        assert_eq!(tsx.state(), State::Trying);

        tsx.respond(StatusCode::TRYING).await.unwrap();
        assert_eq!(tsx.state(), State::Proceeding);
        assert_eq!(tsx.last_status_code(), Some(StatusCode::TRYING));
    }

    #[tokio::test]
    async fn test_final_enters_completed() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Options), transport);

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::OK).await.unwrap();

        assert_eq!(tsx.state(), State::Completed);
        assert_eq!(tsx.last_status_code(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_retransmit_resends_response() {
        let (manager, transport) = mock::manager_with_udp().await;
        let request = mock::request(SipMethod::Options);
        let incoming = mock::incoming(request.clone(), transport.clone());

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();

        // While Trying, retransmissions are absorbed.
        tsx.recv_request(mock::incoming(request.clone(), transport.clone()))
            .await
            .unwrap();
        assert_eq!(transport.sent_count(), 0);

        tsx.respond(StatusCode::OK).await.unwrap();
        tsx.recv_request(mock::incoming(request, transport.clone()))
            .await
            .unwrap();
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_j_terminates() {
        let (manager, transport) = mock::manager_with_udp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Options), transport);

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::OK).await.unwrap();

        time::sleep(Duration::from_millis(500 * 64 + 1)).await;
        mock::settle().await;

        assert_eq!(tsx.state(), State::Terminated);
        assert_eq!(tsx.last_status_code(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_reliable_final_terminates_directly() {
        let (manager, transport) = mock::manager_with_tcp().await;
        let incoming = mock::incoming(mock::request(SipMethod::Options), transport);

        let tsx = manager
            .new_server_tsx(incoming, SendOptions::default())
            .await
            .unwrap();
        tsx.respond(StatusCode::OK).await.unwrap();

        assert_eq!(tsx.state(), State::Terminated);
    }
}
