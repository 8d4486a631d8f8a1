//! Snapshot codec for warm restart and failover.
//!
//! A [`TsxSnapshot`] captures everything needed to rebuild a transaction in
//! place: identity, state, the original request and send options, the last
//! response, the timing bases, and the deadline of every armed timer.
//! [`TransactionManager::restore_client_tsx`] and
//! [`TransactionManager::restore_server_tsx`] consume it; timers whose
//! deadline already passed fire immediately after restore.
//!
//! [`TransactionManager::restore_client_tsx`]: super::TransactionManager::restore_client_tsx
//! [`TransactionManager::restore_server_tsx`]: super::TransactionManager::restore_server_tsx

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fsm::State;
use crate::message::{Request, Response};
use crate::timer::TimerSnapshot;
use crate::timing::TimingConfig;
use crate::transport::SendOptions;

use super::key::TsxKey;
use super::{Transaction, TsxKind};

/// The stable JSON form of a live transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsxSnapshot {
    /// Capture time, nanoseconds since the Unix epoch.
    pub time: u64,
    #[serde(rename = "type")]
    pub kind: TsxKind,
    pub state: State,
    pub key: TsxKey,
    pub request: Request,
    pub send_options: SendOptions,
    pub last_response: Option<Response>,
    pub timing_config: TimingConfig,
    pub timers: Vec<TimerSnapshot>,
}

impl TsxSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<TsxSnapshot> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Transaction {
    /// Captures the current state of this transaction for persistence.
    pub fn snapshot(&self) -> TsxSnapshot {
        let inner = self.inner();
        TsxSnapshot {
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            kind: inner.kind,
            state: inner.state(),
            key: inner.key.clone(),
            request: inner.request.clone(),
            send_options: inner.opts.clone(),
            last_response: inner.last_response(),
            timing_config: inner.timing,
            timers: inner.timers.snapshot(),
        }
    }
}
