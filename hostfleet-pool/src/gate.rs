//! Per-host creation gate.
//!
//! Serialises everything that installs or removes the entry of one host-id
//! (create, close, refresh) while leaving other hosts untouched. Callers that
//! queue behind a failed attempt for the same configuration get that
//! attempt's error instead of starting another connect.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, MutexGuard};

use crate::error::PoolError;
use crate::host::HostConfig;

#[derive(Debug, Default)]
pub(crate) struct CreationGate {
    /// Completed attempts, bumped while the lock is held
    attempts: AtomicU64,
    /// Failure of the latest attempt and the configuration it used,
    /// `None` after a success
    last_failure: Mutex<Option<(HostConfig, PoolError)>>,
}

impl CreationGate {
    /// Take a ticket before waiting. Compared against the attempt counter
    /// once the gate is held.
    pub(crate) fn ticket(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) async fn enter(&self, ticket: u64) -> GateGuard<'_> {
        let last_failure = self.last_failure.lock().await;
        GateGuard {
            gate: self,
            last_failure,
            ticket,
        }
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a CreationGate,
    last_failure: MutexGuard<'a, Option<(HostConfig, PoolError)>>,
    ticket: u64,
}

impl GateGuard<'_> {
    /// Error from an attempt for the same `host` configuration that finished
    /// while this caller was queued.
    pub(crate) fn failure_while_waiting(&self, host: &HostConfig) -> Option<PoolError> {
        if self.gate.attempts.load(Ordering::Acquire) == self.ticket {
            return None;
        }
        match self.last_failure.as_ref() {
            Some((failed_host, err)) if failed_host == host => Some(err.clone()),
            _ => None,
        }
    }

    /// Publish the outcome of this caller's attempt and release the gate.
    pub(crate) fn finish(mut self, host: &HostConfig, failure: Option<PoolError>) {
        *self.last_failure = failure.map(|err| (host.clone(), err));
        self.gate.attempts.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn host(uri: &str) -> HostConfig {
        HostConfig::new("h1", "kvm-01", uri)
    }

    #[tokio::test]
    async fn test_waiter_sees_failure_of_earlier_attempt() {
        let gate = Arc::new(CreationGate::default());

        let first_ticket = gate.ticket();
        let second_ticket = gate.ticket();

        let first = gate.enter(first_ticket).await;
        assert!(first.failure_while_waiting(&host("mock://a")).is_none());
        first.finish(&host("mock://a"), Some(PoolError::Closed));

        let second = gate.enter(second_ticket).await;
        assert_eq!(second.failure_while_waiting(&host("mock://a")), Some(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_failure_for_other_config_is_not_shared() {
        let gate = CreationGate::default();
        let queued_ticket = gate.ticket();

        let first = gate.enter(gate.ticket()).await;
        first.finish(&host("mock://old"), Some(PoolError::Closed));

        let queued = gate.enter(queued_ticket).await;
        assert!(queued.failure_while_waiting(&host("mock://new")).is_none());
    }

    #[tokio::test]
    async fn test_late_arrival_starts_fresh() {
        let gate = CreationGate::default();

        let first = gate.enter(gate.ticket()).await;
        first.finish(&host("mock://a"), Some(PoolError::Closed));

        let late = gate.enter(gate.ticket()).await;
        assert!(late.failure_while_waiting(&host("mock://a")).is_none());
    }

    #[tokio::test]
    async fn test_success_clears_failure() {
        let gate = CreationGate::default();
        let queued_ticket = gate.ticket();

        let first = gate.enter(gate.ticket()).await;
        first.finish(&host("mock://a"), None);

        let queued = gate.enter(queued_ticket).await;
        assert!(queued.failure_while_waiting(&host("mock://a")).is_none());
    }
}
