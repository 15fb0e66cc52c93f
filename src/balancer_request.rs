//! Retry wrapper around a single-attempt connect operation.
//!
//! This generalizes `proxy::handler::phase_upstream`'s "try a node, on
//! failure mark it down and try the next one" loop into the shape the
//! specification gives it explicitly: a retry budget fixed by list size,
//! one `FailureManager::Set(CONNECT, 20s)` per failed attempt, and a single
//! success/error exit.

use crate::address::{AddressList, StickyHash};
use crate::error::BalancerError;
use crate::failure::{FailureInfo, FailureManager, FailureStatus};
use crate::selector::{pick, RoundRobinBalancer};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `{0:0, 1:0, 2:1, 3:2, >=4:3}[list.size]`.
pub fn retry_budget(list_size: usize) -> u32 {
    match list_size {
        0 | 1 => 0,
        2 => 1,
        3 => 2,
        _ => 3,
    }
}

/// Duration a failed connect attempt sets `CONNECT` for.
pub const CONNECT_FAILURE_DURATION: Duration = Duration::from_secs(20);

/// Drive `attempt` against successive picks from `list` until it succeeds
/// or the retry budget (`retry_budget(list.len())`) is exhausted.
///
/// `attempt` receives the chosen address and must return `Ok` on success or
/// `Err` on a connect-class failure; any other error kind is NOT retried —
/// it is propagated immediately (protocol errors are the caller's decision).
pub async fn start<F, Fut, R>(
    list: &AddressList,
    failures: &FailureManager,
    balancer: &RoundRobinBalancer,
    sticky_hash: StickyHash,
    mut attempt: F,
) -> Result<R, BalancerError>
where
    F: FnMut(crate::address::SocketAddress, Arc<FailureInfo>) -> Fut,
    Fut: Future<Output = Result<R, BalancerError>>,
{
    if list.is_empty() {
        return Err(BalancerError::ClusterEmpty);
    }

    let mut retries = retry_budget(list.len());
    let mut last_err;

    loop {
        let now = Instant::now();
        let addr = pick(list, failures, balancer, now, sticky_hash).clone();
        let failure = failures.make(&addr);

        match attempt(addr, failure.clone()).await {
            Ok(r) => {
                failure.unset(FailureStatus::Connect, now);
                return Ok(r);
            }
            Err(BalancerError::Cancelled) => return Err(BalancerError::Cancelled),
            Err(e) => {
                failure.set(FailureStatus::Connect, now, CONNECT_FAILURE_DURATION);
                last_err = e;
            }
        }

        if retries == 0 {
            tracing::warn!(error = %last_err, "balancer_request: retry budget exhausted");
            return Err(last_err);
        }
        retries -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{SocketAddress, StickyMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn list(n: usize) -> AddressList {
        AddressList::new(
            (0..n)
                .map(|i| SocketAddress::inet(format!("10.0.0.{}:80", i + 1).parse().unwrap()))
                .collect(),
            StickyMode::None,
        )
    }

    #[test]
    fn retry_budgets_match_spec_table() {
        assert_eq!(retry_budget(1), 0);
        assert_eq!(retry_budget(2), 1);
        assert_eq!(retry_budget(3), 2);
        assert_eq!(retry_budget(4), 3);
        assert_eq!(retry_budget(10), 3);
    }

    #[tokio::test]
    async fn succeeds_on_first_healthy_attempt() {
        let l = list(3);
        let fm = FailureManager::new();
        let rr = RoundRobinBalancer::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let a2 = attempts.clone();
        let result: Result<&'static str, BalancerError> =
            start(&l, &fm, &rr, 0, |_addr, _failure| {
                a2.fetch_add(1, Ordering::Relaxed);
                async { Ok("ok") }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_retry_budget_then_surfaces_error() {
        let l = list(3); // retry budget 2 => 3 total attempts
        let fm = FailureManager::new();
        let rr = RoundRobinBalancer::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let a2 = attempts.clone();
        let result: Result<(), BalancerError> = start(&l, &fm, &rr, 0, |_addr, _failure| {
            a2.fetch_add(1, Ordering::Relaxed);
            async { Err(BalancerError::Connect("refused".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn empty_list_surfaces_cluster_empty_without_attempting() {
        let l = AddressList::new(vec![], StickyMode::None);
        let fm = FailureManager::new();
        let rr = RoundRobinBalancer::new();
        let result: Result<(), BalancerError> =
            start(&l, &fm, &rr, 0, |_addr, _failure| async { Ok(()) }).await;
        assert!(matches!(result, Err(BalancerError::ClusterEmpty)));
    }
}
