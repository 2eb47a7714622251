//! Single-flight token refresh.
//!
//! At most one refresh runs at a time. Callers that hit an expired token while
//! a refresh is outstanding attach to it and receive the same outcome. The
//! slot is emptied when the refresh settles, whichever way it went, so the
//! next expiry starts a fresh attempt.

use std::{future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt, Shared};
use shared::protocol::TokenPair;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RefreshError;

pub type RefreshOutcome = Result<TokenPair, RefreshError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Default)]
struct Slot {
    generation: u64,
    inflight: Option<(u64, SharedRefresh)>,
}

#[derive(Clone, Default)]
pub struct RefreshCoordinator {
    slot: Arc<Mutex<Slot>>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the outstanding refresh or start one with `start`.
    ///
    /// The refresh itself runs on its own task, so it completes and releases
    /// the slot even when every waiting caller has been dropped.
    pub async fn run<F, Fut>(&self, start: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome> + Send + 'static,
    {
        let refresh = {
            let mut slot = self.slot.lock().await;
            if let Some((generation, inflight)) = &slot.inflight {
                debug!(generation, "refresh: joining in-flight refresh");
                inflight.clone()
            } else {
                slot.generation += 1;
                let generation = slot.generation;
                debug!(generation, "refresh: starting");

                let work = start();
                let slot_handle = Arc::clone(&self.slot);
                // Blocks on the slot lock until this caller has installed the
                // shared future below.
                let task = tokio::spawn(async move {
                    let outcome = work.await;
                    let mut slot = slot_handle.lock().await;
                    if matches!(&slot.inflight, Some((current, _)) if *current == generation) {
                        slot.inflight = None;
                    }
                    outcome
                });
                let shared = async move {
                    task.await.unwrap_or_else(|err| {
                        Err(RefreshError::Transport(format!("refresh task failed: {err}")))
                    })
                }
                .boxed()
                .shared();
                slot.inflight = Some((generation, shared.clone()));
                shared
            }
        };
        refresh.await
    }

    pub async fn is_idle(&self) -> bool {
        self.slot.lock().await.inflight.is_none()
    }

    /// Number of refreshes started so far.
    pub async fn started(&self) -> u64 {
        self.slot.lock().await.generation
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::sync::Notify;

    use super::*;

    fn pair(tag: &str) -> TokenPair {
        TokenPair {
            access_token: format!("access-{tag}"),
            refresh_token: format!("refresh-{tag}"),
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let coordinator = RefreshCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            waiters.push(tokio::spawn(async move {
                coordinator
                    .run(move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok(pair("new"))
                    })
                    .await
            }));
        }

        while coordinator.is_idle().await {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();

        for waiter in waiters {
            assert_eq!(waiter.await.expect("join"), Ok(pair("new")));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.started().await, 1);
        assert!(coordinator.is_idle().await);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_frees_the_slot() {
        let coordinator = RefreshCoordinator::new();
        let release = Arc::new(Notify::new());

        let first = {
            let coordinator = coordinator.clone();
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                coordinator
                    .run(move || async move {
                        release.notified().await;
                        Err(RefreshError::Rejected {
                            status: 401,
                            message: "invalid token".into(),
                        })
                    })
                    .await
            })
        };
        while coordinator.is_idle().await {
            tokio::task::yield_now().await;
        }
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(|| async { Err(RefreshError::NoSession) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();

        let expected = Err(RefreshError::Rejected {
            status: 401,
            message: "invalid token".into(),
        });
        assert_eq!(first.await.expect("join"), expected);
        assert_eq!(second.await.expect("join"), expected);
        assert!(coordinator.is_idle().await);

        let next = coordinator.run(|| async { Ok(pair("again")) }).await;
        assert_eq!(next, Ok(pair("again")));
        assert_eq!(coordinator.started().await, 2);
    }

    #[tokio::test]
    async fn refresh_completes_when_caller_is_dropped() {
        let coordinator = RefreshCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let caller = {
            let coordinator = coordinator.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                coordinator
                    .run(move || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(pair("bg"))
                    })
                    .await
            })
        };
        while coordinator.is_idle().await {
            tokio::task::yield_now().await;
        }
        caller.abort();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_idle().await);
    }
}
