//! Per-request lifecycle primitives
//!
//! Each workflow invocation owns its own context: a check-and-set latch
//! guarding the single terminal action, a oneshot responder carrying the
//! outcome back to the HTTP handler, and a cancellable deferred-cleanup
//! task. Nothing here is shared across requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::SessionManager;

/// Check-and-set flag that can be won exactly once
#[derive(Default)]
pub struct SingleFire(AtomicBool);

impl SingleFire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag. True for exactly one caller, ever.
    pub fn fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared state for one workflow invocation.
///
/// Three triggers race to finalize a request: the `open` transition, a
/// QR challenge, and the wall-clock timeout. Whichever wins `try_fire`
/// owns the response; everyone else must no-op.
pub struct RequestContext<T> {
    latch: SingleFire,
    responder: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T: Send> RequestContext<T> {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let ctx = Arc::new(Self {
            latch: SingleFire::new(),
            responder: Mutex::new(Some(tx)),
        });
        (ctx, rx)
    }

    /// Claim the terminal action. The winner must eventually call
    /// [`deliver`](Self::deliver); losers must not touch the response.
    pub fn try_fire(&self) -> bool {
        self.latch.fire()
    }

    pub fn is_settled(&self) -> bool {
        self.latch.is_fired()
    }

    /// Send the outcome to the waiting HTTP handler. Only meaningful for
    /// the `try_fire` winner; a second call is a silent no-op.
    pub fn deliver(&self, outcome: T) {
        let tx = self.responder.lock().map(|mut r| r.take()).unwrap_or(None);
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }

    /// Claim and deliver in one step, for triggers with no grace delay
    pub fn try_deliver(&self, outcome: T) -> bool {
        if !self.try_fire() {
            return false;
        }
        self.deliver(outcome);
        true
    }
}

/// Cleanup scheduled for after the caller has had time to use the
/// freshly authenticated session. Cancellable so tests can observe both
/// sides of the delay.
pub struct DeferredCleanup {
    handle: tokio::task::JoinHandle<()>,
}

impl DeferredCleanup {
    pub fn schedule(manager: Arc<SessionManager>, delay: Duration) -> Self {
        debug!(
            "Deferred cleanup for {} in {}s",
            manager.session_key(),
            delay.as_secs()
        );
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.cleanup().await;
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockFactory;
    use crate::credentials::FileCredentialStore;
    use crate::session::ActiveSessions;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_single_fire_wins_once() {
        let flag = SingleFire::new();
        assert!(!flag.is_fired());
        assert!(flag.fire());
        assert!(!flag.fire());
        assert!(flag.is_fired());
    }

    #[tokio::test]
    async fn test_single_fire_across_tasks() {
        let flag = Arc::new(SingleFire::new());
        let wins = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let flag = Arc::clone(&flag);
            let wins = Arc::clone(&wins);
            tasks.push(tokio::spawn(async move {
                if flag.fire() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_first_outcome_delivered() {
        let (ctx, rx) = RequestContext::<&'static str>::new();

        assert!(ctx.try_deliver("first"));
        assert!(!ctx.try_deliver("second"));
        assert!(ctx.is_settled());

        assert_eq!(rx.await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_fire_then_deliver() {
        let (ctx, rx) = RequestContext::<u32>::new();

        assert!(ctx.try_fire());
        // A racing trigger loses even before delivery happens
        assert!(!ctx.try_deliver(99));
        ctx.deliver(7);

        assert_eq!(rx.await.unwrap(), 7);
    }

    fn test_manager(dir: &std::path::Path) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            "pair_000".to_string(),
            Arc::new(FileCredentialStore::new(dir)),
            MockFactory::new(),
            Arc::new(ActiveSessions::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_cleanup_waits_full_delay() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = test_manager(dir.path());
        let (handle, _) = manager.initialize().await.unwrap();

        let deferred = DeferredCleanup::schedule(Arc::clone(&manager), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!handle.is_closed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(handle.is_closed());
        assert!(deferred.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_cleanup_cancel() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = test_manager(dir.path());
        let (handle, _) = manager.initialize().await.unwrap();

        let deferred = DeferredCleanup::schedule(Arc::clone(&manager), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(5)).await;
        deferred.cancel();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_closed());
    }
}
