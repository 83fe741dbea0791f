use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// The future a `TrustListener` awaits to grant trust for the SKI it was
/// invoked with. Resolving it is equivalent to calling `trust_remote`.
pub type GrantFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The operator's trust policy UI. Invoked exactly once per first-seen SKI;
/// the manager does not time this out — expiry is the consuming layer's job.
#[async_trait]
pub trait TrustListener: Send + Sync {
    async fn decide(&self, ski: String, grant: GrantFuture);
}

struct TrustEntry {
    trusted: AtomicBool,
    notify: Notify,
}

impl TrustEntry {
    fn new() -> Self {
        Self {
            trusted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn mark_trusted(&self) {
        self.trusted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> bool {
        loop {
            if self.trusted.load(Ordering::SeqCst) {
                return true;
            }
            self.notify.notified().await;
        }
    }
}

/// Per-peer-SKI trust registry. Events are created lazily on first query and
/// persist for the manager's lifetime; dropping the manager aborts any
/// outstanding trust-decision tasks so none outlive the transport they were
/// judging.
pub struct TrustManager<L> {
    listener: Arc<L>,
    entries: Mutex<HashMap<String, Arc<TrustEntry>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<L: TrustListener + 'static> TrustManager<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener: Arc::new(listener),
            entries: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, ski: &str) -> Arc<TrustEntry> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(ski) {
            return existing.clone();
        }

        let entry = Arc::new(TrustEntry::new());
        entries.insert(ski.to_string(), entry.clone());
        drop(entries);

        debug!(ski, "requesting trust decision");
        let listener = self.listener.clone();
        let grant_entry = entry.clone();
        let grant: GrantFuture = Box::pin(async move {
            grant_entry.mark_trusted();
        });
        let ski_owned = ski.to_string();
        let handle = tokio::spawn(async move {
            listener.decide(ski_owned, grant).await;
        });
        self.tasks.lock().unwrap().insert(ski.to_string(), handle);

        entry
    }

    /// Whether `ski` is currently trusted. Allocates the trust event (and
    /// fires the listener) on first call for a SKI, same as `wait_to_trust`.
    pub fn is_trusted(&self, ski: &str) -> bool {
        self.entry(ski).trusted.load(Ordering::SeqCst)
    }

    /// Resolves once `ski` becomes trusted.
    pub async fn wait_to_trust(&self, ski: &str) -> bool {
        self.entry(ski).wait().await
    }

    /// Marks `ski` trusted. Idempotent.
    pub fn trust_remote(&self, ski: &str) {
        self.entry(ski).mark_trusted();
    }

    /// Aborts any outstanding trust-decision tasks. Called automatically on
    /// drop; exposed so a driver can do it deterministically on shutdown.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl<L> Drop for TrustManager<L> {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct AutoGrant;

    #[async_trait]
    impl TrustListener for AutoGrant {
        async fn decide(&self, _ski: String, grant: GrantFuture) {
            grant.await;
        }
    }

    struct NeverGrant;

    #[async_trait]
    impl TrustListener for NeverGrant {
        async fn decide(&self, _ski: String, _grant: GrantFuture) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn auto_grant_resolves_wait_to_trust() {
        let mgr = TrustManager::new(AutoGrant);
        assert!(!mgr.is_trusted("aa:bb"));
        assert!(mgr.wait_to_trust("aa:bb").await);
        assert!(mgr.is_trusted("aa:bb"));
    }

    #[tokio::test]
    async fn listener_invoked_once_per_ski() {
        use std::sync::atomic::AtomicUsize;

        struct CountingListener(Arc<AtomicUsize>);

        #[async_trait]
        impl TrustListener for CountingListener {
            async fn decide(&self, _ski: String, grant: GrantFuture) {
                self.0.fetch_add(1, Ordering::SeqCst);
                grant.await;
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let mgr = TrustManager::new(CountingListener(count.clone()));
        let _ = mgr.is_trusted("ski-1");
        let _ = mgr.is_trusted("ski-1");
        mgr.wait_to_trust("ski-1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trust_remote_is_idempotent() {
        let mgr = TrustManager::new(NeverGrant);
        mgr.trust_remote("ski-2");
        mgr.trust_remote("ski-2");
        assert!(mgr.is_trusted("ski-2"));
    }

    #[tokio::test]
    async fn never_granting_listener_never_trusts() {
        let mgr = TrustManager::new(NeverGrant);
        assert!(!mgr.is_trusted("ski-3"));
        let result =
            tokio::time::timeout(Duration::from_millis(20), mgr.wait_to_trust("ski-3")).await;
        assert!(result.is_err());
    }
}
