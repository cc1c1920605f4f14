//! Ensure-by-key: at most one provisioning per logical key.
//!
//! Each key owns a reference-counted async mutex held for the full
//! duration of the ensure call, so concurrent callers with the same key
//! coalesce onto one provisioning. Waiting on the lock is a plain
//! future: a caller that times out or is canceled simply drops its
//! acquisition, leaving the in-flight provisioning untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;

use super::SandboxApi;
use crate::policy::PolicyDocument;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::SandboxStatus;

#[derive(Debug, Clone)]
pub struct EnsureOptions {
    pub policy: PolicyDocument,
    pub backend: Option<String>,
    /// Adopt this existing sandbox for the key instead of creating one.
    pub sandbox_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    pub sandbox_id: String,
    pub backend: String,
    pub created: bool,
}

#[derive(Debug, Clone)]
struct Cached {
    sandbox_id: String,
    backend: String,
}

struct KeyLock {
    lock: Arc<Mutex<()>>,
    refs: usize,
}

pub struct EnsureCoalescer {
    api: Arc<dyn SandboxApi>,
    locks: StdMutex<HashMap<String, KeyLock>>,
    cache: StdMutex<HashMap<String, Cached>>,
}

impl EnsureCoalescer {
    pub fn new(api: Arc<dyn SandboxApi>) -> Self {
        Self {
            api,
            locks: StdMutex::new(HashMap::new()),
            cache: StdMutex::new(HashMap::new()),
        }
    }

    /// Ensure a sandbox for `key`: reuse a cached READY sandbox,
    /// replace a terminal or stopping one, or provision fresh. Honors
    /// caller cancellation while waiting for the key lock.
    pub async fn ensure(&self, key: &str, options: EnsureOptions) -> Result<Ensured, SandboxError> {
        let lock = self.acquire(key);
        let _release = ReleaseOnDrop {
            coalescer: self,
            key,
        };
        let _held = lock.lock_owned().await;

        let cached = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned();

        if let Some(cached) = cached {
            let backend_changed = options
                .backend
                .as_ref()
                .is_some_and(|b| *b != cached.backend);
            if backend_changed {
                // A different backend cannot reuse the VM: treat the
                // cached sandbox as terminal and replace it.
                tracing::debug!(
                    key = %key,
                    cached_backend = %cached.backend,
                    requested = ?options.backend,
                    "backend changed, dropping cached sandbox"
                );
                self.purge(key);
            } else {
                match self.api.get_sandbox(&cached.sandbox_id).await {
                    Ok(info) if info.status == SandboxStatus::Ready => {
                        return Ok(Ensured {
                            sandbox_id: cached.sandbox_id,
                            backend: cached.backend,
                            created: false,
                        });
                    }
                    // STOPPING, STOPPED, FAILED, or already gone: the
                    // key falls through to a fresh create.
                    Ok(_) => self.purge(key),
                    Err(SandboxError::NotFound(_)) => self.purge(key),
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(sandbox_id) = options.sandbox_id {
            let backend = options.backend.clone().unwrap_or_default();
            self.record(key, &sandbox_id, &backend);
            return Ok(Ensured {
                sandbox_id,
                backend,
                created: false,
            });
        }

        let info = self
            .api
            .create_sandbox(
                options.policy,
                options.backend.clone(),
                Some(key.to_string()),
            )
            .await?;
        self.record(key, &info.id, &info.backend);
        Ok(Ensured {
            sandbox_id: info.id,
            backend: info.backend,
            created: true,
        })
    }

    /// Forget the cached sandbox for a key without touching the server.
    pub fn purge(&self, key: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn record(&self, key: &str, sandbox_id: &str, backend: &str) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).insert(
            key.to_string(),
            Cached {
                sandbox_id: sandbox_id.to_string(),
                backend: backend.to_string(),
            },
        );
    }

    fn acquire(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let slot = locks.entry(key.to_string()).or_insert_with(|| KeyLock {
            lock: Arc::new(Mutex::new(())),
            refs: 0,
        });
        slot.refs += 1;
        slot.lock.clone()
    }

    fn release(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = locks.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                locks.remove(key);
            }
        }
    }
}

struct ReleaseOnDrop<'a> {
    coalescer: &'a EnsureCoalescer,
    key: &'a str,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.coalescer.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::{SandboxInfo, new_sandbox_id};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::Notify;

    const REF: &str = "ghcr.io/example/base@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn test_policy() -> PolicyDocument {
        PolicyDocument {
            version: 1,
            image_ref: REF.into(),
            image_digest: None,
            network_default: "deny".into(),
            allow: vec![],
            git: None,
        }
    }

    fn options(backend: &str) -> EnsureOptions {
        EnsureOptions {
            policy: test_policy(),
            backend: Some(backend.into()),
            sandbox_id: None,
        }
    }

    /// In-memory control plane: provisioning can be gated, statuses
    /// overridden per sandbox.
    struct FakeApi {
        gate: Option<Arc<Notify>>,
        provisions: AtomicUsize,
        sandboxes: StdMutex<HashMap<String, SandboxInfo>>,
        terminate_gate: Option<Arc<Notify>>,
    }

    impl FakeApi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: None,
                provisions: AtomicUsize::new(0),
                sandboxes: StdMutex::new(HashMap::new()),
                terminate_gate: None,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                gate: Some(gate),
                provisions: AtomicUsize::new(0),
                sandboxes: StdMutex::new(HashMap::new()),
                terminate_gate: None,
            })
        }

        fn set_status(&self, id: &str, status: SandboxStatus) {
            if let Some(info) = self.sandboxes.lock().unwrap().get_mut(id) {
                info.status = status;
            }
        }
    }

    #[async_trait]
    impl SandboxApi for FakeApi {
        async fn create_sandbox(
            &self,
            _policy: PolicyDocument,
            backend: Option<String>,
            ensure_key: Option<String>,
        ) -> Result<SandboxInfo, SandboxError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.provisions.fetch_add(1, Ordering::SeqCst);
            let info = SandboxInfo {
                id: new_sandbox_id(),
                status: SandboxStatus::Ready,
                backend: backend.unwrap_or_else(|| "firecracker".into()),
                policy_hash: "h".repeat(64),
                created_at: Utc::now(),
                ensure_key,
                execution_ids: vec![],
            };
            self.sandboxes
                .lock()
                .unwrap()
                .insert(info.id.clone(), info.clone());
            Ok(info)
        }

        async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError> {
            self.sandboxes
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| SandboxError::NotFound(format!("unknown sandbox {id:?}")))
        }

        async fn terminate_sandbox(&self, id: &str) -> Result<bool, SandboxError> {
            if let Some(gate) = &self.terminate_gate {
                gate.notified().await;
            }
            self.set_status(id, SandboxStatus::Stopped);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn repeated_ensure_reuses_ready_sandbox() {
        let api = FakeApi::new();
        let coalescer = EnsureCoalescer::new(api.clone());

        let first = coalescer
            .ensure("thread:main", options("firecracker"))
            .await
            .unwrap();
        assert!(first.created);

        let second = coalescer
            .ensure("thread:main", options("firecracker"))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.sandbox_id, first.sandbox_id);
        assert_eq!(api.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_ensures_coalesce_to_one_provision() {
        let gate = Arc::new(Notify::new());
        let api = FakeApi::gated(gate.clone());
        let coalescer = Arc::new(EnsureCoalescer::new(api.clone()));

        let first = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .ensure("thread:shared", options("firecracker"))
                    .await
            })
        };
        let second = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .ensure("thread:shared", options("firecracker"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Exactly one call is blocked inside provisioning; the other
        // is parked on the key lock.
        assert_eq!(api.provisions.load(Ordering::SeqCst), 0);
        gate.notify_one();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a.sandbox_id, b.sandbox_id);
        assert_eq!(api.provisions.load(Ordering::SeqCst), 1);
        assert!(a.created != b.created, "exactly one caller created");
    }

    #[tokio::test]
    async fn waiting_for_the_key_lock_honors_cancellation() {
        let gate = Arc::new(Notify::new());
        let api = FakeApi::gated(gate.clone());
        let coalescer = Arc::new(EnsureCoalescer::new(api.clone()));

        let holder = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .ensure("thread:held", options("firecracker"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            coalescer.ensure("thread:held", options("firecracker")),
        )
        .await;
        assert!(result.is_err(), "second caller timed out waiting");
        assert!(started.elapsed() <= Duration::from_millis(750));
        // The canceled waiter never reached provisioning.
        assert_eq!(api.provisions.load(Ordering::SeqCst), 0);

        gate.notify_one();
        holder.await.unwrap().unwrap();
        assert_eq!(api.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_sandbox_is_replaced() {
        let api = FakeApi::new();
        let coalescer = EnsureCoalescer::new(api.clone());

        let first = coalescer
            .ensure("thread:term", options("firecracker"))
            .await
            .unwrap();
        api.terminate_sandbox(&first.sandbox_id).await.unwrap();

        let second = coalescer
            .ensure("thread:term", options("firecracker"))
            .await
            .unwrap();
        assert!(second.created);
        assert_ne!(second.sandbox_id, first.sandbox_id);
    }

    #[tokio::test]
    async fn stopping_sandbox_is_replaced_while_terminate_in_flight() {
        let terminate_gate = Arc::new(Notify::new());
        let api = Arc::new(FakeApi {
            gate: None,
            provisions: AtomicUsize::new(0),
            sandboxes: StdMutex::new(HashMap::new()),
            terminate_gate: Some(terminate_gate.clone()),
        });
        let coalescer = Arc::new(EnsureCoalescer::new(api.clone()));

        let first = coalescer
            .ensure("thread:stopping", options("firecracker"))
            .await
            .unwrap();

        // Terminate blocks in the adapter; the sandbox reports
        // STOPPING meanwhile.
        api.set_status(&first.sandbox_id, SandboxStatus::Stopping);
        let terminate = {
            let api = api.clone();
            let id = first.sandbox_id.clone();
            tokio::spawn(async move { api.terminate_sandbox(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = coalescer
            .ensure("thread:stopping", options("firecracker"))
            .await
            .unwrap();
        assert!(second.created);
        assert_ne!(second.sandbox_id, first.sandbox_id);

        terminate_gate.notify_one();
        terminate.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn vanished_sandbox_is_replaced() {
        let api = FakeApi::new();
        let coalescer = EnsureCoalescer::new(api.clone());

        let first = coalescer
            .ensure("thread:gone", options("firecracker"))
            .await
            .unwrap();
        api.sandboxes.lock().unwrap().remove(&first.sandbox_id);

        let second = coalescer
            .ensure("thread:gone", options("firecracker"))
            .await
            .unwrap();
        assert!(second.created);
        assert_ne!(second.sandbox_id, first.sandbox_id);
    }

    #[tokio::test]
    async fn backend_switch_creates_a_new_sandbox() {
        let api = FakeApi::new();
        let coalescer = EnsureCoalescer::new(api.clone());

        let first = coalescer
            .ensure("thread:backend-switch", options("firecracker"))
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.backend, "firecracker");

        let second = coalescer
            .ensure("thread:backend-switch", options("darwin-vz"))
            .await
            .unwrap();
        assert!(second.created);
        assert_ne!(second.sandbox_id, first.sandbox_id);
        assert_eq!(second.backend, "darwin-vz");
    }

    #[tokio::test]
    async fn supplied_sandbox_id_is_adopted() {
        let api = FakeApi::new();
        let coalescer = EnsureCoalescer::new(api.clone());

        let adopted = coalescer
            .ensure(
                "thread:adopt",
                EnsureOptions {
                    policy: test_policy(),
                    backend: Some("firecracker".into()),
                    sandbox_id: Some("sbx_preexisting".into()),
                },
            )
            .await
            .unwrap();
        assert!(!adopted.created);
        assert_eq!(adopted.sandbox_id, "sbx_preexisting");
        assert_eq!(api.provisions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn key_locks_are_released_and_collected() {
        let api = FakeApi::new();
        let coalescer = EnsureCoalescer::new(api);
        coalescer
            .ensure("thread:cleanup", options("firecracker"))
            .await
            .unwrap();
        assert!(coalescer.locks.lock().unwrap().is_empty());
        // The cache survives lock collection.
        assert!(coalescer.cache.lock().unwrap().contains_key("thread:cleanup"));
    }
}
