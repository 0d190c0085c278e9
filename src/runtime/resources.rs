//! Managed Resource Registry
//!
//! Every data-access object that owns a native handle registers here when it
//! is created. At request teardown the registry is drained exactly once and
//! each entry receives one `cleanup()` call, in no particular order. Cleanup
//! must be idempotent: the script may already have closed the object.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub trait ManagedResource: Send + Sync {
    /// Releases the native handle; safe to call more than once
    fn cleanup(&self);

    fn resource_kind(&self) -> &'static str;
}

#[derive(Default)]
pub struct ResourceRegistry {
    resources: Mutex<Vec<Arc<dyn ManagedResource>>>,
    drained: AtomicBool,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a resource. After the drain a late registration is cleaned
    /// up immediately.
    pub fn register(&self, resource: Arc<dyn ManagedResource>) {
        if self.drained.load(Ordering::Acquire) {
            warn!(kind = resource.resource_kind(), "resource registered after teardown");
            run_cleanup(resource.as_ref());
            return;
        }
        self.resources.lock().push(resource);
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Cleans up every registered resource once; later calls do nothing.
    /// Returns the number of resources cleaned.
    pub fn drain(&self) -> usize {
        if self.drained.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let resources = std::mem::take(&mut *self.resources.lock());
        for resource in &resources {
            run_cleanup(resource.as_ref());
        }
        debug!(count = resources.len(), "resource registry drained");
        resources.len()
    }
}

/// A panicking cleanup must not stop the rest of the sweep
fn run_cleanup(resource: &dyn ManagedResource) {
    if catch_unwind(AssertUnwindSafe(|| resource.cleanup())).is_err() {
        warn!(kind = resource.resource_kind(), "cleanup panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Tracked {
        calls: AtomicUsize,
    }

    impl ManagedResource for Tracked {
        fn cleanup(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn resource_kind(&self) -> &'static str {
            "tracked"
        }
    }

    struct Exploding;

    impl ManagedResource for Exploding {
        fn cleanup(&self) {
            panic!("boom");
        }

        fn resource_kind(&self) -> &'static str {
            "exploding"
        }
    }

    #[test]
    fn test_drain_once() {
        let registry = ResourceRegistry::new();
        let tracked = Arc::new(Tracked::default());
        registry.register(tracked.clone());
        registry.register(tracked.clone());
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.drain(), 2);
        assert_eq!(registry.drain(), 0);
        assert_eq!(tracked.calls.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panicking_cleanup_does_not_stop_sweep() {
        let registry = ResourceRegistry::new();
        let tracked = Arc::new(Tracked::default());
        registry.register(Arc::new(Exploding));
        registry.register(tracked.clone());
        registry.drain();
        assert_eq!(tracked.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_cleans_immediately() {
        let registry = ResourceRegistry::new();
        registry.drain();
        let tracked = Arc::new(Tracked::default());
        registry.register(tracked.clone());
        assert_eq!(tracked.calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
