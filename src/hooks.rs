// src/hooks.rs

/// Observer interface for pool lifecycle events.
///
/// All methods have no-op defaults; implement only what you need. Invocations
/// are synchronous from the dispatcher's perspective and happen with no
/// internal locks held, so a hook may call back into the pool — but it must
/// not block the dispatch worker indefinitely.
pub trait DispatchHooks: Send + Sync {
    /// Quota usage crossed the warning threshold for this key. Fires at most
    /// once per key per quota period.
    fn on_warning(&self, key_id: &str, usage_percent: f64) {
        let _ = (key_id, usage_percent);
    }

    /// The increment that first reached the key's quota limit.
    fn on_key_exhausted(&self, key_id: &str) {
        let _ = key_id;
    }

    /// The key's circuit transitioned into open (closed→open or
    /// half-open→open). Not re-fired while the circuit stays open.
    fn on_key_circuit_open(&self, key_id: &str) {
        let _ = key_id;
    }

    /// A request found no eligible key at all. Fires once per such request.
    fn on_all_keys_exhausted(&self) {}
}

/// Default hooks: ignore everything.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl DispatchHooks for NoopHooks {}

// Lets callers keep a handle to their observer after handing it to the pool.
impl<T: DispatchHooks + ?Sized> DispatchHooks for std::sync::Arc<T> {
    fn on_warning(&self, key_id: &str, usage_percent: f64) {
        (**self).on_warning(key_id, usage_percent);
    }

    fn on_key_exhausted(&self, key_id: &str) {
        (**self).on_key_exhausted(key_id);
    }

    fn on_key_circuit_open(&self, key_id: &str) {
        (**self).on_key_circuit_open(key_id);
    }

    fn on_all_keys_exhausted(&self) {
        (**self).on_all_keys_exhausted();
    }
}
