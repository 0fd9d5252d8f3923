//! Subscription lifecycle manager
//!
//! Tracks which subscriptions belong to which scope so that a scope's end
//! signal can purge all of them. Only one end callback is registered per
//! live scope; the bus owns the callback and calls back into
//! [`LifecycleManager::release`].

use crate::error::{EventError, Result};
use crate::scope::ScopeId;
use crate::types::Subscription;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub(crate) struct LifecycleManager {
    bound: Mutex<HashMap<ScopeId, Vec<Subscription>>>,
}

impl LifecycleManager {
    /// Track `subscription` under `scope`
    ///
    /// Returns true when this is the scope's first tracked subscription,
    /// i.e. when the caller must register an end callback.
    pub fn bind(&self, scope: &ScopeId, subscription: Subscription) -> Result<bool> {
        let mut bound = self.lock()?;
        let first = !bound.contains_key(scope);
        bound.entry(scope.clone()).or_default().push(subscription);
        Ok(first)
    }

    /// Stop tracking a scope, returning its subscriptions
    pub fn release(&self, scope: &ScopeId) -> Result<Vec<Subscription>> {
        Ok(self.lock()?.remove(scope).unwrap_or_default())
    }

    /// Stop tracking one subscription
    ///
    /// The scope entry itself stays until the scope ends, because its end
    /// callback is already registered.
    pub fn forget(&self, scope: &ScopeId, subscription_id: u64) -> Result<()> {
        if let Some(subs) = self.lock()?.get_mut(scope) {
            subs.retain(|s| s.id != subscription_id);
        }
        Ok(())
    }

    pub fn bound_scopes(&self) -> usize {
        self.bound.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn clear(&self) -> Result<()> {
        for subs in self.lock()?.values_mut() {
            subs.clear();
        }
        Ok(())
    }

    /// Leave the bindings lock poisoned, as a panicking holder would
    #[cfg(test)]
    pub fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.bound.lock();
            panic!("lifecycle bindings poisoned");
        }));
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ScopeId, Vec<Subscription>>>> {
        self.bound
            .lock()
            .map_err(|e| EventError::Lock(format!("lifecycle bindings: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, SubscriberKey};

    fn sub(id: u64, scope: &ScopeId) -> Subscription {
        Subscription {
            id,
            event_type: EventType::key("test"),
            key: SubscriberKey::from(scope),
            channels: vec![false, true],
            scope: Some(scope.clone()),
        }
    }

    #[test]
    fn test_bind_reports_first_subscription_only() {
        let lm = LifecycleManager::default();
        let scope = ScopeId::new("screen");
        assert!(lm.bind(&scope, sub(1, &scope)).unwrap());
        assert!(!lm.bind(&scope, sub(2, &scope)).unwrap());
        assert_eq!(lm.bound_scopes(), 1);
    }

    #[test]
    fn test_release_returns_all_and_forgets_scope() {
        let lm = LifecycleManager::default();
        let scope = ScopeId::new("screen");
        lm.bind(&scope, sub(1, &scope)).unwrap();
        lm.bind(&scope, sub(2, &scope)).unwrap();
        let released = lm.release(&scope).unwrap();
        assert_eq!(released.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(lm.release(&scope).unwrap().is_empty());
        assert_eq!(lm.bound_scopes(), 0);
    }

    #[test]
    fn test_forget_keeps_scope_entry() {
        let lm = LifecycleManager::default();
        let scope = ScopeId::new("screen");
        lm.bind(&scope, sub(1, &scope)).unwrap();
        lm.forget(&scope, 1).unwrap();
        lm.forget(&scope, 1).unwrap();
        // Callback already registered: a new bind must not ask for another
        assert!(!lm.bind(&scope, sub(3, &scope)).unwrap());
        assert_eq!(lm.release(&scope).unwrap().len(), 1);
    }

    #[test]
    fn test_poisoned_bindings_are_lock_errors() {
        let lm = LifecycleManager::default();
        let scope = ScopeId::new("screen");
        lm.poison();
        assert!(matches!(lm.bind(&scope, sub(1, &scope)), Err(EventError::Lock(_))));
    }
}
