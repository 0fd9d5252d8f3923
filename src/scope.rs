//! Host scopes
//!
//! A scope is any unit of liveness that can tell the bus when it ends: a
//! UI component, a worker, a connection. The bus only needs a stable
//! identity and a one-shot end callback.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Stable identity of a scope, also the default subscriber key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback run when a scope ends
pub type ScopeEndCallback = Box<dyn FnOnce() + Send>;

/// Host collaborator bounding the life of subscriptions
///
/// Implementations must invoke every registered callback exactly once when
/// the scope terminates, and immediately if it has already terminated.
pub trait Scope {
    fn scope_id(&self) -> ScopeId;

    fn on_end(&self, callback: ScopeEndCallback);
}

#[derive(Default)]
struct ScopeState {
    ended: bool,
    callbacks: Vec<ScopeEndCallback>,
}

/// Scope ended explicitly by its owner
///
/// Clones share the same state, so one clone can be handed to the bus while
/// another ends it.
#[derive(Clone)]
pub struct ManualScope {
    id: ScopeId,
    state: Arc<Mutex<ScopeState>>,
}

impl ManualScope {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ScopeId::new(id),
            state: Arc::new(Mutex::new(ScopeState::default())),
        }
    }

    /// End the scope, running registered callbacks; later calls do nothing
    pub fn end(&self) {
        let callbacks = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.ended {
                return;
            }
            state.ended = true;
            std::mem::take(&mut state.callbacks)
        };
        tracing::debug!(scope = %self.id, callbacks = callbacks.len(), "Scope ended");
        for callback in callbacks {
            callback();
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().map(|s| s.ended).unwrap_or(true)
    }
}

impl fmt::Debug for ManualScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScope")
            .field("id", &self.id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Scope for ManualScope {
    fn scope_id(&self) -> ScopeId {
        self.id.clone()
    }

    fn on_end(&self, callback: ScopeEndCallback) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.ended {
                state.callbacks.push(callback);
                return;
            }
        }
        callback();
    }
}
