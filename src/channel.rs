//! Event channel: the per-subscriber delivery state machine
//!
//! A channel keeps the latest publication for one `(EventType, sticky)`
//! pair and one `SubscriberState` per subscriber key. The broadcast that
//! follows every publish invokes every registered callback; whether a
//! callback actually receives anything is decided here, by the key's
//! pending marker, so each publication reaches each key at most once no
//! matter how often the broadcast fires.
//!
//! Rules:
//! - live channels never replay: a key only becomes pending for
//!   publications made while it is active
//! - sticky channels replay the latest value once to each newly
//!   registered key, and a call signal once to each key whose call
//!   checkpoint lags behind the channel's call counter
//! - consuming a marker resets it to `Unset` in the same step

use crate::error::{EventError, Result};
use crate::handler::SharedHandler;
use crate::types::{Delivery, EventType, SubscriberKey};
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Unconsumed delivery owed to one subscriber key
#[derive(Debug, Clone, PartialEq)]
pub enum Pending<T> {
    Unset,
    Value(T),
    Null,
    Call,
}

/// Payload-free view of a [`Pending`] marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Unset,
    Value,
    Null,
    Call,
}

impl<T> Pending<T> {
    pub fn kind(&self) -> PendingKind {
        match self {
            Pending::Unset => PendingKind::Unset,
            Pending::Value(_) => PendingKind::Value,
            Pending::Null => PendingKind::Null,
            Pending::Call => PendingKind::Call,
        }
    }

    fn into_delivery(self) -> Option<Delivery<T>> {
        match self {
            Pending::Unset => None,
            Pending::Value(v) => Some(Delivery::Value(v)),
            Pending::Null => Some(Delivery::Null),
            Pending::Call => Some(Delivery::Call),
        }
    }
}

/// Consumption bookkeeping for one subscriber key
#[derive(Debug)]
pub struct SubscriberState<T> {
    key: SubscriberKey,
    pending: Pending<T>,
    call_checkpoint: u64,
    active: bool,
    refs: usize,
}

impl<T> SubscriberState<T> {
    fn new(key: SubscriberKey, pending: Pending<T>) -> Self {
        Self {
            key,
            pending,
            call_checkpoint: 0,
            active: false,
            refs: 0,
        }
    }

    pub fn key(&self) -> &SubscriberKey {
        &self.key
    }

    pub fn pending(&self) -> PendingKind {
        self.pending.kind()
    }

    /// Call counter value this key last consumed
    pub fn call_checkpoint(&self) -> u64 {
        self.call_checkpoint
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

struct ObserverSlot<T> {
    id: u64,
    key: SubscriberKey,
    handler: SharedHandler<T>,
    /// Key state from before this attach, held until the attach is settled
    before: Option<KeySnapshot<T>>,
}

struct KeySnapshot<T> {
    /// Marker, call checkpoint and active flag; `None` when the key was new
    state: Option<(Pending<T>, u64, bool)>,
    publications: u64,
}

/// Latest value and subscriber bookkeeping for one `(EventType, sticky)` pair
pub struct EventChannel<T> {
    event_type: EventType,
    sticky: bool,
    current: Option<T>,
    /// `None` until the first publication
    last_is_call: Option<bool>,
    call_count: u64,
    publications: u64,
    subscribers: HashMap<SubscriberKey, SubscriberState<T>>,
    observers: Vec<ObserverSlot<T>>,
}

impl<T: Clone> EventChannel<T> {
    pub fn new(event_type: EventType, sticky: bool) -> Self {
        Self {
            event_type,
            sticky,
            current: None,
            last_is_call: None,
            call_count: 0,
            publications: 0,
            subscribers: HashMap::new(),
            observers: Vec::new(),
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Latest published payload, `None` after a null or call publication
    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Whether the latest publication was a call signal
    pub fn last_is_call(&self) -> Option<bool> {
        self.last_is_call
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn subscriber(&self, key: &SubscriberKey) -> Option<&SubscriberState<T>> {
        self.subscribers.get(key)
    }

    /// Fail if the channel is asked to act in the other mode
    pub fn ensure_mode(&self, sticky: bool) -> Result<()> {
        if self.sticky == sticky {
            return Ok(());
        }
        Err(EventError::Config(format!(
            "channel for event type '{}' is {} and cannot be used as {}",
            self.event_type,
            mode_name(self.sticky),
            mode_name(sticky)
        )))
    }

    /// Record a publication and mark every eligible key pending
    ///
    /// `value` is ignored for call signals. Inactive keys are skipped on
    /// live channels.
    pub fn publish(&mut self, value: Option<T>, is_call: bool) {
        if is_call {
            self.call_count += 1;
            self.current = None;
        } else {
            self.current = value;
        }
        self.last_is_call = Some(is_call);
        self.publications += 1;

        let current = &self.current;
        for state in self.subscribers.values_mut() {
            if !self.sticky && !state.active {
                continue;
            }
            state.pending = if is_call {
                Pending::Call
            } else {
                match current {
                    Some(v) => Pending::Value(v.clone()),
                    None => Pending::Null,
                }
            };
        }
    }

    /// Register one more reference to `key` and return what it is owed
    ///
    /// A key that already has state keeps its marker, so a value consumed
    /// under this key is never replayed to it again.
    pub fn subscribe(&mut self, key: &SubscriberKey, active: bool) -> PendingKind {
        let sticky = self.sticky;
        let state = match self.subscribers.entry(key.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let initial = replay_for(sticky, self.last_is_call, &self.current);
                e.insert(SubscriberState::new(key.clone(), initial))
            }
        };
        state.refs += 1;
        if active {
            state.active = true;
        }

        if sticky && self.last_is_call == Some(true) && state.call_checkpoint < self.call_count {
            state.pending = Pending::Call;
        }
        state.pending.kind()
    }

    /// Mark a key active; returns false for unknown keys
    pub fn activate(&mut self, key: &SubscriberKey) -> bool {
        match self.subscribers.get_mut(key) {
            Some(state) => {
                state.active = true;
                true
            }
            None => false,
        }
    }

    /// Take what `key` is owed, resetting its marker
    ///
    /// Returns `None` for unknown or inactive keys and for keys with nothing
    /// pending.
    pub fn consume(&mut self, key: &SubscriberKey) -> Option<Delivery<T>> {
        let state = self.subscribers.get_mut(key)?;
        if !state.active {
            return None;
        }
        let pending = std::mem::replace(&mut state.pending, Pending::Unset);
        if matches!(pending, Pending::Call) {
            state.call_checkpoint = self.call_count;
        }
        pending.into_delivery()
    }

    /// Drop a key and every callback registered under it
    pub fn unsubscribe(&mut self, key: &SubscriberKey) -> bool {
        self.observers.retain(|o| &o.key != key);
        self.subscribers.remove(key).is_some()
    }

    pub(crate) fn attach(
        &mut self,
        observer_id: u64,
        key: SubscriberKey,
        handler: SharedHandler<T>,
        active: bool,
    ) -> PendingKind {
        let before = KeySnapshot {
            state: self
                .subscribers
                .get(&key)
                .map(|s| (s.pending.clone(), s.call_checkpoint, s.active)),
            publications: self.publications,
        };
        let pending = self.subscribe(&key, active);
        self.observers.push(ObserverSlot {
            id: observer_id,
            key,
            handler,
            before: Some(before),
        });
        pending
    }

    /// Keep an attach for good, dropping its undo state
    pub(crate) fn commit(&mut self, observer_id: u64) {
        if let Some(slot) = self.observers.iter_mut().find(|o| o.id == observer_id) {
            slot.before = None;
        }
    }

    /// Detach an uncommitted callback and put its key back as the attach
    /// found it
    ///
    /// The marker and call checkpoint are restored only when nothing was
    /// published since the attach; a newer publication stays owed.
    pub(crate) fn rollback(&mut self, observer_id: u64) -> bool {
        let Some(pos) = self.observers.iter().position(|o| o.id == observer_id) else {
            return false;
        };
        let before = self.observers[pos].before.take();
        let key = self.observers[pos].key.clone();
        self.detach(observer_id);

        let Some(KeySnapshot {
            state: Some((pending, checkpoint, active)),
            publications,
        }) = before
        else {
            return true;
        };
        if let Some(state) = self.subscribers.get_mut(&key) {
            if publications == self.publications {
                state.pending = pending;
                state.call_checkpoint = checkpoint;
            }
            state.active = active;
        }
        true
    }

    /// Remove one callback; the key's state goes with its last callback
    pub(crate) fn detach(&mut self, observer_id: u64) -> bool {
        let Some(pos) = self.observers.iter().position(|o| o.id == observer_id) else {
            return false;
        };
        let slot = self.observers.remove(pos);
        if let Entry::Occupied(mut e) = self.subscribers.entry(slot.key) {
            let state = e.get_mut();
            state.refs = state.refs.saturating_sub(1);
            if state.refs == 0 {
                e.remove();
            }
        }
        true
    }

    fn observer_key(&self, observer_id: u64) -> Option<&SubscriberKey> {
        self.observers
            .iter()
            .find(|o| o.id == observer_id)
            .map(|o| &o.key)
    }
}

fn replay_for<T: Clone>(sticky: bool, last_is_call: Option<bool>, current: &Option<T>) -> Pending<T> {
    if !sticky {
        return Pending::Unset;
    }
    match (last_is_call, current) {
        (Some(false), Some(v)) => Pending::Value(v.clone()),
        (Some(false), None) => Pending::Null,
        _ => Pending::Unset,
    }
}

fn mode_name(sticky: bool) -> &'static str {
    if sticky {
        "sticky"
    } else {
        "live"
    }
}

/// Deferred callback invocation produced by consuming a marker
pub(crate) type PreparedDelivery = Box<dyn FnOnce() -> Result<()>>;

/// Type-erased channel as held by the registry
pub(crate) trait ErasedChannel: Send {
    fn event_type(&self) -> &EventType;
    fn is_sticky(&self) -> bool;
    fn payload_type(&self) -> &'static str;
    fn subscriber_count(&self) -> usize;
    fn observer_ids(&self) -> Vec<u64>;
    /// Consume the marker of the observer's key and bind the result to its
    /// callback; the callback runs when the returned closure is called
    fn prepare_delivery(&mut self, observer_id: u64) -> Option<PreparedDelivery>;
    fn activate_observer(&mut self, observer_id: u64) -> bool;
    fn detach(&mut self, observer_id: u64) -> bool;
    fn commit(&mut self, observer_id: u64);
    fn rollback(&mut self, observer_id: u64) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Clone + Send + 'static> ErasedChannel for EventChannel<T> {
    fn event_type(&self) -> &EventType {
        &self.event_type
    }

    fn is_sticky(&self) -> bool {
        self.sticky
    }

    fn payload_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn observer_ids(&self) -> Vec<u64> {
        self.observers.iter().map(|o| o.id).collect()
    }

    fn prepare_delivery(&mut self, observer_id: u64) -> Option<PreparedDelivery> {
        let slot = self.observers.iter().find(|o| o.id == observer_id)?;
        let key = slot.key.clone();
        let handler = slot.handler.clone();
        let delivery = self.consume(&key)?;
        let event_type = self.event_type.clone();
        Some(Box::new(move || {
            let mut f = handler.lock().map_err(|e| {
                EventError::Lock(format!("handler for '{}': {}", event_type, e))
            })?;
            (*f)(&event_type, delivery)
        }))
    }

    fn activate_observer(&mut self, observer_id: u64) -> bool {
        match self.observer_key(observer_id).cloned() {
            Some(key) => self.activate(&key),
            None => false,
        }
    }

    fn detach(&mut self, observer_id: u64) -> bool {
        EventChannel::detach(self, observer_id)
    }

    fn commit(&mut self, observer_id: u64) {
        EventChannel::commit(self, observer_id)
    }

    fn rollback(&mut self, observer_id: u64) -> bool {
        EventChannel::rollback(self, observer_id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
