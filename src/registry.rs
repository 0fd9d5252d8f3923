//! Channel registry
//!
//! Resolves `(EventType, sticky)` to its channel, creating channels on
//! demand. Live channels live in a capacity-bounded store with
//! least-recently-used eviction; sticky channels are never evicted.

use crate::channel::{ErasedChannel, EventChannel};
use crate::error::{EventError, Result};
use crate::types::EventType;
use std::collections::HashMap;
use std::hash::Hash;

/// Default capacity of the live channel store
pub const DEFAULT_CAPACITY: usize = 20;

/// Capacity-bounded map with least-recently-used eviction
///
/// Every entry carries the tick of its last touch; eviction removes the
/// entry with the smallest tick.
pub(crate) struct LruStore<K, V> {
    entries: HashMap<K, (V, u64)>,
    capacity: usize,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> LruStore<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up an entry and mark it most recently used
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        entry.1 = tick;
        Some(&mut entry.0)
    }

    /// Look up an entry without touching it
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|(v, _)| v)
    }

    /// Insert or replace an entry, returning whatever had to be evicted
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(&key) {
            *entry = (value, tick);
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.evict_lru() {
                Some(e) => evicted.push(e),
                None => break,
            }
        }
        self.entries.insert(key, (value, tick));
        evicted
    }

    /// Change the capacity, evicting least-recently-used entries beyond it
    pub fn resize(&mut self, capacity: usize) -> Vec<(K, V)> {
        self.capacity = capacity;
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.evict_lru() {
                Some(e) => evicted.push(e),
                None => break,
            }
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_lru(&mut self) -> Option<(K, V)> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, (_, tick))| *tick)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&oldest).map(|(v, _)| (oldest, v))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Owner of every event channel
///
/// "Touch" for LRU purposes happens on publish, subscribe and consume,
/// i.e. whenever a channel is resolved or consumed through the registry.
pub struct ChannelRegistry {
    live: LruStore<EventType, Box<dyn ErasedChannel>>,
    sticky: HashMap<EventType, Box<dyn ErasedChannel>>,
    /// Event types pinned to one mode
    declared: HashMap<EventType, bool>,
    evictions: u64,
}

impl ChannelRegistry {
    /// Create a registry whose live store holds at most `capacity` channels
    pub fn new(capacity: usize) -> Result<Self> {
        validate_capacity(capacity)?;
        Ok(Self {
            live: LruStore::new(capacity),
            sticky: HashMap::new(),
            declared: HashMap::new(),
            evictions: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.live.capacity()
    }

    /// Resize the live store, keeping the most recently touched channels
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        validate_capacity(capacity)?;
        let evicted = self.live.resize(capacity);
        for (event_type, channel) in &evicted {
            tracing::debug!(
                event_type = %event_type,
                subscribers = channel.subscriber_count(),
                "Live channel evicted by resize"
            );
        }
        self.evictions += evicted.len() as u64;
        tracing::info!(capacity, evicted = evicted.len(), "Live channel capacity changed");
        Ok(())
    }

    /// Pin an event type to one mode
    ///
    /// Redeclaring the same mode is a no-op; declaring the other mode, or
    /// declaring a mode the event type is already used in the other way, is
    /// a configuration error.
    pub fn declare(&mut self, event_type: &EventType, sticky: bool) -> Result<()> {
        self.check_declared(event_type, sticky)?;
        let existing_other = if sticky {
            self.live.contains_key(event_type)
        } else {
            self.sticky.contains_key(event_type)
        };
        if existing_other {
            return Err(EventError::Config(format!(
                "event type '{}' already has a {} channel",
                event_type,
                mode_name(!sticky)
            )));
        }
        self.declared.insert(event_type.clone(), sticky);
        Ok(())
    }

    /// Resolve the channel for `(event_type, sticky)`, creating it on demand
    pub fn resolve<T: Clone + Send + 'static>(
        &mut self,
        event_type: &EventType,
        sticky: bool,
    ) -> Result<&mut EventChannel<T>> {
        self.check_declared(event_type, sticky)?;

        let slot = if sticky {
            self.sticky.entry(event_type.clone()).or_insert_with(|| {
                tracing::debug!(event_type = %event_type, sticky, "Channel created");
                Box::new(EventChannel::<T>::new(event_type.clone(), true))
            })
        } else {
            if !self.live.contains_key(event_type) {
                tracing::debug!(event_type = %event_type, sticky, "Channel created");
                let channel: Box<dyn ErasedChannel> =
                    Box::new(EventChannel::<T>::new(event_type.clone(), false));
                let evicted = self.live.insert(event_type.clone(), channel);
                self.record_evictions(evicted);
            }
            self.live.get_mut(event_type).ok_or_else(|| {
                EventError::Config(format!("live channel '{}' could not be stored", event_type))
            })?
        };

        let channel = downcast::<T>(slot.as_mut())?;
        channel.ensure_mode(sticky)?;
        Ok(channel)
    }

    /// Existing channel for `(event_type, sticky)`, touched but never created
    pub fn get<T: Clone + Send + 'static>(
        &mut self,
        event_type: &EventType,
        sticky: bool,
    ) -> Result<Option<&mut EventChannel<T>>> {
        let slot = if sticky {
            self.sticky.get_mut(event_type)
        } else {
            self.live.get_mut(event_type)
        };
        match slot {
            Some(slot) => downcast::<T>(slot.as_mut()).map(Some),
            None => Ok(None),
        }
    }

    /// Mode an event type is pinned to, if declared
    pub fn declared(&self, event_type: &EventType) -> Option<bool> {
        self.declared.get(event_type).copied()
    }

    pub fn contains(&self, event_type: &EventType, sticky: bool) -> bool {
        if sticky {
            self.sticky.contains_key(event_type)
        } else {
            self.live.contains_key(event_type)
        }
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn sticky_len(&self) -> usize {
        self.sticky.len()
    }

    /// Live channels evicted so far
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Drop every channel, sticky ones included
    ///
    /// Mode declarations are configuration and survive.
    pub fn clear(&mut self) {
        let live = self.live.len();
        let sticky = self.sticky.len();
        self.live.clear();
        self.sticky.clear();
        tracing::info!(live, sticky, "Channel registry cleared");
    }

    /// Type-erased access for broadcast and unsubscribe
    ///
    /// `touch` marks a live channel most recently used.
    pub(crate) fn erased_mut(
        &mut self,
        event_type: &EventType,
        sticky: bool,
        touch: bool,
    ) -> Option<&mut Box<dyn ErasedChannel>> {
        if sticky {
            self.sticky.get_mut(event_type)
        } else if touch {
            self.live.get_mut(event_type)
        } else {
            self.live.peek_mut(event_type)
        }
    }

    fn check_declared(&self, event_type: &EventType, sticky: bool) -> Result<()> {
        match self.declared.get(event_type) {
            Some(&declared) if declared != sticky => Err(EventError::Config(format!(
                "event type '{}' is declared {} and cannot be used as {}",
                event_type,
                mode_name(declared),
                mode_name(sticky)
            ))),
            _ => Ok(()),
        }
    }

    fn record_evictions(&mut self, evicted: Vec<(EventType, Box<dyn ErasedChannel>)>) {
        for (event_type, channel) in &evicted {
            tracing::debug!(
                event_type = %event_type,
                subscribers = channel.subscriber_count(),
                "Least recently used live channel evicted"
            );
        }
        self.evictions += evicted.len() as u64;
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self {
            live: LruStore::new(DEFAULT_CAPACITY),
            sticky: HashMap::new(),
            declared: HashMap::new(),
            evictions: 0,
        }
    }
}

fn downcast<T: Clone + Send + 'static>(
    channel: &mut dyn ErasedChannel,
) -> Result<&mut EventChannel<T>> {
    if !channel.as_any().is::<EventChannel<T>>() {
        return Err(EventError::Config(format!(
            "event type '{}' carries {} and cannot be used with {}",
            channel.event_type(),
            channel.payload_type(),
            std::any::type_name::<T>()
        )));
    }
    channel
        .as_any_mut()
        .downcast_mut::<EventChannel<T>>()
        .ok_or_else(|| {
            EventError::Config(format!(
                "channel downcast to {} failed",
                std::any::type_name::<T>()
            ))
        })
}

fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        return Err(EventError::Config(
            "Live channel capacity must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn mode_name(sticky: bool) -> &'static str {
    if sticky {
        "sticky"
    } else {
        "live"
    }
}
