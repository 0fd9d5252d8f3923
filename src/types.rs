//! Core types shared by channels, the registry and the bus
//!
//! Serializable types use camelCase JSON names.

use crate::scope::ScopeId;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt;

/// Identifier of an event channel
///
/// Typed events are keyed by their Rust type; primitive and ad-hoc events
/// are keyed by an explicit name. One `EventType` owns at most one live and
/// one sticky channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Channel keyed by a payload type
    Type { id: TypeId, name: &'static str },
    /// Channel keyed by an explicit name
    Key(String),
}

impl EventType {
    /// Event type derived from the payload type `T`
    pub fn of<T: 'static>() -> Self {
        EventType::Type {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Event type with an explicit name
    pub fn key(key: impl Into<String>) -> Self {
        EventType::Key(key.into())
    }

    /// Human-readable name used in logs and errors
    pub fn name(&self) -> &str {
        match self {
            EventType::Type { name, .. } => name,
            EventType::Key(key) => key,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity under which a subscriber consumes publications
///
/// Every publication is consumed at most once per key, however many
/// callbacks are registered under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberKey(String);

impl SubscriberKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Fresh key for a subscription that has no scope
    pub fn synthesize() -> Self {
        Self(format!("forever-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for SubscriberKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&ScopeId> for SubscriberKey {
    fn from(scope: &ScopeId) -> Self {
        Self::new(scope.as_str())
    }
}

/// What a subscriber's callback receives
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    /// A real payload
    Value(T),
    /// An explicitly published null
    Null,
    /// A zero-payload call signal
    Call,
}

impl<T> Delivery<T> {
    /// Short name used in type-mismatch errors
    pub fn kind(&self) -> &'static str {
        match self {
            Delivery::Value(_) => "value",
            Delivery::Null => "null",
            Delivery::Call => "call",
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Delivery::Call)
    }

    /// The payload, if this delivery carries one
    pub fn value(self) -> Option<T> {
        match self {
            Delivery::Value(v) => Some(v),
            Delivery::Null | Delivery::Call => None,
        }
    }
}

/// Which channels of an event type a subscription observes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelMode {
    /// Only publications made with `sticky = false`
    Live,
    /// Only publications made with `sticky = true`
    Sticky,
    /// Both channels
    #[default]
    Both,
}

impl ChannelMode {
    /// Sticky flags of the channels this mode covers, live first
    pub fn channels(self) -> &'static [bool] {
        match self {
            ChannelMode::Live => &[false],
            ChannelMode::Sticky => &[true],
            ChannelMode::Both => &[false, true],
        }
    }
}

/// Options for creating a subscription
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Explicit subscriber key
    ///
    /// Defaults to the scope identity, or a synthesized key for scope-less
    /// subscriptions. Use distinct keys for independent subscriptions from
    /// the same scope.
    pub key: Option<String>,

    /// Channels to observe
    pub mode: ChannelMode,

    /// Whether the subscriber is active immediately
    ///
    /// Inactive subscribers are skipped by live publications and receive
    /// sticky replays only once activated.
    pub active: bool,

    /// Channel to observe instead of the one derived from the payload type
    pub event_type: Option<EventType>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            key: None,
            mode: ChannelMode::Both,
            active: true,
            event_type: None,
        }
    }
}

impl SubscribeOptions {
    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn mode(mut self, mode: ChannelMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }
}

/// Handle returned by a successful subscribe
///
/// Unsubscribing twice, or after the scope ended, is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) event_type: EventType,
    pub(crate) key: SubscriberKey,
    pub(crate) channels: Vec<bool>,
    pub(crate) scope: Option<ScopeId>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn key(&self) -> &SubscriberKey {
        &self.key
    }

    /// Scope this subscription is bound to, `None` for forever subscriptions
    pub fn scope(&self) -> Option<&ScopeId> {
        self.scope.as_ref()
    }

    pub fn observes_sticky(&self) -> bool {
        self.channels.contains(&true)
    }

    pub fn observes_live(&self) -> bool {
        self.channels.contains(&false)
    }
}

/// Bus status information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    /// Live channels currently held by the bounded store
    pub live_channels: usize,
    /// Sticky channels currently held
    pub sticky_channels: usize,
    /// Capacity of the live store
    pub capacity: usize,
    /// Live channels evicted since creation
    pub evictions: u64,
    /// Publishes waiting for the delivery context
    pub queued: usize,
    /// Off-context publishes replaced by a later one before delivery
    pub coalesced: u64,
    /// Scopes with an end callback registered
    pub scopes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Login;

    #[test]
    fn test_event_type_of_is_stable() {
        assert_eq!(EventType::of::<Login>(), EventType::of::<Login>());
        assert_ne!(EventType::of::<Login>(), EventType::of::<u32>());
        assert!(EventType::of::<Login>().name().ends_with("Login"));
    }

    #[test]
    fn test_event_type_key_display() {
        let et = EventType::key("user.logged_in");
        assert_eq!(et.to_string(), "user.logged_in");
        assert_ne!(et, EventType::key("user.logged_out"));
    }

    #[test]
    fn test_synthesized_keys_are_unique() {
        let a = SubscriberKey::synthesize();
        let b = SubscriberKey::synthesize();
        assert!(a.as_str().starts_with("forever-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_delivery_helpers() {
        assert_eq!(Delivery::Value(3).kind(), "value");
        assert_eq!(Delivery::<u8>::Null.kind(), "null");
        assert!(Delivery::<u8>::Call.is_call());
        assert_eq!(Delivery::Value(3).value(), Some(3));
        assert_eq!(Delivery::<u8>::Call.value(), None);
    }

    #[test]
    fn test_channel_mode_channels() {
        assert_eq!(ChannelMode::Live.channels(), &[false]);
        assert_eq!(ChannelMode::Sticky.channels(), &[true]);
        assert_eq!(ChannelMode::default().channels(), &[false, true]);
    }

    #[test]
    fn test_subscribe_options_builders() {
        let opts = SubscribeOptions::default()
            .keyed("panel-a")
            .mode(ChannelMode::Sticky)
            .inactive();
        assert_eq!(opts.key.as_deref(), Some("panel-a"));
        assert_eq!(opts.mode, ChannelMode::Sticky);
        assert!(!opts.active);
        assert!(opts.event_type.is_none());
    }

    #[test]
    fn test_bus_stats_serialization() {
        let stats = BusStats {
            live_channels: 2,
            capacity: 20,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"liveChannels\":2"));
        assert!(json.contains("\"capacity\":20"));
    }
}
