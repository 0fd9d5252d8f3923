//! # a3s-live-event
//!
//! In-process typed event bus with live and sticky channels for the A3S
//! ecosystem.
//!
//! ## Overview
//!
//! `a3s-live-event` delivers each publication to each subscriber at most
//! once. Live channels deliver only what is published after a subscriber
//! joined; sticky channels keep the latest value and replay it once to every
//! new subscriber. Publishing from any thread is safe: publications made off
//! the delivery context are queued and coalesced per channel until the
//! delivery context drains them.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_live_event::{EventBus, Handler, ManualScope, SubscribeOptions};
//! use std::sync::{Arc, Mutex};
//!
//! #[derive(Clone)]
//! struct Theme(&'static str);
//!
//! # fn main() -> a3s_live_event::Result<()> {
//! let bus = EventBus::new();
//!
//! // Sticky: remembered and replayed to later subscribers
//! bus.publish(Theme("dark"), true)?;
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! let screen = ManualScope::new("settings-screen");
//! bus.subscribe(
//!     &screen,
//!     SubscribeOptions::default(),
//!     Handler::value(move |theme: Theme| sink.lock().unwrap().push(theme.0)),
//! )?;
//! assert_eq!(*seen.lock().unwrap(), vec!["dark"]);
//!
//! // Ending the scope removes its subscriptions
//! screen.end();
//! bus.publish(Theme("light"), false)?;
//! assert_eq!(seen.lock().unwrap().len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **EventChannel**: latest publication plus one pending marker per
//!   subscriber key
//! - **ChannelRegistry**: LRU-bounded live channels, unbounded sticky channels
//! - **EventBus**: publish, subscribe and delivery-context management
//! - **Scope**: host collaborator whose end purges subscriptions

pub mod bus;
pub mod channel;
pub mod config;
mod dispatcher;
pub mod error;
pub mod handler;
mod lifecycle;
pub mod primitive;
pub mod registry;
pub mod scope;
pub mod types;

// Re-export core types
pub use bus::EventBus;
pub use channel::{EventChannel, Pending, PendingKind, SubscriberState};
pub use config::{BusConfig, DispatchMode};
pub use error::{EventError, Result};
pub use handler::{Handler, HandlerKind};
pub use primitive::{PrimitiveKind, PrimitiveValue};
pub use registry::{ChannelRegistry, DEFAULT_CAPACITY};
pub use scope::{ManualScope, Scope, ScopeEndCallback, ScopeId};
pub use types::{
    BusStats, ChannelMode, Delivery, EventType, SubscribeOptions, SubscriberKey, Subscription,
};
