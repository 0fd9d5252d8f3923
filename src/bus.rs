//! High-level event bus
//!
//! `EventBus` ties the channel registry, the dispatcher and the lifecycle
//! manager together. It is cheap to clone; clones share one bus and may be
//! moved to producer threads.

use crate::channel::PendingKind;
use crate::config::{BusConfig, DispatchMode};
use crate::dispatcher::Dispatcher;
use crate::error::{EventError, Result};
use crate::handler::Handler;
use crate::lifecycle::LifecycleManager;
use crate::registry::ChannelRegistry;
use crate::scope::{Scope, ScopeId};
use crate::types::{BusStats, ChannelMode, EventType, SubscribeOptions, SubscriberKey, Subscription};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identity of one channel: an event type in one mode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ChannelKey {
    pub event_type: EventType,
    pub sticky: bool,
}

impl ChannelKey {
    fn new(event_type: EventType, sticky: bool) -> Self {
        Self { event_type, sticky }
    }
}

/// In-process typed event bus with live and sticky channels
///
/// Publishing on the delivery context (the thread that built the bus)
/// delivers synchronously. Publishing from any other thread queues the
/// publication until the delivery context calls [`EventBus::drain`].
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
    config: BusConfig,
    registry: Mutex<ChannelRegistry>,
    dispatcher: Dispatcher<ChannelKey, BusInner>,
    lifecycle: LifecycleManager,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default configuration
    ///
    /// The calling thread becomes the delivery context.
    pub fn new() -> Self {
        Self::from_parts(BusConfig::default(), ChannelRegistry::default(), None)
    }

    /// Create a bus from a validated configuration
    pub fn with_config(config: BusConfig) -> Result<Self> {
        config.validate()?;
        let registry = ChannelRegistry::new(config.capacity)?;
        Ok(Self::from_parts(config, registry, None))
    }

    /// Create a bus that calls `waker` whenever work is queued for the
    /// delivery context while none was pending
    ///
    /// The waker runs on the publishing thread; it should only schedule a
    /// call to [`EventBus::drain`] on the delivery context.
    pub fn with_waker(
        config: BusConfig,
        waker: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let registry = ChannelRegistry::new(config.capacity)?;
        Ok(Self::from_parts(config, registry, Some(Box::new(waker))))
    }

    fn from_parts(
        config: BusConfig,
        registry: ChannelRegistry,
        waker: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        tracing::debug!(
            capacity = config.capacity,
            dispatch = ?config.dispatch,
            "Event bus created"
        );
        Self {
            inner: Arc::new(BusInner {
                config,
                registry: Mutex::new(registry),
                dispatcher: Dispatcher::new(waker),
                lifecycle: LifecycleManager::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Make the calling thread the delivery context
    pub fn bind_current_thread(&self) -> Result<()> {
        self.inner.dispatcher.bind_current_thread()
    }

    pub fn is_delivery_context(&self) -> bool {
        self.inner.dispatcher.is_delivery_context()
    }

    // ─── Publishing ───

    /// Publish a value on the channel of its own type
    pub fn publish<T: Clone + Send + 'static>(&self, value: T, sticky: bool) -> Result<()> {
        self.submit(EventType::of::<T>(), Some(value), false, sticky)
    }

    /// Publish a value or an explicit null on a chosen channel
    pub fn publish_to<T: Clone + Send + 'static>(
        &self,
        event_type: &EventType,
        value: Option<T>,
        sticky: bool,
    ) -> Result<()> {
        self.submit(event_type.clone(), value, false, sticky)
    }

    /// Publish a zero-payload call signal on the channel of `T`
    pub fn publish_call<T: Clone + Send + 'static>(&self, sticky: bool) -> Result<()> {
        self.submit::<T>(EventType::of::<T>(), None, true, sticky)
    }

    /// Publish a zero-payload call signal on a chosen channel carrying `T`
    pub fn publish_call_to<T: Clone + Send + 'static>(
        &self,
        event_type: &EventType,
        sticky: bool,
    ) -> Result<()> {
        self.submit::<T>(event_type.clone(), None, true, sticky)
    }

    fn submit<T: Clone + Send + 'static>(
        &self,
        event_type: EventType,
        value: Option<T>,
        is_call: bool,
        sticky: bool,
    ) -> Result<()> {
        let key = ChannelKey::new(event_type, sticky);
        if self.inner.dispatcher.is_delivery_context() {
            return self.inner.publish_now(&key, value, is_call);
        }
        if self.inner.config.dispatch == DispatchMode::Strict {
            return Err(EventError::threading("publish"));
        }

        // Resolve now so mode and payload conflicts fail on the caller's thread
        self.inner
            .lock_registry()?
            .resolve::<T>(&key.event_type, key.sticky)?;

        let job_key = key.clone();
        let coalesced = self.inner.dispatcher.enqueue(
            key.clone(),
            Box::new(move |inner: &BusInner| inner.publish_now(&job_key, value, is_call)),
        )?;
        if coalesced {
            tracing::debug!(
                event_type = %key.event_type,
                sticky = key.sticky,
                "Queued publish replaced by a newer one"
            );
        }
        Ok(())
    }

    // ─── Subscribing ───

    /// Subscribe `handler` for as long as `scope` lives
    ///
    /// The subscriber key defaults to the scope's identity. A sticky replay
    /// owed to the new subscriber is delivered before this returns; if that
    /// delivery fails the subscription is undone and the error returned.
    pub fn subscribe<T: Clone + Send + 'static>(
        &self,
        scope: &dyn Scope,
        options: SubscribeOptions,
        handler: Handler<T>,
    ) -> Result<Subscription> {
        self.inner.dispatcher.ensure_delivery_context("subscribe")?;
        let scope_id = scope.scope_id();
        let key = match &options.key {
            Some(key) => SubscriberKey::new(key.clone()),
            None => SubscriberKey::from(&scope_id),
        };
        let (subscription, owed) = self.inner.attach(Some(scope_id.clone()), key, &options, handler)?;

        let first = match self.inner.lifecycle.bind(&scope_id, subscription.clone()) {
            Ok(first) => first,
            Err(e) => return self.settle(subscription, Err(e)),
        };
        if first {
            let bus = Arc::downgrade(&self.inner);
            let ended = scope_id.clone();
            scope.on_end(Box::new(move || {
                if let Some(inner) = bus.upgrade() {
                    inner.end_scope(&ended);
                }
            }));
        }

        let replay = self.inner.deliver_owed(&subscription, &owed);
        self.settle(subscription, replay)
    }

    /// Subscribe without a scope; the subscription lives until unsubscribed
    pub fn subscribe_forever<T: Clone + Send + 'static>(
        &self,
        options: SubscribeOptions,
        handler: Handler<T>,
    ) -> Result<Subscription> {
        self.inner.dispatcher.ensure_delivery_context("subscribe")?;
        let key = match &options.key {
            Some(key) => SubscriberKey::new(key.clone()),
            None => SubscriberKey::synthesize(),
        };
        let (subscription, owed) = self.inner.attach(None, key, &options, handler)?;
        let replay = self.inner.deliver_owed(&subscription, &owed);
        self.settle(subscription, replay)
    }

    /// Commit a fresh subscription, or undo it when `outcome` failed
    ///
    /// Undoing hands every shared key back in the state the attach found
    /// it, so other subscriptions under that key keep what they were owed.
    fn settle(&self, subscription: Subscription, outcome: Result<()>) -> Result<Subscription> {
        let err = match outcome {
            Ok(()) => {
                self.inner.commit(&subscription)?;
                return Ok(subscription);
            }
            Err(e) => e,
        };
        if let Err(undo) = self.inner.rollback(&subscription) {
            tracing::warn!(subscriber = %subscription.key, error = %undo, "Subscription rollback failed");
        }
        if let Some(scope) = &subscription.scope {
            if let Err(undo) = self.inner.lifecycle.forget(scope, subscription.id) {
                tracing::warn!(scope = %scope, error = %undo, "Subscription rollback failed");
            }
        }
        tracing::debug!(
            event_type = %subscription.event_type,
            subscriber = %subscription.key,
            error = %err,
            "Subscription rolled back"
        );
        Err(err)
    }

    /// Remove a subscription
    ///
    /// Returns false when it was already gone; that is not an error.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<bool> {
        let removed = self.inner.detach(subscription)?;
        if let Some(scope) = &subscription.scope {
            self.inner.lifecycle.forget(scope, subscription.id)?;
        }
        if removed {
            tracing::debug!(
                event_type = %subscription.event_type,
                subscriber = %subscription.key,
                "Unsubscribed"
            );
        }
        Ok(removed)
    }

    /// Activate a subscription created with [`SubscribeOptions::inactive`]
    ///
    /// Anything owed on its sticky channel is delivered before this returns,
    /// or right after the running broadcast when called from a callback.
    pub fn activate(&self, subscription: &Subscription) -> Result<()> {
        self.inner.dispatcher.ensure_delivery_context("activate")?;
        let mut owed = Vec::new();
        {
            let mut registry = self.inner.lock_registry()?;
            for &sticky in &subscription.channels {
                let channel = registry.erased_mut(&subscription.event_type, sticky, true);
                if let Some(channel) = channel {
                    if channel.activate_observer(subscription.id) {
                        owed.push(ChannelKey::new(subscription.event_type.clone(), sticky));
                    }
                }
            }
        }
        tracing::debug!(
            event_type = %subscription.event_type,
            subscriber = %subscription.key,
            "Subscription activated"
        );
        if self.inner.dispatcher.is_broadcasting() {
            // Inside a callback: queue behind the running broadcast
            for key in owed {
                self.inner
                    .dispatcher
                    .broadcast(key, |k| self.inner.notify_channel(k))?;
            }
            return Ok(());
        }
        self.inner.deliver_owed(subscription, &owed)
    }

    /// Re-fire the broadcast of one channel without publishing
    ///
    /// Subscribers that already consumed the latest publication receive
    /// nothing.
    pub fn renotify(&self, event_type: &EventType, sticky: bool) -> Result<()> {
        self.inner.dispatcher.ensure_delivery_context("renotify")?;
        let key = ChannelKey::new(event_type.clone(), sticky);
        self.inner
            .dispatcher
            .broadcast(key, |k| self.inner.notify_channel(k))
    }

    // ─── Delivery context ───

    /// Run every queued publish; returns how many ran
    pub fn drain(&self) -> Result<usize> {
        let ran = self.inner.dispatcher.drain(&self.inner)?;
        if ran > 0 {
            tracing::debug!(publishes = ran, "Drained queued publishes");
        }
        Ok(ran)
    }

    /// Wait until publishes may be queued for the delivery context
    pub async fn wait_pending(&self) {
        self.inner.dispatcher.wait().await
    }

    /// Publishes waiting for the delivery context
    pub fn pending(&self) -> usize {
        self.inner.dispatcher.pending()
    }

    // ─── Administration ───

    /// Resize the live channel store
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        self.inner.lock_registry()?.set_capacity(capacity)
    }

    pub fn capacity(&self) -> Result<usize> {
        Ok(self.inner.lock_registry()?.capacity())
    }

    /// Pin an event type to live (`false`) or sticky (`true`) use
    pub fn declare(&self, event_type: EventType, sticky: bool) -> Result<()> {
        self.inner.lock_registry()?.declare(&event_type, sticky)?;
        tracing::debug!(event_type = %event_type, sticky, "Event type declared");
        Ok(())
    }

    /// Drop every channel and every queued publish
    ///
    /// Subscriptions made before the clear stop receiving deliveries; mode
    /// declarations are kept.
    pub fn clear(&self) -> Result<()> {
        let discarded = self.inner.dispatcher.discard()?;
        self.inner.lock_registry()?.clear();
        self.inner.lifecycle.clear()?;
        tracing::info!(discarded, "Event bus cleared");
        Ok(())
    }

    pub fn has_channel(&self, event_type: &EventType, sticky: bool) -> bool {
        self.inner
            .registry
            .lock()
            .map(|r| r.contains(event_type, sticky))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> Result<BusStats> {
        let registry = self.inner.lock_registry()?;
        Ok(BusStats {
            live_channels: registry.live_len(),
            sticky_channels: registry.sticky_len(),
            capacity: registry.capacity(),
            evictions: registry.evictions(),
            queued: self.inner.dispatcher.pending(),
            coalesced: self.inner.dispatcher.coalesced(),
            scopes: self.inner.lifecycle.bound_scopes(),
        })
    }
}

impl BusInner {
    fn lock_registry(&self) -> Result<MutexGuard<'_, ChannelRegistry>> {
        self.registry
            .lock()
            .map_err(|e| EventError::Lock(format!("channel registry: {}", e)))
    }

    /// Record a publication and broadcast it; delivery context only
    fn publish_now<T: Clone + Send + 'static>(
        &self,
        key: &ChannelKey,
        value: Option<T>,
        is_call: bool,
    ) -> Result<()> {
        self.lock_registry()?
            .resolve::<T>(&key.event_type, key.sticky)?
            .publish(value, is_call);
        self.dispatcher
            .broadcast(key.clone(), |k| self.notify_channel(k))
    }

    /// Offer the latest publication of one channel to each of its callbacks
    ///
    /// Every callback runs with the registry unlocked, so callbacks may
    /// publish, subscribe and unsubscribe.
    fn notify_channel(&self, key: &ChannelKey) -> Result<()> {
        let observers = {
            let mut registry = self.lock_registry()?;
            match registry.erased_mut(&key.event_type, key.sticky, false) {
                Some(channel) => channel.observer_ids(),
                None => return Ok(()),
            }
        };

        let mut first_err = None;
        for observer in observers {
            if let Err(e) = self.deliver_to(key, observer) {
                if first_err.is_some() {
                    tracing::warn!(
                        event_type = %key.event_type,
                        sticky = key.sticky,
                        error = %e,
                        "Delivery failed"
                    );
                } else {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn deliver_to(&self, key: &ChannelKey, observer: u64) -> Result<()> {
        let prepared = {
            let mut registry = self.lock_registry()?;
            registry
                .erased_mut(&key.event_type, key.sticky, true)
                .and_then(|channel| channel.prepare_delivery(observer))
        };
        match prepared {
            Some(deliver) => deliver(),
            None => Ok(()),
        }
    }

    /// Deliver what a new or newly activated subscription is owed
    fn deliver_owed(&self, subscription: &Subscription, owed: &[ChannelKey]) -> Result<()> {
        let mut first_err = None;
        for key in owed {
            if let Err(e) = self.deliver_to(key, subscription.id) {
                if first_err.is_some() {
                    tracing::warn!(
                        event_type = %key.event_type,
                        subscriber = %subscription.key,
                        error = %e,
                        "Replay failed"
                    );
                } else {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register a callback on every channel the options select
    ///
    /// Returns the subscription and the channels on which it is owed a
    /// replay. Nothing is attached if any channel fails to resolve.
    fn attach<T: Clone + Send + 'static>(
        &self,
        scope: Option<ScopeId>,
        key: SubscriberKey,
        options: &SubscribeOptions,
        handler: Handler<T>,
    ) -> Result<(Subscription, Vec<ChannelKey>)> {
        let event_type = options.event_type.clone().unwrap_or_else(EventType::of::<T>);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler = handler.into_shared();

        let mut registry = self.lock_registry()?;
        let channels: Vec<bool> = match (options.mode, registry.declared(&event_type)) {
            (ChannelMode::Both, Some(sticky)) => vec![sticky],
            (mode, _) => mode.channels().to_vec(),
        };
        for &sticky in &channels {
            registry.resolve::<T>(&event_type, sticky)?;
        }

        let mut owed = Vec::new();
        for &sticky in &channels {
            let pending = registry.resolve::<T>(&event_type, sticky)?.attach(
                id,
                key.clone(),
                handler.clone(),
                options.active,
            );
            if options.active && pending != PendingKind::Unset {
                owed.push(ChannelKey::new(event_type.clone(), sticky));
            }
        }
        drop(registry);

        tracing::debug!(
            event_type = %event_type,
            subscriber = %key,
            channels = ?channels,
            active = options.active,
            "Subscribed"
        );
        Ok((
            Subscription {
                id,
                event_type,
                key,
                channels,
                scope,
            },
            owed,
        ))
    }

    fn detach(&self, subscription: &Subscription) -> Result<bool> {
        let mut registry = self.lock_registry()?;
        let mut removed = false;
        for &sticky in &subscription.channels {
            if let Some(channel) = registry.erased_mut(&subscription.event_type, sticky, false) {
                removed |= channel.detach(subscription.id);
            }
        }
        Ok(removed)
    }

    fn commit(&self, subscription: &Subscription) -> Result<()> {
        let mut registry = self.lock_registry()?;
        for &sticky in &subscription.channels {
            if let Some(channel) = registry.erased_mut(&subscription.event_type, sticky, false) {
                channel.commit(subscription.id);
            }
        }
        Ok(())
    }

    fn rollback(&self, subscription: &Subscription) -> Result<bool> {
        let mut registry = self.lock_registry()?;
        let mut removed = false;
        for &sticky in &subscription.channels {
            if let Some(channel) = registry.erased_mut(&subscription.event_type, sticky, false) {
                removed |= channel.rollback(subscription.id);
            }
        }
        Ok(removed)
    }

    fn end_scope(&self, scope: &ScopeId) {
        let subscriptions = match self.lifecycle.release(scope) {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                tracing::warn!(scope = %scope, error = %e, "Scope end purge failed");
                return;
            }
        };
        let mut purged = 0;
        for subscription in &subscriptions {
            match self.detach(subscription) {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(scope = %scope, error = %e, "Scope end purge failed");
                }
            }
        }
        tracing::debug!(scope = %scope, subscriptions = purged, "Scope ended, subscriptions purged");
    }
}
