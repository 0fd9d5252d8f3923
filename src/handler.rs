//! Subscriber bindings
//!
//! A `Handler` adapts a user callback to the deliveries a channel produces.
//! Bindings that cannot represent a delivery (a call signal bound to a
//! payload callback) fail with `EventError::TypeMismatch` when the delivery
//! is consumed.

use crate::error::{EventError, Result};
use crate::types::{Delivery, EventType};
use std::sync::{Arc, Mutex};

pub(crate) type BoxedHandler<T> = Box<dyn FnMut(&EventType, Delivery<T>) -> Result<()> + Send>;
pub(crate) type SharedHandler<T> = Arc<Mutex<BoxedHandler<T>>>;

/// Which deliveries a handler accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Every delivery, unmodified
    Delivery,
    /// Non-null payloads; nulls are skipped, call signals rejected
    Value,
    /// Payloads and nulls; call signals rejected
    Nullable,
    /// Call signals only; payloads and nulls are ignored
    Call,
}

/// Callback binding for a subscription
pub struct Handler<T> {
    kind: HandlerKind,
    f: BoxedHandler<T>,
}

impl<T: Send + 'static> Handler<T> {
    /// Receive every delivery, including call and null signals
    pub fn delivery(mut f: impl FnMut(Delivery<T>) + Send + 'static) -> Self {
        Self::from_fn(HandlerKind::Delivery, move |_, delivery| {
            f(delivery);
            Ok(())
        })
    }

    /// Receive non-null payloads
    pub fn value(mut f: impl FnMut(T) + Send + 'static) -> Self {
        Self::from_fn(HandlerKind::Value, move |event_type, delivery| match delivery {
            Delivery::Value(v) => {
                f(v);
                Ok(())
            }
            Delivery::Null => Ok(()),
            Delivery::Call => Err(mismatch(event_type, "non-null value", &Delivery::<T>::Call)),
        })
    }

    /// Receive payloads and explicit nulls
    pub fn nullable(mut f: impl FnMut(Option<T>) + Send + 'static) -> Self {
        Self::from_fn(HandlerKind::Nullable, move |event_type, delivery| match delivery {
            Delivery::Value(v) => {
                f(Some(v));
                Ok(())
            }
            Delivery::Null => {
                f(None);
                Ok(())
            }
            Delivery::Call => Err(mismatch(event_type, "value or null", &Delivery::<T>::Call)),
        })
    }

    /// Receive zero-payload call signals
    pub fn call(mut f: impl FnMut() + Send + 'static) -> Self {
        Self::from_fn(HandlerKind::Call, move |_, delivery| {
            if delivery.is_call() {
                f();
            }
            Ok(())
        })
    }

    pub(crate) fn from_fn(
        kind: HandlerKind,
        f: impl FnMut(&EventType, Delivery<T>) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            kind,
            f: Box::new(f),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub(crate) fn into_shared(self) -> SharedHandler<T> {
        Arc::new(Mutex::new(self.f))
    }
}

pub(crate) fn mismatch<T>(event_type: &EventType, expected: &str, got: &Delivery<T>) -> EventError {
    EventError::TypeMismatch {
        event_type: event_type.to_string(),
        expected: expected.to_string(),
        actual: got.kind().to_string(),
    }
}
