//! Primitive-payload events keyed by name
//!
//! A thin layer over typed channels: every primitive travels as a
//! [`PrimitiveValue`] on the channel `EventType::key(name)`. Subscribers ask
//! for one primitive kind; receiving another kind is a type mismatch.

use crate::bus::EventBus;
use crate::error::{EventError, Result};
use crate::handler::{mismatch, Handler, HandlerKind};
use crate::scope::Scope;
use crate::types::{Delivery, EventType, SubscribeOptions, Subscription};
use serde::{Deserialize, Serialize};

/// Tagged primitive payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum PrimitiveValue {
    String(String),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Char(char),
}

impl PrimitiveValue {
    pub fn kind(&self) -> &'static str {
        match self {
            PrimitiveValue::String(_) => "string",
            PrimitiveValue::Int(_) => "int",
            PrimitiveValue::Long(_) => "long",
            PrimitiveValue::Float(_) => "float",
            PrimitiveValue::Double(_) => "double",
            PrimitiveValue::Bool(_) => "bool",
            PrimitiveValue::Char(_) => "char",
        }
    }
}

/// Rust type carried by one [`PrimitiveValue`] variant
pub trait PrimitiveKind: Sized + Send + 'static {
    const KIND: &'static str;

    fn into_value(self) -> PrimitiveValue;

    /// Extract the payload, handing the value back if it is another kind
    fn from_value(value: PrimitiveValue) -> std::result::Result<Self, PrimitiveValue>;
}

macro_rules! primitive_kind {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl PrimitiveKind for $ty {
            const KIND: &'static str = $kind;

            fn into_value(self) -> PrimitiveValue {
                PrimitiveValue::$variant(self)
            }

            fn from_value(value: PrimitiveValue) -> std::result::Result<Self, PrimitiveValue> {
                match value {
                    PrimitiveValue::$variant(v) => Ok(v),
                    other => Err(other),
                }
            }
        }

        impl From<$ty> for PrimitiveValue {
            fn from(value: $ty) -> Self {
                PrimitiveValue::$variant(value)
            }
        }
    };
}

primitive_kind!(String, String, "string");
primitive_kind!(i32, Int, "int");
primitive_kind!(i64, Long, "long");
primitive_kind!(f32, Float, "float");
primitive_kind!(f64, Double, "double");
primitive_kind!(bool, Bool, "bool");
primitive_kind!(char, Char, "char");

impl From<&str> for PrimitiveValue {
    fn from(value: &str) -> Self {
        PrimitiveValue::String(value.to_string())
    }
}

fn primitive_handler<V: PrimitiveKind>(mut f: impl FnMut(V) + Send + 'static) -> Handler<PrimitiveValue> {
    Handler::from_fn(HandlerKind::Value, move |event_type, delivery| match delivery {
        Delivery::Value(value) => match V::from_value(value) {
            Ok(v) => {
                f(v);
                Ok(())
            }
            Err(other) => Err(EventError::TypeMismatch {
                event_type: event_type.to_string(),
                expected: V::KIND.to_string(),
                actual: other.kind().to_string(),
            }),
        },
        Delivery::Null => Ok(()),
        Delivery::Call => Err(mismatch(event_type, V::KIND, &Delivery::<PrimitiveValue>::Call)),
    })
}

impl EventBus {
    /// Publish a primitive under `key`
    pub fn send_primitive(
        &self,
        key: &str,
        value: impl Into<PrimitiveValue>,
        sticky: bool,
    ) -> Result<()> {
        self.publish_to(&EventType::key(key), Some(value.into()), sticky)
    }

    /// Publish a call signal on the primitive channel `key`
    pub fn send_primitive_call(&self, key: &str, sticky: bool) -> Result<()> {
        self.publish_call_to::<PrimitiveValue>(&EventType::key(key), sticky)
    }

    /// Observe primitives of kind `V` published under `key`
    ///
    /// `options.event_type` is replaced by the key's channel.
    pub fn on_primitive<V: PrimitiveKind>(
        &self,
        scope: &dyn Scope,
        key: &str,
        options: SubscribeOptions,
        f: impl FnMut(V) + Send + 'static,
    ) -> Result<Subscription> {
        self.subscribe(
            scope,
            options.event_type(EventType::key(key)),
            primitive_handler(f),
        )
    }

    /// Observe primitives of kind `V` under `key` until unsubscribed
    pub fn on_primitive_forever<V: PrimitiveKind>(
        &self,
        key: &str,
        options: SubscribeOptions,
        f: impl FnMut(V) + Send + 'static,
    ) -> Result<Subscription> {
        self.subscribe_forever(options.event_type(EventType::key(key)), primitive_handler(f))
    }
}
