//! Typed message bodies.
//!
//! The bus carries a closed set of well-known body types that every node
//! can decode, plus [`Body::Object`] for user types with a registered
//! codec. On a non-clustered bus object bodies travel by reference and
//! never touch a codec.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A message body.
///
/// Bodies are cheap to clone: every delivery receives an independent
/// envelope over a shared body (strings and byte payloads are not deep
/// copied between the envelope clones that fan-out produces).
#[derive(Clone)]
pub enum Body {
    /// Absent body.
    Null,
    /// Boolean.
    Bool(bool),
    /// 32-bit signed integer.
    I32(i32),
    /// 64-bit signed integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// UTF-8 string.
    String(Arc<str>),
    /// Raw bytes.
    Bytes(Arc<[u8]>),
    /// Structured JSON object.
    JsonObject(Arc<serde_json::Map<String, serde_json::Value>>),
    /// JSON array.
    JsonArray(Arc<Vec<serde_json::Value>>),
    /// User type, serialized through a registered codec when it crosses
    /// the wire.
    Object {
        /// Runtime type name the codec registry is keyed by.
        type_name: String,
        /// The value itself, shared between local deliveries.
        value: Arc<dyn Any + Send + Sync>,
    },
    /// Explicit failure signalled by a recipient via `Message::fail`.
    Failure {
        /// Application-defined failure code.
        code: i32,
        /// Human-readable reason.
        message: String,
    },
}

impl Body {
    /// Wrap a user value for codec-based transport.
    ///
    /// The codec registry is keyed by `std::any::type_name`, so the codec
    /// registered for `T` will be used when this body crosses the wire.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Body::Object {
            type_name: std::any::type_name::<T>().to_string(),
            value: Arc::new(value),
        }
    }

    /// String payload, if this is a string body.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Body::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte payload, if this is a bytes body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Boolean payload.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Body::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 32-bit integer payload.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Body::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// 64-bit integer payload (widens an i32 body).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Body::I32(v) => Some(i64::from(*v)),
            Body::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// 64-bit float payload (widens an f32 body).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Body::F32(v) => Some(f64::from(*v)),
            Body::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// JSON object payload.
    pub fn as_json_object(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            Body::JsonObject(m) => Some(m),
            _ => None,
        }
    }

    /// JSON array payload.
    pub fn as_json_array(&self) -> Option<&[serde_json::Value]> {
        match self {
            Body::JsonArray(a) => Some(a),
            _ => None,
        }
    }

    /// Downcast an object body to a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Body::Object { value, .. } => value.downcast_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Null => write!(f, "Null"),
            Body::Bool(v) => write!(f, "Bool({v})"),
            Body::I32(v) => write!(f, "I32({v})"),
            Body::I64(v) => write!(f, "I64({v})"),
            Body::F32(v) => write!(f, "F32({v})"),
            Body::F64(v) => write!(f, "F64({v})"),
            Body::String(v) => write!(f, "String({v:?})"),
            Body::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Body::JsonObject(v) => write!(f, "JsonObject({} entries)", v.len()),
            Body::JsonArray(v) => write!(f, "JsonArray({} items)", v.len()),
            Body::Object { type_name, .. } => write!(f, "Object({type_name})"),
            Body::Failure { code, message } => write!(f, "Failure({code}: {message})"),
        }
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Null
    }
}

impl From<bool> for Body {
    fn from(v: bool) -> Self {
        Body::Bool(v)
    }
}

impl From<i32> for Body {
    fn from(v: i32) -> Self {
        Body::I32(v)
    }
}

impl From<i64> for Body {
    fn from(v: i64) -> Self {
        Body::I64(v)
    }
}

impl From<f32> for Body {
    fn from(v: f32) -> Self {
        Body::F32(v)
    }
}

impl From<f64> for Body {
    fn from(v: f64) -> Self {
        Body::F64(v)
    }
}

impl From<&str> for Body {
    fn from(v: &str) -> Self {
        Body::String(Arc::from(v))
    }
}

impl From<String> for Body {
    fn from(v: String) -> Self {
        Body::String(Arc::from(v.as_str()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Arc::from(v))
    }
}

impl From<&[u8]> for Body {
    fn from(v: &[u8]) -> Self {
        Body::Bytes(Arc::from(v))
    }
}

impl From<serde_json::Value> for Body {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => Body::Null,
            Value::Bool(b) => Body::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Body::I64(i)
                } else {
                    Body::F64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Body::String(Arc::from(s.as_str())),
            Value::Array(a) => Body::JsonArray(Arc::new(a)),
            Value::Object(m) => Body::JsonObject(Arc::new(m)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_primitives() {
        assert!(matches!(Body::from("hi"), Body::String(_)));
        assert!(matches!(Body::from(42i32), Body::I32(42)));
        assert!(matches!(Body::from(42i64), Body::I64(42)));
        assert!(matches!(Body::from(true), Body::Bool(true)));
        assert!(matches!(Body::from(()), Body::Null));
        assert!(matches!(Body::from(vec![1u8, 2]), Body::Bytes(_)));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Body::from("hi").as_str(), Some("hi"));
        assert_eq!(Body::from(7i32).as_i64(), Some(7));
        assert_eq!(Body::from(2.5f32).as_f64(), Some(2.5));
        assert_eq!(Body::from("hi").as_i32(), None);
    }

    #[test]
    fn test_json_value_conversion() {
        let v = serde_json::json!({"k": 1});
        let body = Body::from(v);
        assert_eq!(
            body.as_json_object().and_then(|m| m.get("k")),
            Some(&serde_json::json!(1))
        );

        let v = serde_json::json!([1, 2, 3]);
        assert_eq!(Body::from(v).as_json_array().map(<[_]>::len), Some(3));
    }

    #[test]
    fn test_object_downcast() {
        struct Custom(u32);
        let body = Body::object(Custom(9));
        assert_eq!(body.downcast_ref::<Custom>().map(|c| c.0), Some(9));
        assert!(body.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_clone_shares_object_value() {
        let body = Body::object(vec![1u8, 2, 3]);
        let clone = body.clone();
        let a = body.downcast_ref::<Vec<u8>>().unwrap() as *const _;
        let b = clone.downcast_ref::<Vec<u8>>().unwrap() as *const _;
        assert_eq!(a, b);
    }
}
