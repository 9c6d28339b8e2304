//! User codecs for non-primitive message bodies.
//!
//! On a clustered bus, a [`Body::Object`](crate::Body::Object) crossing the
//! wire is serialized through the codec registered for its runtime type
//! name. The registry is consulted lock-free on every remote write and on
//! every received object frame.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::WireError;

/// Encodes and decodes one user body type.
pub trait MessageCodec: Send + Sync {
    /// Serialize the value to bytes.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Codec` when the value is not the type this codec
    /// was registered for, or when serialization itself fails.
    fn encode(&self, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, WireError>;

    /// Deserialize a value from bytes.
    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, WireError>;
}

/// Serde-JSON backed codec for any `Serialize + DeserializeOwned` type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Create the codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Any + Send + Sync,
{
    fn encode(&self, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, WireError> {
        let value = value.downcast_ref::<T>().ok_or_else(|| {
            WireError::Codec(format!(
                "value is not a {}",
                std::any::type_name::<T>()
            ))
        })?;
        serde_json::to_vec(value).map_err(|e| WireError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, WireError> {
        let value: T =
            serde_json::from_slice(bytes).map_err(|e| WireError::Codec(e.to_string()))?;
        Ok(Arc::new(value))
    }
}

/// Concurrent registry mapping runtime type names to codecs.
pub(crate) struct CodecRegistry {
    codecs: DashMap<String, Arc<dyn MessageCodec>>,
}

impl CodecRegistry {
    pub(crate) fn new() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, type_name: &str, codec: Arc<dyn MessageCodec>) {
        self.codecs.insert(type_name.to_string(), codec);
    }

    pub(crate) fn unregister(&self, type_name: &str) -> bool {
        self.codecs.remove(type_name).is_some()
    }

    pub(crate) fn get(&self, type_name: &str) -> Option<Arc<dyn MessageCodec>> {
        self.codecs.get(type_name).map(|c| Arc::clone(c.value()))
    }

    pub(crate) fn contains(&self, type_name: &str) -> bool {
        self.codecs.contains_key(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        item: String,
    }

    #[test]
    fn test_json_codec_round_trip() {
        let codec = JsonCodec::<Order>::new();
        let order = Order {
            id: 7,
            item: "widget".to_string(),
        };

        let bytes = codec.encode(&order).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Order>(), Some(&order));
    }

    #[test]
    fn test_json_codec_rejects_wrong_type() {
        let codec = JsonCodec::<Order>::new();
        let not_an_order = "hello".to_string();
        assert!(codec.encode(&not_an_order).is_err());
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = CodecRegistry::new();
        let name = std::any::type_name::<Order>();
        assert!(!registry.contains(name));

        registry.register(name, Arc::new(JsonCodec::<Order>::new()));
        assert!(registry.contains(name));
        assert!(registry.get(name).is_some());

        assert!(registry.unregister(name));
        assert!(!registry.unregister(name));
        assert!(registry.get(name).is_none());
    }
}
