//! Transformers convert a slice's in-memory value to a storage-safe
//! [`StateValue`] and back.
//!
//! Without a transformer a slice stores its value through serde directly
//! ([`JsonTransformer`]). [`VersionedTransformer`] wraps the value in a
//! version-tagged envelope and runs an upgrade hook when it reads an older
//! version. That hook is the whole of the migration story: there is no
//! migration registry or multi-step planner.

use serde_json::json;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Result, StateError};
use crate::value::{SliceValue, StateValue};

/// Two-way conversion between a value and its stored representation.
///
/// Implementations must round-trip: `deserialize(serialize(v)?)? == v`.
pub trait Transformer<T>: Send + Sync {
    /// Convert an in-memory value to its stored form.
    fn serialize(&self, value: &T) -> Result<StateValue>;

    /// Rebuild an in-memory value from its stored form.
    fn deserialize(&self, stored: StateValue) -> Result<T>;
}

/// Plain serde round-trip. Used when a slice configures no transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTransformer;

impl<T: SliceValue> Transformer<T> for JsonTransformer {
    fn serialize(&self, value: &T) -> Result<StateValue> {
        Ok(serde_json::to_value(value)?)
    }

    fn deserialize(&self, stored: StateValue) -> Result<T> {
        Ok(serde_json::from_value(stored)?)
    }
}

type UpgradeFn = dyn Fn(u32, StateValue) -> Result<StateValue> + Send + Sync;

/// Stores `{"version": n, "data": value}` and upgrades older payloads.
///
/// A stored value without the envelope is treated as version 0.
pub struct VersionedTransformer<T> {
    version: u32,
    upgrade: Option<Arc<UpgradeFn>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> VersionedTransformer<T> {
    /// Tag writes with `version`. Older payloads are read as-is unless an
    /// upgrade hook is set.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            upgrade: None,
            _marker: PhantomData,
        }
    }

    /// Set the hook that converts a payload stored at an older version
    /// (first argument) into the current shape.
    pub fn with_upgrade<F>(mut self, upgrade: F) -> Self
    where
        F: Fn(u32, StateValue) -> Result<StateValue> + Send + Sync + 'static,
    {
        self.upgrade = Some(Arc::new(upgrade));
        self
    }

    /// Current version.
    pub fn version(&self) -> u32 {
        self.version
    }

    fn unwrap_envelope(stored: StateValue) -> Result<(u32, StateValue)> {
        match stored {
            StateValue::Object(mut map)
                if map.len() == 2 && map.contains_key("data") && map.get("version").is_some_and(StateValue::is_u64) =>
            {
                let raw = map.get("version").and_then(StateValue::as_u64).unwrap_or_default();
                let version = u32::try_from(raw)
                    .map_err(|_| StateError::Serialization(format!("stored version {raw} is out of range")))?;
                let data = map.remove("data").unwrap_or(StateValue::Null);
                Ok((version, data))
            }
            other => Ok((0, other)),
        }
    }
}

impl<T: SliceValue> Transformer<T> for VersionedTransformer<T> {
    fn serialize(&self, value: &T) -> Result<StateValue> {
        Ok(json!({
            "version": self.version,
            "data": serde_json::to_value(value)?,
        }))
    }

    fn deserialize(&self, stored: StateValue) -> Result<T> {
        let (stored_version, data) = Self::unwrap_envelope(stored)?;
        if stored_version > self.version {
            return Err(StateError::Serialization(format!(
                "stored version {stored_version} is newer than supported version {}",
                self.version
            )));
        }
        let data = match (&self.upgrade, stored_version < self.version) {
            (Some(upgrade), true) => upgrade(stored_version, data)?,
            _ => data,
        };
        Ok(serde_json::from_value(data)?)
    }
}

/// Closure-backed transformer, see [`transformer_fn`].
pub struct FnTransformer<S, D> {
    serialize: S,
    deserialize: D,
}

/// Build a transformer from a pair of conversion closures.
pub fn transformer_fn<T, S, D>(serialize: S, deserialize: D) -> FnTransformer<S, D>
where
    S: Fn(&T) -> Result<StateValue> + Send + Sync,
    D: Fn(StateValue) -> Result<T> + Send + Sync,
{
    FnTransformer {
        serialize,
        deserialize,
    }
}

impl<T, S, D> Transformer<T> for FnTransformer<S, D>
where
    S: Fn(&T) -> Result<StateValue> + Send + Sync,
    D: Fn(StateValue) -> Result<T> + Send + Sync,
{
    fn serialize(&self, value: &T) -> Result<StateValue> {
        (self.serialize)(value)
    }

    fn deserialize(&self, stored: StateValue) -> Result<T> {
        (self.deserialize)(stored)
    }
}
