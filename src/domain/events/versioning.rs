//! Event Schema Versioning
//!
//! Production and consumption of an event type evolve independently over the
//! system's life. Version mismatches are resolved here, at the boundary, by a
//! lookup table of pure upgrade/downgrade functions over the wire JSON, so
//! consumer logic never branches on version.
//!
//! The registry is built once at startup and frozen; there is no ambient
//! global table and no runtime mutation.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::shared::error::EventError;

use super::envelope::EventEnvelope;

/// A single version hop. Must be pure and total for any valid payload of the
/// source version: no side effects, no partial application.
pub type VersionFn = fn(Value) -> Value;

#[derive(Default)]
struct TypeVersions {
    /// Upgrade from version N to N+1, keyed by N
    upgrades: BTreeMap<u32, VersionFn>,
    /// Downgrade from version N to N-1, keyed by N
    downgrades: BTreeMap<u32, VersionFn>,
}

impl TypeVersions {
    /// Highest version reachable through registered upgrade hops.
    fn current(&self) -> u32 {
        self.upgrades.keys().max().map_or(1, |from| from + 1)
    }
}

/// Per-event-type table of schema version hops.
pub struct VersionRegistry {
    types: HashMap<String, TypeVersions>,
}

/// Builder for [`VersionRegistry`]; consumed by `build` so the finished
/// registry is immutable.
#[derive(Default)]
pub struct VersionRegistryBuilder {
    types: HashMap<String, TypeVersions>,
}

impl VersionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the hop pair `from -> from + 1` (upgrade) and
    /// `from + 1 -> from` (downgrade) for an event type.
    pub fn hop(
        mut self,
        event_type: impl Into<String>,
        from: u32,
        upgrade: VersionFn,
        downgrade: VersionFn,
    ) -> Self {
        let entry = self.types.entry(event_type.into()).or_default();
        entry.upgrades.insert(from, upgrade);
        entry.downgrades.insert(from + 1, downgrade);
        self
    }

    pub fn build(self) -> VersionRegistry {
        VersionRegistry { types: self.types }
    }
}

impl VersionRegistry {
    pub fn builder() -> VersionRegistryBuilder {
        VersionRegistryBuilder::new()
    }

    /// Current schema version for an event type. Types with no registered
    /// hops have never changed shape and sit at version 1.
    pub fn current_version(&self, event_type: &str) -> u32 {
        self.types.get(event_type).map_or(1, TypeVersions::current)
    }

    /// Apply upgrade hops to carry a payload from `from` up to `to`.
    pub fn upgrade(
        &self,
        event_type: &str,
        from: u32,
        to: u32,
        mut payload: Value,
    ) -> Result<Value, EventError> {
        let entry = self.types.get(event_type);
        for hop in from..to {
            let f = entry
                .and_then(|t| t.upgrades.get(&hop))
                .ok_or_else(|| EventError::VersionGap {
                    event_type: event_type.to_owned(),
                    from: hop,
                    to: hop + 1,
                })?;
            payload = f(payload);
        }
        Ok(payload)
    }

    /// Apply downgrade hops to carry a payload from `from` down to `to`.
    pub fn downgrade(
        &self,
        event_type: &str,
        from: u32,
        to: u32,
        mut payload: Value,
    ) -> Result<Value, EventError> {
        let entry = self.types.get(event_type);
        for hop in (to + 1..=from).rev() {
            let f = entry
                .and_then(|t| t.downgrades.get(&hop))
                .ok_or_else(|| EventError::VersionGap {
                    event_type: event_type.to_owned(),
                    from: hop,
                    to: hop - 1,
                })?;
            payload = f(payload);
        }
        Ok(payload)
    }

    /// Decode a wire envelope, bridging whatever version was received to the
    /// shape compiled into this binary before typed deserialization.
    ///
    /// Consumers therefore only ever see current-version payloads. A version
    /// the registry cannot bridge fails with [`EventError::VersionGap`] and
    /// the event is neither processed nor marked processed.
    pub fn decode(&self, mut wire: Value) -> Result<EventEnvelope, EventError> {
        let event_type = wire
            .get("t")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::InvalidEvent("missing event type tag".into()))?
            .to_owned();
        let received = wire
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| EventError::InvalidEvent("missing version".into()))?
            as u32;

        let current = self.current_version(&event_type);
        if received != current {
            let payload = wire.get("d").cloned().unwrap_or(Value::Null);
            let bridged = if received < current {
                self.upgrade(&event_type, received, current, payload)?
            } else {
                self.downgrade(&event_type, received, current, payload)?
            };
            wire["d"] = bridged;
            wire["version"] = current.into();
        }

        Ok(serde_json::from_value(wire)?)
    }
}

/// Registry with the hops the chat domain has accumulated so far.
pub fn default_registry() -> VersionRegistry {
    VersionRegistry::builder()
        .hop(
            "MESSAGE_SENT",
            1,
            message_sent_v1_to_v2,
            message_sent_v2_to_v1,
        )
        .build()
}

/// MESSAGE_SENT v1 named the text field `body`; v2 renamed it to `content`.
fn message_sent_v1_to_v2(mut payload: Value) -> Value {
    if let Some(map) = payload.as_object_mut() {
        if let Some(body) = map.remove("body") {
            map.insert("content".into(), body);
        }
    }
    payload
}

fn message_sent_v2_to_v1(mut payload: Value) -> Value {
    if let Some(map) = payload.as_object_mut() {
        if let Some(content) = map.remove("content") {
            map.insert("body".into(), content);
        }
    }
    payload
}
