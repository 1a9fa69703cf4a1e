//! Peer instrument-status providers.
//!
//! Other instrument services publish key/value telemetry (lamp states, telescope
//! position, ...). The header assembler pulls values by provider name and key;
//! how the values reach this process is outside the crate.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::value::FieldValue;

/// Pull-style source of peer telemetry.
#[async_trait]
pub trait PeerTelemetry: Send + Sync {
    /// Latest value of `key` published by `provider`. A key may carry several
    /// values (e.g. the four lamps of a lamp keyword).
    async fn get(&self, provider: &str, key: &str) -> Option<Vec<FieldValue>>;
}

/// Telemetry held in memory.
///
/// Used as the cache behind a status-bus subscription, and directly in tests.
#[derive(Debug, Default)]
pub struct StaticTelemetry {
    values: RwLock<HashMap<(String, String), Vec<FieldValue>>>,
}

impl StaticTelemetry {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a value.
    pub fn set(&self, provider: &str, key: &str, values: Vec<FieldValue>) {
        if let Ok(mut map) = self.values.write() {
            map.insert((provider.to_string(), key.to_string()), values);
        }
    }

    /// Remove a value.
    pub fn remove(&self, provider: &str, key: &str) {
        if let Ok(mut map) = self.values.write() {
            map.remove(&(provider.to_string(), key.to_string()));
        }
    }
}

#[async_trait]
impl PeerTelemetry for StaticTelemetry {
    async fn get(&self, provider: &str, key: &str) -> Option<Vec<FieldValue>> {
        self.values
            .read()
            .ok()?
            .get(&(provider.to_string(), key.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let peers = StaticTelemetry::new();
        peers.set("lamps", "ff", vec![FieldValue::Enum("ON".into())]);

        assert_eq!(
            peers.get("lamps", "ff").await,
            Some(vec![FieldValue::Enum("ON".into())])
        );
        assert_eq!(peers.get("lamps", "hgcd").await, None);

        peers.remove("lamps", "ff");
        assert_eq!(peers.get("lamps", "ff").await, None);
    }
}
