//! Connector timeout configuration.

use serde::{Deserialize, Serialize};

/// Cache-validity periods handed to the peer.
///
/// These are advisory: the connector does not age its own cache by time,
/// only by explicit `forget`. All values are in seconds and may carry a
/// fractional part.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConnectorOptions {
    /// How long the peer may cache positive name lookups.
    pub entry_timeout: f64,

    /// How long attribute replies remain valid.
    pub attr_timeout: f64,

    /// How long absence is cached. `0` disables negative caching.
    pub negative_timeout: f64,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            entry_timeout: 1.0,
            attr_timeout: 1.0,
            negative_timeout: 0.0,
        }
    }
}
