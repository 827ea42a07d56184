//! Unit-of-work configuration.
//!
//! Every field has a default, so a partial JSON document is a valid
//! configuration.
//!
//! # Example
//!
//! ```json
//! {
//!   "all_or_nothing_flush": true,
//!   "uuid_batch_size": 50
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Ask the store to apply every entry of a flush batch or none.
    #[serde(default)]
    pub all_or_nothing_flush: bool,
    /// Identifiers fetched per round-trip by the store-batch generator.
    #[serde(default = "default_uuid_batch_size")]
    pub uuid_batch_size: usize,
    /// JSON key of the type discriminator, for documents and embedded values.
    #[serde(default = "default_type_field")]
    pub type_field: String,
    /// JSON key holding the mapper's own bookkeeping.
    #[serde(default = "default_metadata_field")]
    pub metadata_field: String,
    /// Record the names of owning associations under `metadata_field`.
    #[serde(default = "default_true")]
    pub write_association_metadata: bool,
    /// Remember store existence probes for assigned identifiers until
    /// `clear`, instead of probing on every state query.
    #[serde(default = "default_true")]
    pub cache_existence_probes: bool,
}

fn default_uuid_batch_size() -> usize {
    20
}

fn default_type_field() -> String {
    "type".to_string()
}

fn default_metadata_field() -> String {
    "odm_metadata".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            all_or_nothing_flush: false,
            uuid_batch_size: default_uuid_batch_size(),
            type_field: default_type_field(),
            metadata_field: default_metadata_field(),
            write_association_metadata: true,
            cache_existence_probes: true,
        }
    }
}

impl Configuration {
    /// Parse a JSON configuration document.
    pub fn from_json(input: &str) -> Result<Self> {
        let mut config: Configuration = serde_json::from_str(input)?;
        if config.uuid_batch_size == 0 {
            config.uuid_batch_size = default_uuid_batch_size();
        }
        Ok(config)
    }
}
