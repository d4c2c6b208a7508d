//! Outer snapshot serializers
//!
//! The codec produces a storage-safe mapping; an `ObjectSerializer` turns
//! that mapping into the text persisted in `object` and `object_changes`.

use crate::codec::StoredObject;
use crate::error::Result;

/// Converts storage-safe mappings to and from persisted text
pub trait ObjectSerializer: Send + Sync {
    /// Name used in logs and configuration
    fn name(&self) -> &'static str;

    fn dump(&self, object: &StoredObject) -> Result<String>;

    fn load(&self, text: &str) -> Result<StoredObject>;
}

/// JSON text serializer, the default format
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl ObjectSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn dump(&self, object: &StoredObject) -> Result<String> {
        Ok(serde_json::to_string(object)?)
    }

    fn load(&self, text: &str) -> Result<StoredObject> {
        Ok(serde_json::from_str(text)?)
    }
}
