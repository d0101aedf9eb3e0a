//! Mutators: payload transforms applied before handler dispatch.

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Names of the mutators that exist without a store entry.
pub mod builtin {
    /// Serializes the whole event as JSON (the default when no mutator is
    /// configured).
    pub const JSON: &str = "json";
    /// Replaces the payload with the raw check output.
    pub const ONLY_CHECK_OUTPUT: &str = "only_check_output";
}

/// A stored pipe mutator: the event is written to the subprocess stdin
/// and its stdout becomes the payload handed to the handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mutator {
    /// Namespace, name, labels, annotations.
    pub metadata: ObjectMeta,

    /// Command line to spawn.
    #[serde(default)]
    pub command: String,

    /// Wall-clock timeout in seconds (0 = default).
    #[serde(default)]
    pub timeout: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mutator = Mutator {
            metadata: ObjectMeta::namespaced("default", "redact"),
            command: "redact-secrets.py".to_string(),
            timeout: 10,
        };
        let json = serde_json::to_string(&mutator).unwrap();
        let decoded: Mutator = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, mutator);
    }
}
