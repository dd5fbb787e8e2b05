use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Stable identifier of one logical stream-processing stage.
///
/// Computation ids are assigned by the coordination service and used to key
/// every per-computation structure in the harness: the registry entry, the
/// commit output queue, and the executor free-list.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ComputationId(String);

impl ComputationId {
    /// Create a computation id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ComputationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ComputationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ComputationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Service-supplied configuration for one computation.
///
/// The harness only consults `computation_id`; the stage definitions are
/// opaque JSON consumed by the executor factory when it builds a pipeline
/// for the computation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComputationDescriptor {
    /// Stable id of the computation this descriptor configures.
    pub computation_id: ComputationId,
    /// Opaque stage definitions, interpreted by the executor factory.
    #[serde(default)]
    pub stages: serde_json::Value,
}

/// Parse a serialized computation descriptor.
///
/// Descriptors arrive as JSON strings, both on the command line at startup
/// and in configuration responses from the service.
pub fn parse_descriptor(input: &str) -> anyhow::Result<ComputationDescriptor> {
    let descriptor: ComputationDescriptor = serde_json::from_str(input)?;
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor_roundtrip() {
        let descriptor = parse_descriptor(
            r#"{"computation_id":"c1","stages":[{"read":"source"}]}"#,
        )
        .unwrap();
        assert_eq!(descriptor.computation_id, ComputationId::from("c1"));
        assert!(descriptor.stages.is_array());
    }

    #[test]
    fn test_parse_descriptor_stages_optional() {
        let descriptor = parse_descriptor(r#"{"computation_id":"c2"}"#).unwrap();
        assert_eq!(descriptor.computation_id.as_str(), "c2");
        assert!(descriptor.stages.is_null());
    }

    #[test]
    fn test_parse_descriptor_rejects_malformed() {
        assert!(parse_descriptor("not json").is_err());
        assert!(parse_descriptor(r#"{"stages":[]}"#).is_err());
    }

    #[test]
    fn test_computation_id_ordering() {
        let mut ids = vec![
            ComputationId::from("c3"),
            ComputationId::from("c1"),
            ComputationId::from("c2"),
        ];
        ids.sort();
        assert_eq!(ids[0].as_str(), "c1");
        assert_eq!(ids[2].as_str(), "c3");
    }
}
