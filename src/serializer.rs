//! The pluggable payload format.
//!
//! Everything inside a wire envelope's data section is produced by a
//! [Serializer]. All payload types in this crate are serde-derived, so a
//! format slots in by mapping serde to bytes. JSON is the shipped default.

/// Payload serializer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    Json,
}

impl Default for Serializer {
    fn default() -> Self {
        Serializer::Json
    }
}

/// Error returned when a payload cannot be encoded or decoded. The `what`
/// label names the payload kind for context.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("Failed to encode {what}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to decode {what}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Serializer {
    pub fn to_bytes<T: serde::Serialize>(
        &self,
        what: &'static str,
        value: &T,
    ) -> Result<Vec<u8>, SerializerError> {
        match self {
            Serializer::Json => {
                serde_json::to_vec(value).map_err(|source| SerializerError::Encode { what, source })
            }
        }
    }

    pub fn from_bytes<T: serde::de::DeserializeOwned>(
        &self,
        what: &'static str,
        bytes: &[u8],
    ) -> Result<T, SerializerError> {
        match self {
            Serializer::Json => serde_json::from_slice(bytes)
                .map_err(|source| SerializerError::Decode { what, source }),
        }
    }

    /// Whether parameter values need a type-preserving envelope with this
    /// format. The engine always writes the tagged parameter form, which
    /// satisfies both answers; the flag is kept for format implementors.
    pub fn envelope_needed_for_parameters(&self) -> bool {
        match self {
            Serializer::Json => true,
        }
    }
}
