//! # Credential Normalization
//!
//! Turns a broker credentials payload into flat secret entries plus the
//! `metadata` entry describing each of them.

use super::MaterializeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key of the secret entry describing all other entries
pub const METADATA_KEY: &str = "metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyFormat {
    Text,
    Json,
}

/// One entry of the `metadata` secret key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadataProperty {
    pub name: String,
    pub format: PropertyFormat,
    /// Set when the entry holds the whole payload (`secretKey`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMetadata {
    pub credential_properties: Vec<SecretMetadataProperty>,
    pub meta_data_properties: Vec<SecretMetadataProperty>,
}

/// Normalized credentials: secret entries and their descriptions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedCredentials {
    pub entries: BTreeMap<String, Vec<u8>>,
    pub properties: Vec<SecretMetadataProperty>,
}

/// Secret key for a payload key; spaces are not allowed in secret keys
pub fn normalize_key(key: &str) -> String {
    key.replace(' ', "_")
}

/// Strings are stored verbatim, everything else as JSON
pub fn normalize_value(value: &Value) -> Result<(Vec<u8>, PropertyFormat), MaterializeError> {
    match value {
        Value::String(s) => Ok((s.clone().into_bytes(), PropertyFormat::Text)),
        other => Ok((serde_json::to_vec(other)?, PropertyFormat::Json)),
    }
}

pub fn normalize_credentials(
    credentials: &Map<String, Value>,
) -> Result<NormalizedCredentials, MaterializeError> {
    let mut normalized = NormalizedCredentials::default();
    for (key, value) in credentials {
        let name = normalize_key(key);
        let (bytes, format) = normalize_value(value)?;
        normalized.entries.insert(name.clone(), bytes);
        normalized.properties.push(SecretMetadataProperty {
            name,
            format,
            container: None,
        });
    }
    Ok(normalized)
}

/// Inverse of [`normalize_credentials`] driven by the recorded formats
pub fn restore_credentials(
    entries: &BTreeMap<String, Vec<u8>>,
    properties: &[SecretMetadataProperty],
) -> Result<Map<String, Value>, MaterializeError> {
    let mut restored = Map::new();
    for property in properties {
        let Some(bytes) = entries.get(&property.name) else {
            continue;
        };
        let value = match property.format {
            PropertyFormat::Text => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            PropertyFormat::Json => serde_json::from_slice(bytes)?,
        };
        restored.insert(property.name.clone(), value);
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_formats_and_keys() {
        let payload = json!({
            "uri": "amqp://x",
            "port": 5672,
            "client secret": "p",
            "nested": {"a": [1, 2]}
        });
        let normalized = normalize_credentials(payload.as_object().unwrap()).unwrap();

        assert_eq!(normalized.entries["uri"], b"amqp://x");
        assert_eq!(normalized.entries["port"], b"5672");
        assert_eq!(normalized.entries["client_secret"], b"p");
        assert_eq!(normalized.entries["nested"], br#"{"a":[1,2]}"#);

        let formats: BTreeMap<_, _> = normalized
            .properties
            .iter()
            .map(|p| (p.name.as_str(), p.format))
            .collect();
        assert_eq!(formats["uri"], PropertyFormat::Text);
        assert_eq!(formats["port"], PropertyFormat::Json);
        assert_eq!(formats["nested"], PropertyFormat::Json);
    }

    #[test]
    fn test_restore_returns_original_payload() {
        let payload = json!({
            "uri": "amqp://x",
            "password": "p",
            "port": 5672,
            "tls": true,
            "hosts": ["a", "b"]
        });
        let map = payload.as_object().unwrap();
        let normalized = normalize_credentials(map).unwrap();
        let restored = restore_credentials(&normalized.entries, &normalized.properties).unwrap();
        assert_eq!(&restored, map);
    }

    #[test]
    fn test_metadata_serialization_shape() {
        let metadata = SecretMetadata {
            credential_properties: vec![SecretMetadataProperty {
                name: "creds".to_string(),
                format: PropertyFormat::Json,
                container: Some(true),
            }],
            meta_data_properties: vec![],
        };
        assert_eq!(
            serde_json::to_value(&metadata).unwrap(),
            json!({
                "credentialProperties": [{"name": "creds", "format": "json", "container": true}],
                "metaDataProperties": []
            })
        );
    }
}
