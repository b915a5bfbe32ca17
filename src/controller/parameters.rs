//! # Parameter Assembly
//!
//! Merges inline `spec.parameters` with every `parametersFrom` secret key into the
//! parameter object sent to SM.

use crate::controller::credentials::SecretSource;
use crate::crd::ParametersFromSource;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParametersError {
    #[error("secret {namespace}/{name} referenced in parametersFrom not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("key {key} not found in secret {namespace}/{name}")]
    KeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("failed to read secret {namespace}/{name}: {message}")]
    Read {
        namespace: String,
        name: String,
        message: String,
    },

    #[error("parameters from {origin} must be a JSON object: {reason}")]
    NotAnObject { origin: String, reason: String },

    #[error("parameter {key} is defined more than once")]
    DuplicateKey { key: String },
}

impl ParametersError {
    /// A referenced secret may still be created; malformed content needs a user fix
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ParametersError::SecretNotFound { .. }
                | ParametersError::KeyNotFound { .. }
                | ParametersError::Read { .. }
        )
    }
}

/// Parameters ready to send plus the hash of their secret-sourced part
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedParameters {
    pub values: Map<String, Value>,
    /// md5 of the raw `parametersFrom` data, `None` without sources
    pub from_hash: Option<String>,
}

/// Names of the secrets a resource reads parameters from
pub fn parameter_secret_names(from: &[ParametersFromSource]) -> Vec<String> {
    let mut names: Vec<String> = from
        .iter()
        .filter_map(|source| source.secret_key_ref.as_ref())
        .map(|key_ref| key_ref.name.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn parse_object(origin: &str, raw: &[u8]) -> Result<Map<String, Value>, ParametersError> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ParametersError::NotAnObject {
            origin: origin.to_string(),
            reason: format!("found {}", json_type(&other)),
        }),
        Err(e) => Err(ParametersError::NotAnObject {
            origin: origin.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Merge inline parameters with raw secret sources
///
/// `shared` is owned by `spec.shared` and is dropped from secret sources.
pub fn merge_parameters(
    inline: Option<&Value>,
    sources: &[(String, Vec<u8>)],
) -> Result<Map<String, Value>, ParametersError> {
    let mut merged = match inline {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(ParametersError::NotAnObject {
                origin: "spec.parameters".to_string(),
                reason: format!("found {}", json_type(other)),
            })
        }
    };

    for (origin, raw) in sources {
        let mut object = parse_object(origin, raw)?;
        object.remove("shared");
        for (key, value) in object {
            if merged.contains_key(&key) {
                return Err(ParametersError::DuplicateKey { key });
            }
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

/// Read every `parametersFrom` entry and merge it with the inline parameters
pub async fn resolve_parameters(
    source: &dyn SecretSource,
    namespace: &str,
    inline: Option<&Value>,
    from: &[ParametersFromSource],
) -> Result<ResolvedParameters, ParametersError> {
    let mut raw_sources = Vec::new();
    for key_ref in from.iter().filter_map(|s| s.secret_key_ref.as_ref()) {
        let secret = source
            .get_secret(namespace, &key_ref.name)
            .await
            .map_err(|e| ParametersError::Read {
                namespace: namespace.to_string(),
                name: key_ref.name.clone(),
                message: e.to_string(),
            })?
            .ok_or_else(|| ParametersError::SecretNotFound {
                namespace: namespace.to_string(),
                name: key_ref.name.clone(),
            })?;

        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&key_ref.key))
            .map(|bytes| bytes.0.clone())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|data| data.get(&key_ref.key))
                    .map(|s| s.clone().into_bytes())
            })
            .ok_or_else(|| ParametersError::KeyNotFound {
                namespace: namespace.to_string(),
                name: key_ref.name.clone(),
                key: key_ref.key.clone(),
            })?;

        raw_sources.push((format!("secret {}/{}", key_ref.name, key_ref.key), value));
    }

    let values = merge_parameters(inline, &raw_sources)?;
    let from_hash = (!raw_sources.is_empty()).then(|| {
        let joined: Vec<u8> = raw_sources.iter().flat_map(|(_, raw)| raw.iter().copied()).collect();
        format!("{:x}", md5::compute(joined))
    });

    Ok(ResolvedParameters { values, from_hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SecretKeyReference;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct OneSecret(Mutex<Secret>);

    impl OneSecret {
        fn new(data: &[(&str, &str)]) -> Self {
            let mut secret = Secret::default();
            secret.metadata.name = Some("params".to_string());
            secret.data = Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            );
            Self(Mutex::new(secret))
        }
    }

    #[async_trait]
    impl SecretSource for OneSecret {
        async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
            let secret = self.0.lock().unwrap().clone();
            Ok((secret.metadata.name.as_deref() == Some(name)).then_some(secret))
        }
    }

    fn from(name: &str, key: &str) -> ParametersFromSource {
        ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: name.to_string(),
                key: key.to_string(),
            }),
        }
    }

    #[test]
    fn test_merge_inline_and_sources() {
        let merged = merge_parameters(
            Some(&json!({"size": "small"})),
            &[("s".to_string(), br#"{"region": "eu", "shared": true}"#.to_vec())],
        )
        .unwrap();
        assert_eq!(Value::Object(merged), json!({"size": "small", "region": "eu"}));
    }

    #[test]
    fn test_merge_rejects_duplicates_and_non_objects() {
        let err = merge_parameters(
            Some(&json!({"size": "small"})),
            &[("s".to_string(), br#"{"size": "large"}"#.to_vec())],
        )
        .unwrap_err();
        assert!(matches!(err, ParametersError::DuplicateKey { ref key } if key == "size"));
        assert!(!err.is_transient());

        let err = merge_parameters(None, &[("s".to_string(), b"[1, 2]".to_vec())]).unwrap_err();
        assert!(matches!(err, ParametersError::NotAnObject { .. }));

        let err = merge_parameters(Some(&json!("text")), &[]).unwrap_err();
        assert!(matches!(err, ParametersError::NotAnObject { ref origin, .. } if origin == "spec.parameters"));
    }

    #[tokio::test]
    async fn test_resolve_reads_secrets_and_hashes_them() {
        let secrets = OneSecret::new(&[("config", r#"{"region": "eu"}"#)]);
        let resolved = resolve_parameters(&secrets, "default", None, &[from("params", "config")])
            .await
            .unwrap();
        assert_eq!(resolved.values["region"], "eu");
        let first_hash = resolved.from_hash.clone().unwrap();

        *secrets.0.lock().unwrap() = OneSecret::new(&[("config", r#"{"region": "us"}"#)])
            .0
            .into_inner()
            .unwrap();
        let resolved = resolve_parameters(&secrets, "default", None, &[from("params", "config")])
            .await
            .unwrap();
        assert_ne!(resolved.from_hash.unwrap(), first_hash);

        let inline_only = resolve_parameters(&secrets, "default", Some(&json!({"a": 1})), &[])
            .await
            .unwrap();
        assert!(inline_only.from_hash.is_none());
    }

    #[tokio::test]
    async fn test_missing_secret_and_key_are_transient() {
        let secrets = OneSecret::new(&[("config", "{}")]);
        let err = resolve_parameters(&secrets, "default", None, &[from("missing", "config")])
            .await
            .unwrap_err();
        assert!(matches!(err, ParametersError::SecretNotFound { .. }));
        assert!(err.is_transient());

        let err = resolve_parameters(&secrets, "default", None, &[from("params", "other")])
            .await
            .unwrap_err();
        assert!(matches!(err, ParametersError::KeyNotFound { .. }));
    }

    #[test]
    fn test_parameter_secret_names_are_unique() {
        let names = parameter_secret_names(&[from("b", "x"), from("a", "y"), from("b", "z")]);
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
