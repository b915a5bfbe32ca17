//! # Secret Templates
//!
//! Renders a binding's `secretTemplate` with minijinja.
//!
//! The template receives `credentials` (the broker payload) and `instance`
//! (instance info) and must produce a Secret manifest. Only `metadata.labels`,
//! `metadata.annotations`, `data` and `stringData` of the result are used.
//!
//! ```yaml
//! apiVersion: v1
//! kind: Secret
//! metadata:
//!   labels:
//!     instance: "{{ instance.instance_name }}"
//! stringData:
//!   url: "{{ credentials.uri }}"
//!   password: "{{ credentials.password | b64enc }}"
//! ```

use super::limited_writer::LimitedWriter;
use super::{InstanceInfo, MaterializeError};
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Secret;
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Parts of a rendered Secret manifest the operator applies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedSecret {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

fn b64enc(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

fn b64dec(value: &str) -> Result<String, Error> {
    let bytes = STANDARD.decode(value).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("base64 decode error: {e}"))
    })?;
    String::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode produced invalid UTF-8: {e}"),
        )
    })
}

/// Environment with the functions permitted in secret templates
fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("b64enc", b64enc);
    env.add_filter("b64dec", b64dec);
    env
}

/// Compile a template without rendering it
pub fn validate_template(source: &str) -> Result<(), MaterializeError> {
    let env = environment();
    env.template_from_str(source)
        .map(|_| ())
        .map_err(|e| MaterializeError::Template(e.to_string()))
}

/// Render `source` into a Secret manifest, aborting past `max_bytes`
pub fn render_secret_template(
    source: &str,
    credentials: &Value,
    instance: &InstanceInfo,
    max_bytes: usize,
) -> Result<RenderedSecret, MaterializeError> {
    let env = environment();
    let template = env
        .template_from_str(source)
        .map_err(|e| MaterializeError::Template(e.to_string()))?;

    let context = json!({
        "credentials": credentials,
        "instance": instance,
    });

    let mut writer = LimitedWriter::new(max_bytes);
    if let Err(e) = template.render_to_write(minijinja::Value::from_serialize(&context), &mut writer) {
        if writer.exceeded() || e.kind() == ErrorKind::WriteFailure {
            return Err(MaterializeError::TooLarge { limit: max_bytes });
        }
        return Err(MaterializeError::Template(e.to_string()));
    }

    parse_rendered_secret(&writer.into_inner())
}

fn parse_rendered_secret(rendered: &[u8]) -> Result<RenderedSecret, MaterializeError> {
    let manifest: serde_yaml::Value = serde_yaml::from_slice(rendered)
        .map_err(|e| MaterializeError::InvalidManifest(e.to_string()))?;

    if let Some(kind) = manifest.get("kind").and_then(|k| k.as_str()) {
        if kind != "Secret" {
            return Err(MaterializeError::WrongKind(kind.to_string()));
        }
    }

    let secret: Secret = serde_yaml::from_value(manifest)
        .map_err(|e| MaterializeError::InvalidManifest(e.to_string()))?;

    let mut data: BTreeMap<String, Vec<u8>> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect();
    for (key, value) in secret.string_data.unwrap_or_default() {
        data.insert(key, value.into_bytes());
    }

    Ok(RenderedSecret {
        labels: secret.metadata.labels.unwrap_or_default(),
        annotations: secret.metadata.annotations.unwrap_or_default(),
        data,
    })
}
