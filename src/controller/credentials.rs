//! # Credential Resolver
//!
//! Finds the Service Manager credentials secret that applies to a resource and
//! turns it into an [`SmClientConfig`].
//!
//! Resolution order, first hit wins:
//!
//! 1. the secret pinned in the instance status (`secretRef`)
//! 2. `spec.btpAccessCredentialsSecret`, read from the management namespace
//! 3. `sap-btp-service-operator` in the resource namespace, when namespace secrets are enabled
//! 4. `<namespace>-sap-btp-service-operator` in the management namespace
//! 5. `sap-btp-service-operator` in the management (then release) namespace
//!
//! A secret without `clientsecret` takes its certificate and key from the `<name>-tls`
//! companion secret in the same namespace.

use crate::config::OperatorConfig;
use crate::constants::SM_SECRET_NAME;
use crate::crd::CredentialSecretRef;
use crate::provider::SmClientConfig;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("Service Manager credentials secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("no Service Manager credentials secret found for namespace {namespace}")]
    NoneFound { namespace: String },

    #[error("invalid Service Manager credentials in secret {namespace}/{name}: {reason}")]
    Invalid {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("failed to read secret {namespace}/{name}: {message}")]
    Read {
        namespace: String,
        name: String,
        message: String,
    },
}

impl CredentialsError {
    /// Only failures to talk to the API server are worth a quick retry
    pub fn is_transient(&self) -> bool {
        matches!(self, CredentialsError::Read { .. })
    }
}

/// Read access to cluster secrets
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;
}

/// Secret reader backed by a reflector cache with an optional direct-read fallback
#[derive(Clone)]
pub struct KubeSecretReader {
    client: Client,
    cache: Option<Store<Secret>>,
    limited_cache: bool,
}

impl KubeSecretReader {
    pub fn new(client: Client, cache: Option<Store<Secret>>, limited_cache: bool) -> Self {
        Self {
            client,
            cache,
            limited_cache,
        }
    }

    async fn read_direct(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }
}

#[async_trait]
impl SecretSource for KubeSecretReader {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        let Some(cache) = self.cache.as_ref() else {
            return self.read_direct(namespace, name).await;
        };

        if let Some(secret) = cache.get(&ObjectRef::new(name).within(namespace)) {
            return Ok(Some((*secret).clone()));
        }

        if self.limited_cache {
            debug!(namespace, name, "Secret not in cache, reading directly");
            return self.read_direct(namespace, name).await;
        }
        Ok(None)
    }
}

/// Credentials plus the secret they came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub config: SmClientConfig,
    pub secret_ref: CredentialSecretRef,
}

/// Inputs that select the credentials secret
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialsLookup<'a> {
    pub namespace: &'a str,
    pub pinned: Option<&'a CredentialSecretRef>,
    pub btp_access_secret: Option<&'a str>,
}

pub async fn resolve_credentials(
    source: &dyn SecretSource,
    config: &OperatorConfig,
    lookup: CredentialsLookup<'_>,
) -> Result<ResolvedCredentials, CredentialsError> {
    if let Some(pinned) = lookup.pinned {
        if let Some(secret) = fetch(source, &pinned.namespace, &pinned.name).await? {
            return load(source, secret, &pinned.namespace, &pinned.name).await;
        }
        warn!(
            namespace = %pinned.namespace,
            name = %pinned.name,
            "Pinned credentials secret is gone, resolving again"
        );
    }

    if let Some(name) = lookup.btp_access_secret.filter(|n| !n.is_empty()) {
        let namespace = config.management_namespace.as_str();
        return match fetch(source, namespace, name).await? {
            Some(secret) => load(source, secret, namespace, name).await,
            None => Err(CredentialsError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        };
    }

    for (namespace, name) in candidates(config, lookup.namespace) {
        if let Some(secret) = fetch(source, &namespace, &name).await? {
            return load(source, secret, &namespace, &name).await;
        }
    }

    Err(CredentialsError::NoneFound {
        namespace: lookup.namespace.to_string(),
    })
}

/// Fallback candidates after the pinned and explicitly named secrets
fn candidates(config: &OperatorConfig, namespace: &str) -> Vec<(String, String)> {
    let mut candidates = Vec::new();
    if config.enable_namespace_secrets {
        candidates.push((namespace.to_string(), SM_SECRET_NAME.to_string()));
    }
    candidates.push((
        config.management_namespace.clone(),
        format!("{namespace}-{SM_SECRET_NAME}"),
    ));
    for default_namespace in config.default_secret_namespaces() {
        candidates.push((default_namespace.to_string(), SM_SECRET_NAME.to_string()));
    }
    candidates
}

async fn fetch(
    source: &dyn SecretSource,
    namespace: &str,
    name: &str,
) -> Result<Option<Secret>, CredentialsError> {
    source
        .get_secret(namespace, name)
        .await
        .map_err(|e| CredentialsError::Read {
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: e.to_string(),
        })
}

async fn load(
    source: &dyn SecretSource,
    secret: Secret,
    namespace: &str,
    name: &str,
) -> Result<ResolvedCredentials, CredentialsError> {
    let tls = if secret_value(&secret, "clientsecret").is_none() {
        fetch(source, namespace, &tls_secret_name(name)).await?
    } else {
        None
    };

    let config = credentials_from_secret(&secret, tls.as_ref()).map_err(|reason| {
        CredentialsError::Invalid {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason,
        }
    })?;

    Ok(ResolvedCredentials {
        config,
        secret_ref: CredentialSecretRef {
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
    })
}

/// Name of the companion secret holding the mTLS certificate and key
pub fn tls_secret_name(name: &str) -> String {
    format!("{name}-tls")
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    let from_data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).trim().to_string());
    let value = from_data.or_else(|| {
        secret
            .string_data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|s| s.trim().to_string())
    });
    value.filter(|v| !v.is_empty())
}

/// Validate a credentials secret, returning the missing piece on failure
pub fn credentials_from_secret(secret: &Secret, tls: Option<&Secret>) -> Result<SmClientConfig, String> {
    let required = |key: &str| secret_value(secret, key).ok_or_else(|| format!("missing {key}"));

    let client_id = required("clientid")?;
    let sm_url = required("sm_url")?;
    let token_url = required("tokenurl")?;
    let client_secret = secret_value(secret, "clientsecret");

    let tls_value = |key: &str| secret_value(secret, key).or_else(|| tls.and_then(|t| secret_value(t, key)));
    let (tls_cert, tls_key) = match client_secret {
        Some(_) => (None, None),
        None => match (tls_value("tls.crt"), tls_value("tls.key")) {
            (Some(cert), Some(key)) => (Some(cert), Some(key)),
            _ => return Err("missing clientsecret or tls.crt and tls.key".to_string()),
        },
    };

    Ok(SmClientConfig {
        client_id,
        client_secret,
        sm_url,
        token_url,
        token_url_suffix: secret_value(secret, "tokenurlsuffix"),
        tls_cert,
        tls_key,
        subaccount_id: secret_value(secret, "subaccount_id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SM_TLS_SECRET_NAME;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Secrets(BTreeMap<(String, String), Secret>);

    impl Secrets {
        fn with(mut self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..ObjectMeta::default()
                },
                data: Some(
                    data.iter()
                        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                        .collect(),
                ),
                ..Secret::default()
            };
            self.0.insert((namespace.to_string(), name.to_string()), secret);
            self
        }
    }

    #[async_trait]
    impl SecretSource for Secrets {
        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
            Ok(self.0.get(&(namespace.to_string(), name.to_string())).cloned())
        }
    }

    const VALID: &[(&str, &str)] = &[
        ("clientid", "id"),
        ("clientsecret", "secret"),
        ("sm_url", "https://sm.example.com"),
        ("tokenurl", "https://auth.example.com"),
    ];

    fn config(enable_namespace_secrets: bool) -> OperatorConfig {
        OperatorConfig {
            management_namespace: "mgmt".to_string(),
            release_namespace: "mgmt".to_string(),
            enable_namespace_secrets,
            ..OperatorConfig::default()
        }
    }

    fn lookup(namespace: &str) -> CredentialsLookup<'_> {
        CredentialsLookup {
            namespace,
            ..CredentialsLookup::default()
        }
    }

    #[tokio::test]
    async fn test_cluster_default_is_last_resort() {
        let secrets = Secrets::default().with("mgmt", SM_SECRET_NAME, VALID);
        let resolved = resolve_credentials(&secrets, &config(false), lookup("team-a"))
            .await
            .unwrap();
        assert_eq!(resolved.secret_ref.namespace, "mgmt");
        assert_eq!(resolved.secret_ref.name, SM_SECRET_NAME);
        assert_eq!(resolved.config.client_id, "id");
    }

    #[tokio::test]
    async fn test_namespaced_secret_in_management_namespace_wins_over_default() {
        let secrets = Secrets::default()
            .with("mgmt", SM_SECRET_NAME, VALID)
            .with("mgmt", "team-a-sap-btp-service-operator", VALID);
        let resolved = resolve_credentials(&secrets, &config(false), lookup("team-a"))
            .await
            .unwrap();
        assert_eq!(resolved.secret_ref.name, "team-a-sap-btp-service-operator");
    }

    #[tokio::test]
    async fn test_namespace_local_secret_only_when_enabled() {
        let secrets = Secrets::default()
            .with("mgmt", SM_SECRET_NAME, VALID)
            .with("team-a", SM_SECRET_NAME, VALID);

        let resolved = resolve_credentials(&secrets, &config(false), lookup("team-a"))
            .await
            .unwrap();
        assert_eq!(resolved.secret_ref.namespace, "mgmt");

        let resolved = resolve_credentials(&secrets, &config(true), lookup("team-a"))
            .await
            .unwrap();
        assert_eq!(resolved.secret_ref.namespace, "team-a");
    }

    #[tokio::test]
    async fn test_named_access_secret_is_required() {
        let secrets = Secrets::default().with("mgmt", SM_SECRET_NAME, VALID);
        let err = resolve_credentials(
            &secrets,
            &config(false),
            CredentialsLookup {
                namespace: "team-a",
                pinned: None,
                btp_access_secret: Some("subaccount-b"),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CredentialsError::NotFound { ref name, .. } if name == "subaccount-b"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_pinned_secret_skips_resolution() {
        let secrets = Secrets::default()
            .with("mgmt", SM_SECRET_NAME, VALID)
            .with("other", "pinned", VALID);
        let pinned = CredentialSecretRef {
            name: "pinned".to_string(),
            namespace: "other".to_string(),
        };
        let resolved = resolve_credentials(
            &secrets,
            &config(false),
            CredentialsLookup {
                namespace: "team-a",
                pinned: Some(&pinned),
                btp_access_secret: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(resolved.secret_ref, pinned);
    }

    #[tokio::test]
    async fn test_tls_companion_supplies_certificate() {
        let secrets = Secrets::default()
            .with(
                "mgmt",
                SM_SECRET_NAME,
                &[
                    ("clientid", "id"),
                    ("sm_url", "https://sm.example.com"),
                    ("tokenurl", "https://auth.example.com"),
                ],
            )
            .with("mgmt", SM_TLS_SECRET_NAME, &[("tls.crt", "CERT"), ("tls.key", "KEY")]);
        let resolved = resolve_credentials(&secrets, &config(false), lookup("team-a"))
            .await
            .unwrap();
        assert_eq!(resolved.config.tls_cert.as_deref(), Some("CERT"));
        assert_eq!(resolved.config.tls_key.as_deref(), Some("KEY"));
        assert!(resolved.config.client_secret.is_none());
    }

    #[tokio::test]
    async fn test_invalid_and_missing_credentials() {
        let secrets = Secrets::default().with("mgmt", SM_SECRET_NAME, &[("clientid", "id")]);
        let err = resolve_credentials(&secrets, &config(false), lookup("team-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::Invalid { ref reason, .. } if reason == "missing sm_url"));

        let err = resolve_credentials(&Secrets::default(), &config(false), lookup("team-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::NoneFound { .. }));
    }
}
