//! # Service Manager REST Client
//!
//! reqwest implementation of [`ServiceManagerClient`].
//!
//! - OAuth2 client-credentials token, authenticated by client secret or mTLS identity
//! - Plan resolution by offering and plan catalog name
//! - Mutating calls are sent with `async=true`; a `202 Accepted` yields the
//!   `Location` header as operation URL
//! - SM error bodies (`error`, `description`) and `Retry-After` are captured in [`SmError`]

use crate::observability::metrics;
use crate::provider::error::parse_retry_after;
use crate::provider::{
    BindRequest, BindResponse, ClientFactory, ListQuery, Operation, ProvisionRequest,
    ProvisionResponse, ServiceBindingRecord, ServiceInstanceRecord, ServiceManagerClient,
    SmClientConfig, SmError, UpdateRequest,
};
use async_trait::async_trait;
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info_span, Instrument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_SUFFIX: &str = "/oauth/token";
// Refresh tokens this long before they expire
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SmErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct InstanceBody {
    id: String,
    #[serde(default)]
    service_plan_id: Option<String>,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    labels: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct BindingBody {
    id: String,
    #[serde(default)]
    credentials: Option<Value>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Service Manager REST client for one tenant
pub struct HttpServiceManagerClient {
    http_client: Client,
    config: SmClientConfig,
    token: AsyncMutex<Option<CachedToken>>,
}

impl std::fmt::Debug for HttpServiceManagerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServiceManagerClient")
            .field("sm_url", &self.config.sm_url)
            .field("client_id", &self.config.client_id)
            .field("access_token", &"***")
            .finish_non_exhaustive()
    }
}

impl HttpServiceManagerClient {
    pub fn new(config: SmClientConfig) -> Result<Self, SmError> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);

        if config.client_secret.is_none() {
            let (cert, key) = match (&config.tls_cert, &config.tls_key) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    return Err(SmError::Config(
                        "either a client secret or a TLS certificate and key are required"
                            .to_string(),
                    ))
                }
            };
            let mut pem = cert.clone().into_bytes();
            pem.push(b'\n');
            pem.extend_from_slice(key.as_bytes());
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| SmError::Config(format!("invalid TLS identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let http_client = builder
            .build()
            .map_err(|e| SmError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            config,
            token: AsyncMutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.sm_url.trim_end_matches('/'), path)
        }
    }

    async fn access_token(&self) -> Result<String, SmError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let suffix = self
            .config
            .token_url_suffix
            .as_deref()
            .unwrap_or(DEFAULT_TOKEN_SUFFIX);
        let token_url = format!("{}{}", self.config.token_url.trim_end_matches('/'), suffix);

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http_client
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| SmError::Transport(format!("token request failed: {e}")))?;
        let response = Self::check(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SmError::Decode(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_SLACK),
        });
        Ok(token.access_token)
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Response, SmError> {
        let span = info_span!("sm.request", operation = operation, method = %method, path = path);
        async {
            metrics::increment_sm_operations(operation);
            let token = self.access_token().await?;
            let mut request = self
                .http_client
                .request(method, self.url(path))
                .bearer_auth(token)
                .header(header::ACCEPT, "application/json");
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(&body);
            }
            let response = request
                .send()
                .await
                .map_err(|e| SmError::Transport(e.to_string()))?;
            debug!(status = response.status().as_u16(), "sm.response");
            Self::check(response).await
        }
        .instrument(span)
        .await
        .inspect_err(|_| metrics::increment_sm_operation_errors(operation))
    }

    /// Turn a non-success response into [`SmError::Api`]
    async fn check(response: Response) -> Result<Response, SmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, chrono::Utc::now()));
        let text = response.text().await.unwrap_or_default();
        let (error_type, description) = match serde_json::from_str::<SmErrorBody>(&text) {
            Ok(body) => (body.error, body.description),
            Err(_) => (
                status.canonical_reason().unwrap_or("Error").to_string(),
                text,
            ),
        };
        Err(SmError::Api {
            status_code: status.as_u16(),
            error_type,
            description,
            retry_after,
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SmError> {
        response
            .json::<T>()
            .await
            .map_err(|e| SmError::Decode(e.to_string()))
    }

    fn location(response: &Response) -> Option<String> {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    async fn resolve_plan_id(&self, offering_name: &str, plan_name: &str) -> Result<String, SmError> {
        let response = self
            .send(
                "list_offerings",
                Method::GET,
                "/v1/service_offerings",
                &[("fieldQuery", format!("catalog_name eq '{offering_name}'"))],
                None,
            )
            .await?;
        let offerings: ListResponse<IdOnly> = Self::decode(response).await?;
        let offering = offerings.items.into_iter().next().ok_or_else(|| {
            SmError::api(
                404,
                "NotFound",
                format!("couldn't find the service offering '{offering_name}'"),
            )
        })?;

        let response = self
            .send(
                "list_plans",
                Method::GET,
                "/v1/service_plans",
                &[(
                    "fieldQuery",
                    format!(
                        "catalog_name eq '{plan_name}' and service_offering_id eq '{}'",
                        offering.id
                    ),
                )],
                None,
            )
            .await?;
        let plans: ListResponse<IdOnly> = Self::decode(response).await?;
        plans.items.into_iter().next().map(|p| p.id).ok_or_else(|| {
            SmError::api(
                404,
                "NotFound",
                format!("couldn't find the service plan '{plan_name}' for offering '{offering_name}'"),
            )
        })
    }

    async fn plan_id(
        &self,
        plan_id: Option<&String>,
        offering_name: &str,
        plan_name: &str,
    ) -> Result<String, SmError> {
        match plan_id {
            Some(id) if !id.is_empty() => Ok(id.clone()),
            _ => self.resolve_plan_id(offering_name, plan_name).await,
        }
    }
}

/// Resource ID embedded in an operation URL (`/v1/<kind>/<id>/operations/<op>`)
pub fn resource_id_from_operation_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments
        .iter()
        .position(|s| *s == "operations")
        .and_then(|idx| idx.checked_sub(1))
        .and_then(|idx| segments.get(idx))
        .map(|id| id.to_string())
}

fn async_query() -> [(&'static str, String); 1] {
    [("async", "true".to_string())]
}

#[async_trait]
impl ServiceManagerClient for HttpServiceManagerClient {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, SmError> {
        let plan_id = self
            .plan_id(request.plan_id.as_ref(), &request.offering_name, &request.plan_name)
            .await?;

        let mut labels = request.labels.clone();
        if let Some(subaccount) = &request.subaccount_id {
            labels.insert("subaccount_id".to_string(), vec![subaccount.clone()]);
        }
        let mut body = json!({
            "name": request.name,
            "service_plan_id": plan_id,
            "parameters": request.parameters,
            "labels": labels,
        });
        if let Some(dc) = &request.data_center {
            body["data_center"] = json!(dc);
        }

        let response = self
            .send(
                "provision",
                Method::POST,
                "/v1/service_instances",
                &async_query(),
                Some(body),
            )
            .await?;

        if response.status() == StatusCode::ACCEPTED {
            let location = Self::location(&response).ok_or_else(|| {
                SmError::Decode("202 Accepted without Location header".to_string())
            })?;
            return Ok(ProvisionResponse {
                instance_id: resource_id_from_operation_url(&location).unwrap_or_default(),
                plan_id: Some(plan_id),
                subaccount_id: request.subaccount_id.clone(),
                tags: Vec::new(),
                operation_url: Some(location),
            });
        }

        let instance: InstanceBody = Self::decode(response).await?;
        let subaccount_id = instance
            .context
            .as_ref()
            .and_then(|c| c.get("subaccount_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| request.subaccount_id.clone());
        let tags = instance.labels.get("tags").cloned().unwrap_or_default();
        Ok(ProvisionResponse {
            instance_id: instance.id,
            plan_id: instance.service_plan_id.or(Some(plan_id)),
            subaccount_id,
            tags,
            operation_url: None,
        })
    }

    async fn update(&self, request: &UpdateRequest) -> Result<Option<String>, SmError> {
        let plan_id = self
            .plan_id(request.plan_id.as_ref(), &request.offering_name, &request.plan_name)
            .await?;
        let body = json!({
            "name": request.name,
            "service_plan_id": plan_id,
            "parameters": request.parameters,
        });
        let response = self
            .send(
                "update",
                Method::PATCH,
                &format!("/v1/service_instances/{}", request.instance_id),
                &async_query(),
                Some(body),
            )
            .await?;
        Ok(Self::location(&response).filter(|_| response.status() == StatusCode::ACCEPTED))
    }

    async fn deprovision(&self, instance_id: &str) -> Result<Option<String>, SmError> {
        let response = self
            .send(
                "deprovision",
                Method::DELETE,
                &format!("/v1/service_instances/{instance_id}"),
                &async_query(),
                None,
            )
            .await?;
        Ok(Self::location(&response).filter(|_| response.status() == StatusCode::ACCEPTED))
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, SmError> {
        let body = json!({
            "name": request.name,
            "service_instance_id": request.instance_id,
            "parameters": request.parameters,
            "labels": request.labels,
        });
        let response = self
            .send(
                "bind",
                Method::POST,
                "/v1/service_bindings",
                &async_query(),
                Some(body),
            )
            .await?;

        if response.status() == StatusCode::ACCEPTED {
            let location = Self::location(&response).ok_or_else(|| {
                SmError::Decode("202 Accepted without Location header".to_string())
            })?;
            return Ok(BindResponse {
                binding_id: resource_id_from_operation_url(&location).unwrap_or_default(),
                credentials: None,
                operation_url: Some(location),
            });
        }

        let binding: BindingBody = Self::decode(response).await?;
        Ok(BindResponse {
            binding_id: binding.id,
            credentials: binding.credentials,
            operation_url: None,
        })
    }

    async fn unbind(&self, binding_id: &str) -> Result<Option<String>, SmError> {
        let response = self
            .send(
                "unbind",
                Method::DELETE,
                &format!("/v1/service_bindings/{binding_id}"),
                &async_query(),
                None,
            )
            .await?;
        Ok(Self::location(&response).filter(|_| response.status() == StatusCode::ACCEPTED))
    }

    async fn status(&self, operation_url: &str) -> Result<Operation, SmError> {
        let response = self
            .send("status", Method::GET, operation_url, &[], None)
            .await?;
        Self::decode(response).await
    }

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<ServiceInstanceRecord>, SmError> {
        let response = self
            .send(
                "list_instances",
                Method::GET,
                "/v1/service_instances",
                &[("labelQuery", query.label_query())],
                None,
            )
            .await?;
        let list: ListResponse<ServiceInstanceRecord> = Self::decode(response).await?;
        Ok(list.items)
    }

    async fn list_bindings(&self, query: &ListQuery) -> Result<Vec<ServiceBindingRecord>, SmError> {
        let response = self
            .send(
                "list_bindings",
                Method::GET,
                "/v1/service_bindings",
                &[("labelQuery", query.label_query())],
                None,
            )
            .await?;
        let list: ListResponse<ServiceBindingRecord> = Self::decode(response).await?;
        Ok(list.items)
    }

    async fn get_binding(&self, binding_id: &str) -> Result<ServiceBindingRecord, SmError> {
        let response = self
            .send(
                "get_binding",
                Method::GET,
                &format!("/v1/service_bindings/{binding_id}"),
                &[],
                None,
            )
            .await?;
        Self::decode(response).await
    }

    async fn share(&self, instance_id: &str) -> Result<(), SmError> {
        self.send(
            "share",
            Method::PATCH,
            &format!("/v1/service_instances/{instance_id}"),
            &[],
            Some(json!({"shared": true})),
        )
        .await
        .map(|_| ())
    }

    async fn unshare(&self, instance_id: &str) -> Result<(), SmError> {
        self.send(
            "unshare",
            Method::PATCH,
            &format!("/v1/service_instances/{instance_id}"),
            &[],
            Some(json!({"shared": false})),
        )
        .await
        .map(|_| ())
    }
}

/// Factory caching one HTTP client per credential set so tokens are reused
#[derive(Default)]
pub struct HttpClientFactory {
    clients: Mutex<HashMap<String, Arc<HttpServiceManagerClient>>>,
}

impl std::fmt::Debug for HttpClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientFactory").finish_non_exhaustive()
    }
}

impl HttpClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_key(config: &SmClientConfig) -> String {
        let material = format!(
            "{}|{}|{}|{}|{}|{}",
            config.client_id,
            config.sm_url,
            config.token_url,
            config.client_secret.as_deref().unwrap_or_default(),
            config.tls_cert.as_deref().unwrap_or_default(),
            config.tls_key.as_deref().unwrap_or_default(),
        );
        format!("{:x}", md5::compute(material.as_bytes()))
    }
}

impl ClientFactory for HttpClientFactory {
    fn client(&self, config: &SmClientConfig) -> Result<Arc<dyn ServiceManagerClient>, SmError> {
        let key = Self::cache_key(config);
        let mut clients = self
            .clients
            .lock()
            .map_err(|e| SmError::Config(format!("client cache poisoned: {e}")))?;
        if let Some(client) = clients.get(&key) {
            return Ok(Arc::clone(client) as Arc<dyn ServiceManagerClient>);
        }
        let client = Arc::new(HttpServiceManagerClient::new(config.clone())?);
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_from_operation_url() {
        assert_eq!(
            resource_id_from_operation_url("/v1/service_instances/i-1/operations/op-9"),
            Some("i-1".to_string())
        );
        assert_eq!(
            resource_id_from_operation_url("https://sm.example/v1/service_bindings/b-2/operations/op?x=1"),
            Some("b-2".to_string())
        );
        assert_eq!(resource_id_from_operation_url("/op/42"), None);
    }

    #[test]
    fn test_client_requires_secret_or_certificate() {
        let config = SmClientConfig {
            client_id: "id".to_string(),
            client_secret: None,
            sm_url: "https://sm.example".to_string(),
            token_url: "https://auth.example".to_string(),
            token_url_suffix: None,
            tls_cert: None,
            tls_key: None,
            subaccount_id: None,
        };
        assert!(matches!(
            HttpServiceManagerClient::new(config),
            Err(SmError::Config(_))
        ));
    }
}
