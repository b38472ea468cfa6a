//! External HTTP API initializer
//!
//! Requests run on a private current-thread runtime so the blocking
//! lifecycle can drive the async client.

use crate::error::{ConfigurationError, InitError, ResourceError};
use crate::initializer::{settings, Initializer, Lifecycle, RetryPolicy};
use crate::initializers::validated;
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;
use toml::Table;

/// Status and body of a completed HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Server errors and rate limiting are worth another attempt
    pub fn is_retryable(&self) -> bool {
        self.status >= 500 || self.status == 429
    }

    /// Decode the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Clone)]
struct ApiSettings {
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
    health_path: String,
    headers: HeaderMap,
}

impl ApiSettings {
    fn parse(config: &Table) -> Result<Self, ConfigurationError> {
        let raw_url = settings::required_str(config, "base_url")?;
        let url = Url::parse(&raw_url).map_err(|e| ConfigurationError::InvalidValue {
            field: "base_url".to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigurationError::InvalidValue {
                field: "base_url".to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let timeout = settings::seconds(config, "timeout", 30.0, false)?;
        let retries = settings::integer_in_range(config, "retries", Some(3), 0, 10)?;
        let delay = settings::seconds(config, "retry_delay", 1.0, true)?;
        let health_path = settings::optional_str(config, "health_path")?.unwrap_or_else(|| "/".to_string());

        let mut headers = HeaderMap::new();
        if let Some(table) = settings::table(config, "headers")? {
            for (name, value) in table {
                let field = format!("headers.{}", name);
                let value = value.as_str().ok_or_else(|| ConfigurationError::InvalidType {
                    field: field.clone(),
                    expected: "string".to_string(),
                })?;
                let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    ConfigurationError::InvalidValue {
                        field: field.clone(),
                        reason: "not a valid header name".to_string(),
                    }
                })?;
                let mut header_value = HeaderValue::from_str(value).map_err(|_| {
                    ConfigurationError::InvalidValue {
                        field: field.clone(),
                        reason: "not a valid header value".to_string(),
                    }
                })?;
                header_value.set_sensitive(true);
                headers.insert(header_name, header_value);
            }
        }

        Ok(Self {
            base_url: raw_url.trim_end_matches('/').to_string(),
            timeout,
            retry: RetryPolicy::new(retries as u32 + 1, delay),
            health_path,
            headers,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// HTTP client bound to its own runtime
struct ApiClient {
    client: Client,
    runtime: Runtime,
}

impl ApiClient {
    fn build(component: &str, settings: &ApiSettings) -> Result<Self, ResourceError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .default_headers(settings.headers.clone())
            .no_proxy()
            .build()
            .map_err(|e| ResourceError::Http {
                url: settings.base_url.clone(),
                message: format!("failed to create HTTP client: {}", e),
            })?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ResourceError::Driver {
                component: component.to_string(),
                message: format!("failed to start async runtime: {}", e),
            })?;
        Ok(Self { client, runtime })
    }

    /// Issue one request
    fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, reqwest::Error> {
        self.runtime.block_on(async {
            let mut request = self.client.request(method, url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok(ApiResponse { status, body })
        })
    }

    /// Issue a request, retrying transport failures and 5xx/429 answers
    ///
    /// A retryable status that persists through every attempt is returned as is.
    fn send_with_retry(
        &self,
        policy: RetryPolicy,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, ResourceError> {
        let mut attempt = 1;
        loop {
            let result = self.send(method.clone(), url, body);
            let retry_reason = match &result {
                Ok(response) if !response.is_retryable() => None,
                Ok(response) => Some(format!("HTTP {}", response.status)),
                Err(e) => Some(e.to_string()),
            };
            match retry_reason {
                Some(reason) if attempt < policy.attempts => {
                    warn!(
                        "{} {} attempt {}/{} failed: {}",
                        method, url, attempt, policy.attempts, reason
                    );
                    attempt += 1;
                    if !policy.delay.is_zero() {
                        thread::sleep(policy.delay);
                    }
                }
                _ => {
                    return result.map_err(|e| ResourceError::Http {
                        url: url.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

/// Verifies an external HTTP API and keeps a configured client
///
/// The API counts as reachable when the health path answers with anything
/// other than a server error or 429.
pub struct ExternalApiInitializer {
    lifecycle: Lifecycle,
    config: Table,
    settings: Option<ApiSettings>,
    client: Option<ApiClient>,
}

impl ExternalApiInitializer {
    pub fn new(name: &str, config: Table) -> Self {
        Self {
            lifecycle: Lifecycle::new(name, "external_api"),
            config,
            settings: None,
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// GET `path` relative to the base URL
    pub fn get(&self, path: &str) -> Result<ApiResponse, InitError> {
        self.request(Method::GET, path, None)
    }

    /// POST a JSON body to `path` relative to the base URL
    pub fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<ApiResponse, InitError> {
        self.request(Method::POST, path, Some(body))
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?;
        let client = self.client.as_ref().ok_or_else(|| ResourceError::NotInitialized {
            component: self.lifecycle.name().to_string(),
        })?;
        let url = settings.url(path);
        debug!("{}: {} {}", self.lifecycle.name(), method, url);
        let response = self
            .lifecycle
            .monitor()
            .measure(self.lifecycle.name(), "request", || {
                client.send_with_retry(settings.retry, method, &url, body)
            })?;
        Ok(response)
    }

    /// Request the health path with the configured retry policy
    fn check_health(
        lifecycle: &mut Lifecycle,
        client: &ApiClient,
        settings: &ApiSettings,
        record: bool,
    ) -> Result<ApiResponse, crate::error::ConnectionError> {
        let url = settings.url(&settings.health_path);
        let attempt = || match client.send(Method::GET, &url, None) {
            Ok(response) if response.is_retryable() => Err(format!("HTTP {}", response.status)),
            Ok(response) => Ok(response),
            Err(e) => Err(e.to_string()),
        };
        if record {
            lifecycle.connect_with_retry(&url, settings.retry, attempt)
        } else {
            lifecycle.retry(&url, settings.retry, attempt)
        }
    }
}

impl Initializer for ExternalApiInitializer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn kind(&self) -> &'static str {
        "external_api"
    }

    fn validate_configuration(&mut self) -> Result<(), ConfigurationError> {
        let parsed = ApiSettings::parse(&self.config);
        self.settings = parsed.as_ref().ok().cloned();
        self.lifecycle.record_validation(parsed.map(|_| ()))
    }

    fn test_connection(&mut self) -> Result<bool, InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        let client = ApiClient::build(self.lifecycle.name(), &settings)?;
        let result = Self::check_health(&mut self.lifecycle, &client, &settings, true);
        if let Ok(response) = &result {
            self.lifecycle
                .status_mut()
                .add_data("health_status", response.status);
        }
        Ok(result.is_ok())
    }

    fn perform_initialization(&mut self) -> Result<(), InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        self.client = None;

        let client = self.lifecycle.perform(|lifecycle| {
            let client = ApiClient::build(lifecycle.name(), &settings)?;
            let response = Self::check_health(lifecycle, &client, &settings, false)?;
            lifecycle.status_mut().add_data("health_status", response.status);
            lifecycle.status_mut().add_data("base_url", settings.base_url.as_str());
            Ok(client)
        })?;
        info!("{}: client ready for {}", self.lifecycle.name(), settings.base_url);
        self.client = Some(client);
        Ok(())
    }

    fn reset(&mut self) {
        self.client = None;
        self.lifecycle.reset();
    }
}
