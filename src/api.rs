//! Server API client.
//!
//! The sync engine, the cache refresher and the connectivity probe talk to the
//! server through [`RemoteApi`]. [`HttpRemote`] is the production
//! implementation; every request it makes carries an explicit timeout.

use std::future::Future;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::TerminalConfig;
use crate::error::{OfflineError, Result};
use crate::models::Collection;

/// Definitive answer to a sale submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { server_reference: String },
    Rejected { message: String },
}

/// Body of the payment status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentStatusResponse {
    pub success: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// The server contract consumed by this crate.
///
/// `submit_sale` returns `Err(TransportFailure)` whenever no definitive
/// answer was obtained; only a well-formed response maps to a
/// [`SubmitOutcome`].
pub trait RemoteApi: Send + Sync + 'static {
    fn submit_sale(&self, body: &Value) -> impl Future<Output = Result<SubmitOutcome>> + Send;

    fn fetch_collection(
        &self,
        collection: Collection,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// `true` when the server is reachable. Any HTTP response counts, whatever
    /// its status; only a transport error means unreachable.
    fn check_health(&self) -> impl Future<Output = bool> + Send;

    fn payment_status(
        &self,
        checkout_request_id: &str,
    ) -> impl Future<Output = Result<PaymentStatusResponse>> + Send;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a readable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a readable message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Terminal session is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Server endpoint not found".to_string(),
        s if s >= 500 => format!("Server error (HTTP {s})"),
        s => format!("Unexpected response from server (HTTP {s})"),
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 160 {
        format!("{}...", trimmed.chars().take(160).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutResponse {
    success: bool,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Classify a checkout response.
///
/// The server answers with `{ success, reference?, message? }`, also on
/// non-2xx statuses. A body that does not parse (proxy error page, truncated
/// response) is not a definitive answer and is treated as a transport
/// failure. So is `success: true` without a reference, since the sale cannot
/// be marked synced without one and a resubmission is deduplicated by the
/// server.
pub fn classify_checkout_response(status: StatusCode, body: &str) -> Result<SubmitOutcome> {
    let parsed: CheckoutResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return Err(OfflineError::TransportFailure(if body.trim().is_empty() {
                format!("{} with empty body", status_error(status))
            } else {
                format!("{}: {}", status_error(status), snippet(body))
            }));
        }
    };

    if parsed.success {
        match parsed.reference.map(|r| r.trim().to_string()) {
            Some(reference) if !reference.is_empty() => Ok(SubmitOutcome::Accepted {
                server_reference: reference,
            }),
            _ => Err(OfflineError::TransportFailure(
                "server accepted the sale without a reference".to_string(),
            )),
        }
    } else {
        let message = parsed
            .message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| status_error(status));
        Ok(SubmitOutcome::Rejected { message })
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpRemote {
    client: Client,
    probe_client: Client,
    config: TerminalConfig,
}

impl HttpRemote {
    pub fn new(config: &TerminalConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| OfflineError::Config(format!("Failed to create HTTP client: {e}")))?;
        let probe_client = Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| OfflineError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            probe_client,
            config: config.clone(),
        })
    }

    /// Payment status URL with the checkout id as one percent-encoded segment.
    pub(crate) fn payment_status_url(&self, checkout_request_id: &str) -> Result<Url> {
        let base = self.config.url(&self.config.payment_status_path);
        let mut url = Url::parse(&base)
            .map_err(|e| OfflineError::Config(format!("Invalid server URL {base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| OfflineError::Config(format!("Invalid server URL: {base}")))?
            .pop_if_empty()
            .push(checkout_request_id.trim());
        Ok(url)
    }

    async fn get_json(&self, path: &str) -> Result<(StatusCode, String)> {
        let base = self.config.url(path);
        let url = Url::parse(&base)
            .map_err(|e| OfflineError::Config(format!("Invalid server URL {base}: {e}")))?;
        self.get_text(url).await
    }

    async fn get_text(&self, url: Url) -> Result<(StatusCode, String)> {
        let label = url.to_string();
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| OfflineError::TransportFailure(friendly_error(&label, &e)))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| OfflineError::TransportFailure(friendly_error(&label, &e)))?;
        Ok((status, body))
    }
}

impl RemoteApi for HttpRemote {
    async fn submit_sale(&self, body: &Value) -> Result<SubmitOutcome> {
        let url = self.config.url(&self.config.sale_path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| OfflineError::TransportFailure(friendly_error(&url, &e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| OfflineError::TransportFailure(friendly_error(&url, &e)))?;
        debug!(status = status.as_u16(), "checkout response received");
        classify_checkout_response(status, &text)
    }

    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        let path = match collection {
            Collection::Products => &self.config.products_path,
            Collection::Customers => &self.config.customers_path,
        };
        let (status, body) = self.get_json(path).await?;
        if !status.is_success() {
            return Err(OfflineError::TransportFailure(status_error(status)));
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Array(records)) => Ok(records),
            Ok(_) => Err(OfflineError::RefreshFailure(format!(
                "{} response is not an array",
                collection.as_str()
            ))),
            Err(e) => Err(OfflineError::RefreshFailure(format!(
                "Invalid JSON from server: {e}"
            ))),
        }
    }

    async fn check_health(&self) -> bool {
        let url = self.config.url(&self.config.health_path);
        match self.probe_client.get(&url).send().await {
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "server reachable");
                true
            }
            Err(e) => {
                debug!("health probe failed: {}", friendly_error(&url, &e));
                false
            }
        }
    }

    async fn payment_status(&self, checkout_request_id: &str) -> Result<PaymentStatusResponse> {
        let url = self.payment_status_url(checkout_request_id)?;
        let (status, body) = self.get_text(url).await?;
        serde_json::from_str::<PaymentStatusResponse>(&body).map_err(|_| {
            OfflineError::TransportFailure(format!("{}: {}", status_error(status), snippet(&body)))
        })
    }
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("server_url", &self.config.server_url)
            .finish()
    }
}

/// Log-friendly description of the configured server, used at startup.
pub fn describe(config: &TerminalConfig) {
    info!(
        server_url = %config.server_url,
        timeout_secs = config.request_timeout_secs,
        "server API client configured"
    );
}
