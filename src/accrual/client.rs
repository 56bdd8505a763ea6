use std::time::Duration;

use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::error::AccrualError;

/// What the settlement service knows about one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// The order is not registered upstream yet. Non-fatal; skip this tick.
    NotFound,
    /// Registered or still processing upstream; retry next tick.
    InProgress,
    /// Terminal verdict: the order is either invalid or processed with an
    /// accrual amount.
    Settled {
        status: SettledStatus,
        accrual: Decimal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledStatus {
    Invalid,
    Processed,
}

#[derive(Debug, Clone)]
pub struct AccrualClientConfig {
    pub base_url: String,
    /// Attempts per request for transport-class failures only.
    pub retry_attempts: u32,
    pub retry_wait: Duration,
    pub retry_wait_step: Duration,
    pub request_timeout: Duration,
}

impl Default for AccrualClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            retry_attempts: 3,
            retry_wait: Duration::from_secs(1),
            retry_wait_step: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccrualOrderBody {
    #[allow(dead_code)]
    number: String,
    status: String,
    #[serde(default)]
    accrual: Option<Decimal>,
}

/// Client for the external accrual settlement service.
///
/// Stateless between calls. Retries only transport failures (connection
/// refused, timeout); rate limiting and upstream 5xx responses are surfaced
/// to the caller, which skips the order and lets the next tick retry.
pub struct AccrualClient {
    http: Client,
    config: AccrualClientConfig,
}

impl AccrualClient {
    pub fn new(config: AccrualClientConfig) -> Result<Self, AccrualError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self { http, config })
    }

    pub async fn fetch_order(&self, number: &str) -> Result<SettlementOutcome, AccrualError> {
        let url = format!(
            "{}/api/orders/{number}",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self.get_with_retry(&url).await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(SettlementOutcome::NotFound),
            StatusCode::TOO_MANY_REQUESTS => Err(AccrualError::RateLimited),
            status if status.is_server_error() => Err(AccrualError::Upstream(status.as_u16())),
            StatusCode::OK => {
                let body: AccrualOrderBody = response.json().await?;
                Self::outcome_from_body(body)
            }
            status => Err(AccrualError::UnexpectedStatus(status.as_u16())),
        }
    }

    fn outcome_from_body(body: AccrualOrderBody) -> Result<SettlementOutcome, AccrualError> {
        match body.status.as_str() {
            "REGISTERED" | "PROCESSING" => Ok(SettlementOutcome::InProgress),
            "INVALID" => Ok(SettlementOutcome::Settled {
                status: SettledStatus::Invalid,
                accrual: Decimal::ZERO,
            }),
            "PROCESSED" => Ok(SettlementOutcome::Settled {
                status: SettledStatus::Processed,
                accrual: body.accrual.unwrap_or_default(),
            }),
            _ => Err(AccrualError::UnknownStatus(body.status)),
        }
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, AccrualError> {
        let mut attempt = 0;

        loop {
            match self.http.get(url).send().await {
                Ok(response) => return Ok(response),
                Err(err)
                    if is_transport_error(&err) && attempt + 1 < self.config.retry_attempts =>
                {
                    let wait = self.config.retry_wait + self.config.retry_wait_step * attempt;
                    warn!(error = %err, attempt, wait = ?wait, "accrual request failed, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(AccrualError::Transport(err)),
            }
        }
    }
}

/// Connection-level failures worth an in-call retry. Anything that got an
/// HTTP response through is not transport-classified.
fn is_transport_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}
