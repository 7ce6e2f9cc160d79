use std::time::Duration;

use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{connection::AuthToken, errors::RestError};

const ERROR_BODY_PREVIEW_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDetails {
    pub contract_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "de_f64_lossy")]
    pub buy_price: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_lossy")]
    pub bid_price: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_lossy")]
    pub profit: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellReceipt {
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default, deserialize_with = "de_f64_lossy")]
    pub sold_for: Option<f64>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone)]
pub struct ContractsClient {
    base_url: String,
    timeout_ms: u64,
    http_client: reqwest::Client,
}

impl ContractsClient {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self, RestError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| RestError::Client(format!("failed to build reqwest client: {err}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_ms,
            http_client,
        })
    }

    pub async fn fetch_contract_details(
        &self,
        token: &AuthToken,
        contract_id: &str,
    ) -> Result<ContractDetails, RestError> {
        let url = format!("{}/contracts/{}", self.base_url, contract_path(contract_id)?);
        let request = self.http_client.get(url);
        self.execute(request, token).await
    }

    pub async fn sell_contract(
        &self,
        token: &AuthToken,
        contract_id: &str,
    ) -> Result<SellReceipt, RestError> {
        let url = format!(
            "{}/contracts/{}/sell",
            self.base_url,
            contract_path(contract_id)?
        );
        let request = self.http_client.post(url).body("{}");
        self.execute(request, token).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        token: &AuthToken,
    ) -> Result<T, RestError> {
        let response = request
            .bearer_auth(token.expose())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| self.map_transport_error(err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.map_transport_error(err))?;

        if status != StatusCode::OK {
            tracing::warn!(status = status.as_u16(), "contracts request rejected");
            return Err(RestError::Status {
                status: status.as_u16(),
                body: truncate(&body, ERROR_BODY_PREVIEW_CHARS),
            });
        }

        serde_json::from_str::<T>(&body).map_err(|err| {
            RestError::Data(format!(
                "{err}; body={}",
                truncate(&body, ERROR_BODY_PREVIEW_CHARS)
            ))
        })
    }

    fn map_transport_error(&self, err: reqwest::Error) -> RestError {
        if err.is_timeout() {
            return RestError::Timeout {
                timeout_ms: self.timeout_ms,
            };
        }
        RestError::Request(err.to_string())
    }
}

fn contract_path(contract_id: &str) -> Result<&str, RestError> {
    let trimmed = contract_id.trim();
    if trimmed.is_empty() {
        return Err(RestError::Client("`contract_id` cannot be empty".to_string()));
    }
    if !trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        return Err(RestError::Client(format!(
            "`contract_id` `{trimmed}` contains unsupported characters"
        )));
    }
    if trimmed.chars().all(|ch| ch == '.') {
        return Err(RestError::Client(format!(
            "`contract_id` `{trimmed}` is not a contract id"
        )));
    }
    Ok(trimmed)
}

fn de_f64_lossy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| {
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|text| text.trim().parse::<f64>().ok()))
    }))
}

fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }

    let shortened: String = value.chars().take(limit).collect();
    format!("{shortened}...")
}
