//! HTTP 行情数据源

use super::MarketDataSource;
use crate::device::AlgorithmId;
use crate::error::MiningError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// 从 JSON 接口拉取收益率
///
/// 接口返回 `{ "<algorithm>": <rate>, ... }`，也可以嵌套在 `rates_field` 字段下。
pub struct HttpMarketSource {
    client: reqwest::Client,
    url: Url,
    rates_field: Option<String>,
}

impl HttpMarketSource {
    pub fn new(url: &str, timeout: Duration, rates_field: Option<String>) -> Result<Self, MiningError> {
        let url = Url::parse(url).map_err(|e| MiningError::Config {
            field: "market.source_url".to_string(),
            reason: e.to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("switchminer-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MiningError::Config {
                field: "market".to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            url,
            rates_field,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketSource {
    async fn fetch(&self) -> Result<BTreeMap<AlgorithmId, f64>, MiningError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| MiningError::FeedUnavailable { reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MiningError::FeedUnavailable {
                reason: format!("HTTP {} from {}", status, self.url),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| MiningError::FeedUnavailable { reason: format!("invalid JSON: {}", e) })?;

        let rates = parse_rates(&body, self.rates_field.as_deref())?;
        debug!("Fetched {} rates from {}", rates.len(), self.url);
        Ok(rates)
    }
}

/// 解析收益率对象，非数值项被忽略
pub fn parse_rates(
    body: &Value,
    rates_field: Option<&str>,
) -> Result<BTreeMap<AlgorithmId, f64>, MiningError> {
    let object = match rates_field {
        Some(field) => body.get(field),
        None => Some(body),
    }
    .and_then(Value::as_object)
    .ok_or_else(|| MiningError::FeedUnavailable {
        reason: format!("rates object '{}' missing", rates_field.unwrap_or("<root>")),
    })?;

    Ok(object
        .iter()
        .filter_map(|(algorithm, rate)| {
            let rate = match rate {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }?;
            (rate.is_finite() && rate >= 0.0).then(|| (AlgorithmId::new(algorithm.as_str()), rate))
        })
        .collect())
}
