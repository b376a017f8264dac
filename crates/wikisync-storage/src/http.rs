//! GraphQL HTTP client with bounded concurrency and a sliding-window request budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};

use crate::RemoteError;

#[derive(Debug, Clone, Copy)]
pub struct RateBudgetConfig {
    pub max_requests: u32,
    pub window: Duration,
}

/// At most `max_requests` acquisitions within any trailing `window`.
#[derive(Debug)]
pub struct RateBudget {
    max_requests: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateBudget {
    pub fn new(config: RateBudgetConfig) -> Self {
        Self {
            max_requests: config.max_requests.max(1) as usize,
            window: config.window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut issued = self.issued.lock().await;
            let now = Instant::now();
            while issued
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                issued.pop_front();
            }

            if issued.len() < self.max_requests {
                issued.push_back(now);
                return;
            }

            let sleep_for = issued
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            drop(issued);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }

    pub async fn in_flight_window(&self) -> usize {
        let issued = self.issued.lock().await;
        let now = Instant::now();
        issued
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct GraphqlClientConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub rate_budget: Option<RateBudgetConfig>,
}

impl Default for GraphqlClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4000/graphql".to_string(),
            api_token: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            rate_budget: None,
        }
    }
}

#[derive(Debug)]
pub struct GraphqlClient {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    global_limit: Arc<Semaphore>,
    budget: Option<Arc<RateBudget>>,
}

impl GraphqlClient {
    pub fn new(config: GraphqlClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            api_token: config.api_token,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            budget: config.rate_budget.map(|c| Arc::new(RateBudget::new(c))),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Execute one query and return its `data` object. Retries are the caller's concern.
    pub async fn query(
        &self,
        operation: &str,
        query: &str,
        variables: JsonValue,
    ) -> Result<JsonValue, RemoteError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| RemoteError::Closed)?;
        if let Some(budget) = &self.budget {
            budget.acquire().await;
        }

        let span = info_span!("graphql_query", operation, endpoint = %self.endpoint);
        async {
            let mut request = self
                .client
                .post(&self.endpoint)
                .json(&json!({ "query": query, "variables": variables }));
            if let Some(token) = &self.api_token {
                request = request.bearer_auth(token);
            }

            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(RemoteError::from_status(status, resp.url().to_string()));
            }

            let body: JsonValue = resp.json().await?;
            extract_data(body)
        }
        .instrument(span)
        .await
    }
}

/// Split a GraphQL response envelope into its `data` payload or an error.
pub fn extract_data(mut body: JsonValue) -> Result<JsonValue, RemoteError> {
    if let Some(errors) = body.get("errors").and_then(JsonValue::as_array) {
        if !errors.is_empty() {
            let message = errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("unknown error")
                        .to_string()
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RemoteError::Graphql(message));
        }
    }
    match body.get_mut("data").map(JsonValue::take) {
        Some(data) if !data.is_null() => Ok(data),
        _ => Err(RemoteError::Decode("response has no data".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphql_errors_win_over_data() {
        let err = extract_data(json!({
            "data": null,
            "errors": [{"message": "Rate limit exceeded"}, {"message": "try later"}]
        }))
        .expect_err("errors present");
        assert!(matches!(
            err,
            RemoteError::Graphql(ref m) if m == "Rate limit exceeded; try later"
        ));
    }

    #[test]
    fn data_is_extracted() {
        let data = extract_data(json!({"data": {"pages": {"edges": []}}})).expect("data");
        assert!(data["pages"]["edges"].as_array().expect("edges").is_empty());
        assert!(matches!(
            extract_data(json!({"data": null})),
            Err(RemoteError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn budget_blocks_once_window_is_full() {
        let budget = RateBudget::new(RateBudgetConfig {
            max_requests: 2,
            window: Duration::from_millis(50),
        });
        let started = Instant::now();
        budget.acquire().await;
        budget.acquire().await;
        assert_eq!(budget.in_flight_window().await, 2);
        budget.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
