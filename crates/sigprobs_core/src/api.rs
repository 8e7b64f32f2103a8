use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS, SigprobsConfig};
use crate::error::SigprobsError;
use crate::lint::LintDiagnostic;
use crate::site::SiteInfo;

const SITEINFO_PROPS: &str = "namespaces|namespacealiases|specialpagealiases|magicwords|general";

/// Remote operations the checks depend on, bound to a single site.
pub trait SiteApi {
    fn site_info(&mut self) -> Result<SiteInfo>;
    fn expand_templates(&mut self, wikitext: &str) -> Result<String>;
    fn lint(&mut self, wikitext: &str) -> Result<Vec<LintDiagnostic>>;
    fn user_exists(&mut self, username: &str) -> Result<bool>;
    /// Raw text of `MediaWiki:Signature`, with `$1`/`$2` placeholders intact.
    fn signature_template(&mut self) -> Result<String>;
    fn request_count(&self) -> usize;
}

/// Bounded retry with exponential backoff (`base * 3^attempt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(3u64.saturating_pow(exponent)),
        )
    }

    /// Runs `call` until it succeeds or the attempts run out. The final failure is
    /// reported as [`SigprobsError::UpstreamUnavailable`].
    pub fn run<T, F>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = None::<anyhow::Error>;
        for attempt in 0..attempts {
            match call() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt + 1 < attempts {
                        let delay = self.delay_for(attempt);
                        info!(
                            operation,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "request failed, sleeping before retry: {error:#}"
                        );
                        sleep(delay);
                    }
                    last_error = Some(error);
                }
            }
        }

        let message = last_error
            .map(|error| format!("{error:#}"))
            .unwrap_or_else(|| "request failed".to_string());
        Err(SigprobsError::UpstreamUnavailable {
            operation: operation.to_string(),
            message,
        }
        .into())
    }
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub hostname: String,
    pub scheme: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &SigprobsConfig, hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            scheme: config.scheme(),
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
            retry: RetryPolicy {
                attempts: config.retry_attempts(),
                base_delay_ms: config.retry_base_delay_ms(),
            },
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn site_url(&self, path: &str) -> String {
        format!("{}://{}{}", self.config.scheme, self.config.hostname, path)
    }

    fn api_get(&mut self, operation: &str, params: &[(&str, String)]) -> Result<Value> {
        let retry = self.config.retry;
        retry.run(operation, || self.send_api(params, false))
    }

    fn api_post(&mut self, operation: &str, params: &[(&str, String)]) -> Result<Value> {
        let retry = self.config.retry;
        retry.run(operation, || self.send_api(params, true))
    }

    fn send_api(&mut self, params: &[(&str, String)], as_post: bool) -> Result<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            pairs.push(((*key).to_string(), value.clone()));
        }

        let url = self.site_url("/w/api.php");
        self.request_count += 1;
        let request = if as_post {
            self.client.post(&url).form(&pairs)
        } else {
            self.client.get(&url).query(&pairs)
        };
        let response = request
            .send()
            .with_context(|| format!("failed to call MediaWiki API at {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki API request failed with HTTP {status}");
        }

        let payload: Value = response
            .json()
            .context("failed to decode MediaWiki API JSON response")?;
        if let Some(error) = payload.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            let info = error
                .get("info")
                .and_then(Value::as_str)
                .unwrap_or("unknown info");
            bail!("MediaWiki API error [{code}]: {info}");
        }
        Ok(payload)
    }

    fn send_lint(&mut self, wikitext: &str) -> Result<Vec<LintDiagnostic>> {
        let url = self.site_url("/api/rest_v1/transform/wikitext/to/lint");
        self.request_count += 1;
        let response = self
            .client
            .post(&url)
            .json(&json!({ "wikitext": wikitext }))
            .send()
            .with_context(|| format!("failed to call lint endpoint at {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("lint request failed with HTTP {status}");
        }
        response
            .json::<Vec<LintDiagnostic>>()
            .context("failed to decode lint response")
    }

    fn send_raw_page(&mut self, title: &str) -> Result<String> {
        let url = self.site_url("/w/index.php");
        self.request_count += 1;
        let response = self
            .client
            .get(&url)
            .query(&[("title", title), ("action", "raw")])
            .send()
            .with_context(|| format!("failed to fetch raw page {title}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("raw page request for {title} failed with HTTP {status}");
        }
        response.text().context("failed to read raw page body")
    }
}

impl SiteApi for MediaWikiClient {
    fn site_info(&mut self) -> Result<SiteInfo> {
        debug!(host = %self.config.hostname, "fetching site metadata");
        let payload = self.api_get(
            "siteinfo",
            &[
                ("action", "query".to_string()),
                ("meta", "siteinfo".to_string()),
                ("siprop", SITEINFO_PROPS.to_string()),
            ],
        )?;
        let parsed: SiteInfoResponse =
            serde_json::from_value(payload).context("failed to decode siteinfo response")?;
        Ok(parsed.query)
    }

    fn expand_templates(&mut self, wikitext: &str) -> Result<String> {
        let payload = self.api_post(
            "expandtemplates",
            &[
                ("action", "expandtemplates".to_string()),
                ("text", wikitext.to_string()),
                ("prop", "wikitext".to_string()),
            ],
        )?;
        payload
            .get("expandtemplates")
            .and_then(|value| value.get("wikitext"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("invalid expandtemplates response shape"))
    }

    fn lint(&mut self, wikitext: &str) -> Result<Vec<LintDiagnostic>> {
        let retry = self.config.retry;
        retry.run("lint", || self.send_lint(wikitext))
    }

    fn user_exists(&mut self, username: &str) -> Result<bool> {
        let payload = self.api_get(
            "users",
            &[
                ("action", "query".to_string()),
                ("list", "users".to_string()),
                ("ususers", username.to_string()),
            ],
        )?;
        let user = payload
            .get("query")
            .and_then(|value| value.get("users"))
            .and_then(Value::as_array)
            .and_then(|users| users.first())
            .ok_or_else(|| anyhow::anyhow!("invalid users response shape"))?;
        Ok(user.get("missing").is_none() && user.get("invalid").is_none())
    }

    fn signature_template(&mut self) -> Result<String> {
        let retry = self.config.retry;
        retry.run("signature-template", || {
            self.send_raw_page("MediaWiki:Signature")
        })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize)]
struct SiteInfoResponse {
    query: SiteInfo,
}
