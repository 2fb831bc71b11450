//! HTTP fetch backend.
//!
//! Not a browser: a session is a `reqwest::Client` with its own cookie
//! jar, and acting at a point is a GET of that URL followed by an HTML
//! scan on the blocking pool.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;
use url::Url;

use portal_orchestrator::{Backend, Credentials, NavPoint, Observation, Session};

use super::page;

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub user_agent: String,
    pub same_origin: bool,
    /// Per-request ceiling. The engine's own unit timeout still applies.
    pub request_timeout: Duration,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            same_origin: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpBackend {
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn open_session(&self, credentials: Option<&Credentials>) -> Result<Box<dyn Session>> {
        let client = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(&self.config.user_agent)
            .cookie_store(true)
            .build()
            .context("building HTTP client")?;
        Ok(Box::new(HttpSession {
            client,
            credentials: credentials.cloned(),
            same_origin: self.config.same_origin,
        }))
    }
}

struct HttpSession {
    client: reqwest::Client,
    credentials: Option<Credentials>,
    same_origin: bool,
}

#[async_trait]
impl Session for HttpSession {
    async fn act_within(&mut self, point: &NavPoint) -> Result<Observation> {
        let url = Url::parse(&point.url).with_context(|| format!("{:?} is not a URL", point.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("unsupported scheme {:?} in {}", url.scheme(), point.url);
        }

        let mut request = self.client.get(url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        let response = request.send().await.context("request failed")?;
        let status = response.status();
        let final_url = response.url().clone();
        if !status.is_success() {
            bail!("GET {} returned {status}", point.url);
        }
        let body = response.text().await.context("reading response body")?;
        debug!("fetched {final_url} ({} bytes, {status})", body.len());

        let same_origin = self.same_origin;
        tokio::task::spawn_blocking(move || page::observe(&body, &final_url, same_origin))
            .await
            .context("page parser panicked")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
