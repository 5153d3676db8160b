use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::routing::Endpoint;

const TOKEN_HEADER: &str = "private-token";
const NEXT_PAGE_HEADER: &str = "x-next-page";

/// GitLab REST client bound to a single API endpoint
#[derive(Debug, Clone)]
pub struct GitLabClient {
    client: Client,
    endpoint: Endpoint,
    per_page: u32,
    connect_timeout: Duration,
}

/// Subset of `GET /user` we care about
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentUser {
    #[serde(default)]
    pub username: String,
}

/// One entry of a group project listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub path_with_namespace: String,
    #[serde(default)]
    pub http_url_to_repo: Option<String>,
}

/// Outcome of looking a project up before cloning it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessProbe {
    Accessible,
    /// 403 or 404: the token cannot see the project
    Denied(u16),
    /// Anything else, including transport failures
    Inconclusive(String),
}

/// DNS and TCP reachability of an API host
#[derive(Debug, Clone)]
pub struct HostDiagnosis {
    pub host: String,
    pub port: u16,
    pub addresses: Vec<SocketAddr>,
    pub dns_error: Option<String>,
    pub connect_error: Option<String>,
}

impl HostDiagnosis {
    pub fn resolved(&self) -> bool {
        !self.addresses.is_empty()
    }

    pub fn reachable(&self) -> bool {
        self.resolved() && self.connect_error.is_none()
    }

    pub fn summary(&self) -> String {
        if let Some(err) = &self.dns_error {
            return format!("DNS lookup for {} failed: {}", self.host, err);
        }
        match &self.connect_error {
            Some(err) => format!(
                "{} resolves to {:?} but port {} is unreachable: {}",
                self.host, self.addresses, self.port, err
            ),
            None => format!(
                "{}:{} resolves to {:?} and accepts connections",
                self.host, self.port, self.addresses
            ),
        }
    }
}

impl GitLabClient {
    pub fn new(endpoint: Endpoint, token: &str, config: &Config) -> Result<Self> {
        let mut token_value =
            HeaderValue::from_str(token).context("Access token contains invalid characters")?;
        token_value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, token_value);

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(config.timeouts.connect())
            .timeout(config.timeouts.request())
            .user_agent(concat!("groupmirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            per_page: config.gitlab.per_page.clamp(1, 100),
            connect_timeout: config.timeouts.connect(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Build `<api>/<segments...>`, percent-encoding each segment (`/` becomes `%2F`)
    fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.url().clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("API URL cannot be a base: {}", self.endpoint))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Lightweight authenticated call proving the API is reachable and the token valid
    pub async fn validate_token(&self) -> Result<CurrentUser> {
        let url = self.api_url(&["user"])?;
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.endpoint))?;

        let status = response.status();
        if status != StatusCode::OK {
            bail!("Token validation against {} returned HTTP {}", self.endpoint, status);
        }

        response
            .json::<CurrentUser>()
            .await
            .context("Failed to parse current user response")
    }

    /// Every project of `group` and its subgroups, in listing order
    pub async fn list_group_projects(&self, group: &str) -> Result<Vec<ProjectEntry>> {
        let url = self.api_url(&["groups", group, "projects"])?;
        let per_page = self.per_page.to_string();

        let mut projects = Vec::new();
        let mut page = 1u32;

        loop {
            debug!("GET {} (page {})", url, page);

            let response = self
                .client
                .get(url.clone())
                .query(&[
                    ("include_subgroups", "true"),
                    ("per_page", per_page.as_str()),
                    ("page", page.to_string().as_str()),
                ])
                .send()
                .await
                .with_context(|| format!("Failed to fetch projects of {} page {}", group, page))?;

            let status = response.status();
            if status != StatusCode::OK {
                bail!("Listing projects of {} returned HTTP {}", group, status);
            }

            let next_page = response
                .headers()
                .get(NEXT_PAGE_HEADER)
                .map(|v| v.to_str().unwrap_or_default().trim().to_string());

            let body = response
                .text()
                .await
                .with_context(|| format!("Failed to read projects of {} page {}", group, page))?;

            let entries = parse_listing(&body)
                .with_context(|| format!("Invalid project listing for {} page {}", group, page))?;
            let count = entries.len();
            projects.extend(entries);

            page = match next_page {
                // GitLab sends an empty header on the last page
                Some(next) if next.is_empty() => break,
                Some(next) => match next.parse::<u32>() {
                    Ok(n) if n > page => n,
                    _ => break,
                },
                None if count < self.per_page as usize => break,
                None => page + 1,
            };
        }

        debug!("{} lists {} projects", group, projects.len());
        Ok(projects)
    }

    /// Single lookup deciding whether the token can see `path_with_namespace`
    pub async fn probe_project_access(&self, path_with_namespace: &str) -> AccessProbe {
        let url = match self.api_url(&["projects", path_with_namespace]) {
            Ok(url) => url,
            Err(e) => return AccessProbe::Inconclusive(e.to_string()),
        };

        match self.client.get(url).send().await {
            Ok(response) => match response.status() {
                StatusCode::OK => AccessProbe::Accessible,
                status @ (StatusCode::NOT_FOUND | StatusCode::FORBIDDEN) => {
                    AccessProbe::Denied(status.as_u16())
                }
                status => AccessProbe::Inconclusive(format!("HTTP {}", status)),
            },
            Err(e) => AccessProbe::Inconclusive(e.to_string()),
        }
    }

    /// DNS + TCP probe of the endpoint host, for diagnosing a failed connectivity check
    pub async fn diagnose_host(&self) -> HostDiagnosis {
        diagnose_host(&self.endpoint, self.connect_timeout).await
    }
}

/// Parse one listing page; an empty body or a non-list payload is an error
fn parse_listing(body: &str) -> Result<Vec<ProjectEntry>> {
    if body.trim().is_empty() {
        bail!("empty response body");
    }

    let value: serde_json::Value =
        serde_json::from_str(body).context("response is not valid JSON")?;

    let serde_json::Value::Array(items) = value else {
        bail!("payload is not a list");
    };

    items
        .into_iter()
        .map(|item| serde_json::from_value(item).context("malformed project entry"))
        .collect()
}

pub async fn diagnose_host(endpoint: &Endpoint, connect_timeout: Duration) -> HostDiagnosis {
    let host = endpoint.host().trim_matches(|c| c == '[' || c == ']').to_string();
    let port = endpoint.port();

    let mut diagnosis = HostDiagnosis {
        host: host.clone(),
        port,
        addresses: Vec::new(),
        dns_error: None,
        connect_error: None,
    };

    match timeout(connect_timeout, tokio::net::lookup_host((host.as_str(), port))).await {
        Ok(Ok(addrs)) => diagnosis.addresses = addrs.collect(),
        Ok(Err(e)) => diagnosis.dns_error = Some(e.to_string()),
        Err(_) => diagnosis.dns_error = Some("lookup timed out".to_string()),
    }

    if diagnosis.dns_error.is_none() && diagnosis.addresses.is_empty() {
        diagnosis.dns_error = Some("no addresses returned".to_string());
    }

    if let Some(addr) = diagnosis.addresses.first().copied() {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => diagnosis.connect_error = Some(e.to_string()),
            Err(_) => diagnosis.connect_error = Some("connect timed out".to_string()),
        }
    }

    diagnosis
}
