//! External artist catalog access.
//!
//! [`CatalogApi`] is the seam the enrichment client talks to;
//! [`SpotifyCatalogApi`] is the `ureq`-backed implementation.

use std::time::Duration;

use base64::Engine as _;
use log::debug;
use serde_json::Value;

use crate::error::CatalogError;

pub const DEFAULT_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const DEFAULT_SEARCH_URL: &str = "https://api.spotify.com/v1/search";
const SEARCH_RESULT_LIMIT: usize = 10;
/// Longest server-imposed wait honoured from a `Retry-After` header.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);
const USER_AGENT: &str = concat!("tunelens/", env!("CARGO_PKG_VERSION"));

/// Client-credentials pair for the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// One artist returned by a catalog search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogArtist {
    pub name: String,
    pub genres: Vec<String>,
}

/// Interface implemented by catalog transports.
pub trait CatalogApi {
    /// Exchanges client credentials for a bearer token.
    fn request_token(&self, credentials: &ClientCredentials) -> Result<String, CatalogError>;
    /// Looks up a batch of artist names in a single request.
    fn search_artists(&self, token: &str, names: &[String])
        -> Result<Vec<CatalogArtist>, CatalogError>;
}

/// `Basic base64(id:secret)` header value.
pub fn basic_auth_header(credentials: &ClientCredentials) -> String {
    let raw = format!("{}:{}", credentials.client_id, credentials.client_secret);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

/// Search URL with the comma-joined, individually URL-encoded artist names.
pub fn search_request_url(base_url: &str, names: &[String]) -> String {
    let query = names
        .iter()
        .map(|name| urlencoding::encode(name).into_owned())
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{}?q={query}&type=artist&limit={SEARCH_RESULT_LIMIT}",
        base_url.trim().trim_end_matches('/')
    )
}

/// Whole seconds from a `Retry-After` header, capped at [`MAX_RETRY_AFTER`];
/// `None` when absent or non-numeric.
pub fn parse_retry_after(header: Option<&str>) -> Option<Duration> {
    header?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|seconds| Duration::from_secs(seconds).min(MAX_RETRY_AFTER))
}

/// Extracts `artists.items[] {name, genres[]}` from a search response.
pub fn parse_search_payload(payload: &Value) -> Result<Vec<CatalogArtist>, CatalogError> {
    let items = payload
        .get("artists")
        .and_then(|artists| artists.get("items"))
        .and_then(Value::as_array)
        .ok_or_else(|| CatalogError::MalformedBody("missing artists.items".to_string()))?;
    Ok(items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            let genres = item
                .get("genres")
                .and_then(Value::as_array)
                .map(|genres| {
                    genres
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToOwned::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            Some(CatalogArtist { name, genres })
        })
        .collect())
}

/// Which endpoint a failed request went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogRequest {
    Token,
    Search,
}

/// Maps a non-success HTTP status to a [`CatalogError`].
///
/// Any 4xx from the token endpoint means the credentials were refused; the
/// search endpoint only treats 401 as a rejected token.
pub fn status_error(
    request: CatalogRequest,
    code: u16,
    retry_after: Option<&str>,
    detail: &str,
) -> CatalogError {
    match (request, code) {
        (_, 429) => CatalogError::RateLimited {
            retry_after: parse_retry_after(retry_after),
        },
        (CatalogRequest::Token, 400 | 401 | 403) | (CatalogRequest::Search, 401) => {
            CatalogError::Unauthorized(format!("HTTP {code}: {}", detail.trim()))
        }
        _ => CatalogError::Status {
            code,
            message: detail.trim().to_string(),
        },
    }
}

fn classify_ureq_failure(request: CatalogRequest, error: ureq::Error) -> CatalogError {
    match error {
        ureq::Error::Status(code, response) => {
            let retry_after = response.header("Retry-After").map(ToOwned::to_owned);
            let status_text = response.status_text().to_string();
            let body = response.into_string().unwrap_or_default();
            let detail = if body.trim().is_empty() {
                status_text
            } else {
                body
            };
            status_error(request, code, retry_after.as_deref(), &detail)
        }
        ureq::Error::Transport(transport) => CatalogError::Transport(transport.to_string()),
    }
}

/// Spotify Web API catalog over `ureq`.
pub struct SpotifyCatalogApi {
    http_client: ureq::Agent,
    token_url: String,
    search_url: String,
}

impl SpotifyCatalogApi {
    pub fn new(
        token_url: &str,
        search_url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .timeout_write(read_timeout)
            .user_agent(USER_AGENT)
            .build();
        Self {
            http_client,
            token_url: token_url.trim().to_string(),
            search_url: search_url.trim().to_string(),
        }
    }
}

impl CatalogApi for SpotifyCatalogApi {
    fn request_token(&self, credentials: &ClientCredentials) -> Result<String, CatalogError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .set("Authorization", &basic_auth_header(credentials))
            .send_form(&[("grant_type", "client_credentials")])
            .map_err(|error| classify_ureq_failure(CatalogRequest::Token, error))?;
        let payload: Value = response
            .into_json()
            .map_err(|err| CatalogError::MalformedBody(format!("token response: {err}")))?;
        payload
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| CatalogError::Unauthorized("token response had no access_token".to_string()))
    }

    fn search_artists(
        &self,
        token: &str,
        names: &[String],
    ) -> Result<Vec<CatalogArtist>, CatalogError> {
        let url = search_request_url(&self.search_url, names);
        debug!("Catalog search request: {url}");
        let response = self
            .http_client
            .get(&url)
            .set("Authorization", &format!("Bearer {token}"))
            .set("Accept", "application/json")
            .call()
            .map_err(|error| classify_ureq_failure(CatalogRequest::Search, error))?;
        let payload: Value = response
            .into_json()
            .map_err(|err| CatalogError::MalformedBody(err.to_string()))?;
        parse_search_payload(&payload)
    }
}
