use std::time::Duration;

use chrono::{DateTime, Utc};
use perch_core::error::AppError;
use perch_core::models::{AuthorProfile, RawPost, SearchQuery};
use perch_core::traits::Provider;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Provider`] backed by a JSON search API.
///
/// Issues `GET {base}/search?q=&lang=&page=&count=` for result pages and
/// `GET {base}/users/{id}/timeline?count=1` for author profiles, with an
/// optional bearer token.
#[derive(Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: Url,
    token: Option<String>,
    timeout_secs: u64,
}

impl HttpProvider {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, AppError> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, AppError> {
        let base_url = parse_base_url(base_url)?;
        let client = Client::builder()
            .user_agent("perch/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
            timeout_secs: timeout.as_secs(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn search_url(&self, query: &SearchQuery, page: u32) -> Result<Url, AppError> {
        let mut url = self.endpoint(&["search"])?;
        url.query_pairs_mut()
            .append_pair("q", &query.text)
            .append_pair("lang", &query.lang)
            .append_pair("page", &page.to_string())
            .append_pair("count", &query.count.to_string());
        Ok(url)
    }

    fn timeline_url(&self, author_id: u64) -> Result<Url, AppError> {
        let mut url = self.endpoint(&["users", &author_id.to_string(), "timeline"])?;
        url.query_pairs_mut().append_pair("count", "1");
        Ok(url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| AppError::ConfigError(format!("Base URL cannot have a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, AppError> {
        let response = self
            .authorized(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, &url));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::SerializationError(format!("Unexpected response from {url}: {e}")))
    }
}

impl Provider for HttpProvider {
    async fn search_page(&self, query: &SearchQuery, page: u32) -> Result<Vec<RawPost>, AppError> {
        let url = self.search_url(query, page)?;
        let body: SearchResponse = self.get_json(url).await?;
        tracing::debug!(page, statuses = body.statuses.len(), "Search page received");
        Ok(body.statuses.into_iter().map(RawPost::from).collect())
    }

    async fn lookup_author(&self, author_id: u64) -> Result<Option<AuthorProfile>, AppError> {
        let url = self.timeline_url(author_id)?;
        let timeline: Vec<ApiStatus> = self.get_json(url).await?;
        Ok(timeline.into_iter().next().map(|status| status.user.into()))
    }
}

fn parse_base_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw).map_err(|e| AppError::ConfigError(format!("Invalid API base URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(AppError::ConfigError(format!(
            "API base URL scheme '{scheme}' is not allowed (only http/https)"
        ))),
    }
}

/// Maps a non-2xx response to the provider failure it represents.
fn status_error(status: StatusCode, body: &str, url: &Url) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return AppError::RateLimitExceeded;
    }
    let message = serde_json::from_str::<ApiErrors>(body)
        .ok()
        .and_then(|e| e.errors.into_iter().next())
        .map(|e| e.message)
        .unwrap_or_else(|| body.trim().chars().take(200).collect());

    if status.is_server_error() {
        AppError::ProviderError(format!("HTTP {} for {}: {}", status.as_u16(), url.path(), message))
    } else {
        AppError::HttpError(format!("HTTP {} for {}: {}", status.as_u16(), url.path(), message))
    }
}

// ---- API types ----

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    statuses: Vec<ApiStatus>,
}

#[derive(Deserialize)]
struct ApiStatus {
    id: u64,
    text: String,
    created_at: DateTime<Utc>,
    user: ApiUser,
    #[serde(default)]
    place: Option<ApiPlace>,
}

#[derive(Deserialize)]
struct ApiUser {
    id: u64,
    screen_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize)]
struct ApiPlace {
    full_name: String,
}

#[derive(Deserialize)]
struct ApiErrors {
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl From<ApiStatus> for RawPost {
    fn from(status: ApiStatus) -> Self {
        RawPost {
            id: status.id,
            author_id: status.user.id,
            author_screen_name: status.user.screen_name,
            text: status.text,
            created_at: status.created_at,
            place: status.place.map(|p| p.full_name),
            location: status.user.location,
        }
    }
}

impl From<ApiUser> for AuthorProfile {
    fn from(user: ApiUser) -> Self {
        AuthorProfile {
            name: user.name,
            screen_name: Some(user.screen_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const STATUS_JSON: &str = r#"{
        "id": 11,
        "text": "I'm 15 @rory",
        "created_at": "2011-06-01T12:00:00Z",
        "user": {"id": 20, "screen_name": "amy_pond", "name": "AmeliaPond", "location": "Leadworth"},
        "place": {"full_name": "Gloucestershire"}
    }"#;

    fn query() -> SearchQuery {
        SearchQuery {
            text: "\"I'm 15\" OR \"I'm 16\"".into(),
            lang: "en".into(),
            count: 100,
        }
    }

    /// Serves one canned HTTP response and returns the raw request it read.
    async fn serve_once(status_line: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{addr}/api/"), handle)
    }

    #[test]
    fn search_url_carries_query_parameters() {
        let provider = HttpProvider::new("https://api.example.com/1.1/", None).unwrap();
        let url = provider.search_url(&query(), 2).unwrap();

        assert_eq!(url.path(), "/1.1/search");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("q".into(), "\"I'm 15\" OR \"I'm 16\"".into()),
                ("lang".into(), "en".into()),
                ("page".into(), "2".into()),
                ("count".into(), "100".into()),
            ]
        );
    }

    #[test]
    fn timeline_url_requests_single_status() {
        let provider = HttpProvider::new("https://api.example.com", None).unwrap();
        let url = provider.timeline_url(42).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/users/42/timeline?count=1");
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(matches!(
            HttpProvider::new("ftp://api.example.com", None),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            HttpProvider::new("not a url", None),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn blank_token_is_ignored() {
        let provider = HttpProvider::new("https://api.example.com", Some("  ".into())).unwrap();
        assert!(provider.token.is_none());
    }

    #[test]
    fn status_mapping() {
        let url = Url::parse("https://api.example.com/search").unwrap();
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "", &url),
            AppError::RateLimitExceeded
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "upstream", &url),
            AppError::ProviderError(msg) if msg.contains("502") && msg.contains("upstream")
        ));
        assert!(matches!(
            status_error(
                StatusCode::UNAUTHORIZED,
                r#"{"errors":[{"message":"Invalid token"}]}"#,
                &url
            ),
            AppError::HttpError(msg) if msg.contains("401") && msg.contains("Invalid token")
        ));
    }

    #[test]
    fn status_converts_to_raw_post() {
        let status: ApiStatus = serde_json::from_str(STATUS_JSON).unwrap();
        let post = RawPost::from(status);
        assert_eq!(post.id, 11);
        assert_eq!(post.author_id, 20);
        assert_eq!(post.author_screen_name, "amy_pond");
        assert_eq!(post.place.as_deref(), Some("Gloucestershire"));
        assert_eq!(post.location.as_deref(), Some("Leadworth"));
    }

    #[tokio::test]
    async fn search_page_sends_bearer_token_and_parses_statuses() {
        let body = format!(r#"{{"statuses": [{STATUS_JSON}]}}"#);
        let (base, server) = serve_once("200 OK", body).await;
        let provider = HttpProvider::new(&base, Some("secret".into())).unwrap();

        let posts = provider.search_page(&query(), 1).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, "I'm 15 @rory");

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /api/search?"));
        assert!(request.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn lookup_with_empty_timeline_is_none() {
        let (base, server) = serve_once("200 OK", "[]".to_string()).await;
        let provider = HttpProvider::new(&base, None).unwrap();

        assert_eq!(provider.lookup_author(20).await.unwrap(), None);
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/users/20/timeline?count=1"));
    }

    #[tokio::test]
    async fn rate_limited_response_maps_to_rate_limit_error() {
        let (base, _server) = serve_once("429 Too Many Requests", "{}".to_string()).await;
        let provider = HttpProvider::new(&base, None).unwrap();

        let err = provider.search_page(&query(), 1).await.unwrap_err();
        assert_eq!(err, AppError::RateLimitExceeded);
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let provider = HttpProvider::new(&format!("http://{addr}"), None).unwrap();

        let err = provider.lookup_author(1).await.unwrap_err();
        assert!(matches!(err, AppError::NetworkError(_)), "got {err:?}");
    }
}
