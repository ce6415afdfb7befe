//! Outbound client for the Azure OpenAI chat-completions endpoint

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use url::Url;

use super::error::{ProxyError, StreamFault};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};

/// Header carrying the Azure credential
pub const API_KEY_HEADER: &str = "api-key";

const USER_AGENT: &str = concat!("chatrelay/", env!("CARGO_PKG_VERSION"));

/// Client bound to one deployment
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    url: Url,
    api_key: HeaderValue,
}

impl UpstreamClient {
    /// Build the HTTP client (timeout, egress proxy) and resolve the
    /// deployment URL once at startup.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let url = chat_completions_url(config)?;

        let mut api_key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| RelayError::Config(format!("Invalid API key header value: {e}")))?;
        api_key.set_sensitive(true);

        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);

        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| RelayError::Config(format!("Invalid proxy URL '{proxy_url}': {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| RelayError::Upstream(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    /// Resolved `.../chat/completions?api-version=...` URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POST the client's body unchanged. The response is returned whatever
    /// its status; callers decide how to relay non-success codes.
    pub async fn send(
        &self,
        body: Bytes,
        stream: bool,
    ) -> std::result::Result<reqwest::Response, ProxyError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers(stream))
            .body(body)
            .send()
            .await?;

        Ok(response)
    }

    fn request_headers(&self, stream: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(if stream {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        headers.insert(API_KEY_HEADER, self.api_key.clone());
        headers
    }
}

/// The response body as a stream of chunks with transport errors classified
pub fn byte_stream(
    response: reqwest::Response,
) -> impl Stream<Item = std::result::Result<Bytes, StreamFault>> + Send + 'static {
    response.bytes_stream().map_err(StreamFault::from)
}

/// `{endpoint}/openai/deployments/{deployment}/chat/completions?api-version={version}`
pub fn chat_completions_url(config: &UpstreamConfig) -> Result<Url> {
    let mut url = Url::parse(&config.endpoint).map_err(|e| {
        RelayError::Config(format!(
            "Invalid upstream endpoint '{}': {e}",
            config.endpoint
        ))
    })?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(RelayError::Config(format!(
            "Unsupported endpoint scheme '{scheme}': only http and https are allowed"
        )));
    }

    if config.deployment.trim().is_empty() {
        return Err(RelayError::Config("Deployment name is empty".to_string()));
    }

    url.path_segments_mut()
        .map_err(|_| {
            RelayError::Config(format!(
                "Upstream endpoint '{}' cannot be a base URL",
                config.endpoint
            ))
        })?
        .pop_if_empty()
        .extend([
            "openai",
            "deployments",
            config.deployment.as_str(),
            "chat",
            "completions",
        ]);

    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("api-version", &config.api_version);

    Ok(url)
}
