use crate::error::FetchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Page content returned by a fetch engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub content: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl FetchedPage {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// External capability that loads one page
///
/// Implementations should honour `timeout`; the orchestrator also enforces
/// it as a hard cutoff around the call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage, FetchError>;
}

/// Plain HTTP fetcher; does not render JavaScript
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("capture-optimizer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Other(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn status_error(status: reqwest::StatusCode) -> FetchError {
    match status.as_u16() {
        429 => FetchError::RateLimited(status.to_string()),
        401 | 403 => FetchError::Permission(status.to_string()),
        _ => FetchError::Other(format!("HTTP {status}")),
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else if err.is_connect() {
        FetchError::Network(err.to_string())
    } else if let Some(status) = err.status() {
        status_error(status)
    } else {
        FetchError::Other(err.to_string())
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage, FetchError> {
        debug!("GET {} (timeout {:?})", url, timeout);

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let mut page = FetchedPage::default()
            .with_metadata("status", status.as_u16().to_string())
            .with_metadata("final_url", response.url().to_string());
        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            page = page.with_metadata("content_type", content_type);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        page.content = body.to_vec();

        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCategory;
    use reqwest::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS).category(),
            FailureCategory::RateLimited
        );
        assert_eq!(
            status_error(StatusCode::FORBIDDEN).category(),
            FailureCategory::Permission
        );
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED).category(),
            FailureCategory::Permission
        );
        assert_eq!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR).category(),
            FailureCategory::Unknown
        );
    }

    #[tokio::test]
    async fn test_mock_fetcher() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_, _| Ok(FetchedPage::new("<html></html>")));

        let page = fetcher
            .fetch("https://example.com", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(page.content, b"<html></html>".to_vec());
    }

    #[test]
    fn test_page_metadata() {
        let page = FetchedPage::new("x").with_metadata("status", "200");
        assert_eq!(page.metadata.get("status").map(String::as_str), Some("200"));
    }
}
