//! Helpers for providers that talk HTTP.
//!
//! Maps transport failures and status codes onto [`ProviderError`] so every
//! provider reports the same classification to the fetch unit.

use std::{collections::HashMap, time::Duration};

use reqwest::{StatusCode, header};
use yomu_lib::prelude::{PageImage, ProviderError};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(DEFAULT_USER_AGENT)
            .cookie_store(true)
            .brotli(true)
            .deflate(true)
            .gzip(true)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::unavailable(e))?;

        Ok(Self { client })
    }

    async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let res = req.send().await.map_err(classify_error)?;

        let retry_after = res
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        match classify_status(res.status(), retry_after) {
            Some(e) => Err(e),
            None => Ok(res),
        }
    }

    pub async fn get_text(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, ProviderError> {
        self.get(url, headers)
            .await?
            .text()
            .await
            .map_err(classify_error)
    }

    pub async fn get_image(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<PageImage, ProviderError> {
        let res = self.get(url, headers).await?;
        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        if !content_type.starts_with("image/") {
            return Err(ProviderError::format_changed(format!(
                "expected an image from {url}, got {content_type}"
            )));
        }

        let bytes = res.bytes().await.map_err(classify_error)?;

        Ok(PageImage {
            bytes,
            content_type,
        })
    }
}

/// Classifies a non-success status, `None` means the response is usable.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }

    let error = match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            ProviderError::content_missing(format!("status {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => ProviderError::unavailable(format!("status {status}")),
        s if s.is_server_error() => ProviderError::unavailable(format!("status {status}")),
        _ => ProviderError::format_changed(format!("unexpected status {status}")),
    };

    Some(error)
}

pub fn classify_error(e: reqwest::Error) -> ProviderError {
    if e.is_decode() || e.is_body() && !e.is_timeout() {
        ProviderError::format_changed(e)
    } else if let Some(status) = e.status() {
        classify_status(status, None).unwrap_or_else(|| ProviderError::unavailable(e))
    } else {
        ProviderError::unavailable(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK, None), None);
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None),
            Some(ProviderError::ContentMissing(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::GONE, None),
            Some(ProviderError::ContentMissing(_))
        ));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3))),
            Some(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            })
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            Some(ProviderError::Unavailable(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None),
            Some(ProviderError::FormatChanged(_))
        ));
    }

    #[test]
    fn test_client_builds() {
        assert!(HttpClient::new(Duration::from_secs(10)).is_ok());
    }
}
