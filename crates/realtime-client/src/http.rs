//! HTTP executor seam, used solely for token issuance and server time.
//!
//! All other REST concerns (fallback hosts, history, stats) are out of scope.

use async_trait::async_trait;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        HttpRequest {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            content_type: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        HttpRequest {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            content_type: Some("application/json".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Narrow request/response surface consumed by the auth coordinator.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, req: HttpRequest) -> Result<HttpResponse, Error>;
}

/// Production executor backed by reqwest.
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new(timeout: std::time::Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ReqwestExecutor { client })
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, req: HttpRequest) -> Result<HttpResponse, Error> {
        let mut builder = match req.method {
            HttpMethod::Get => self.client.get(&req.url),
            HttpMethod::Post => self.client.post(&req.url),
        };
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(ct) = &req.content_type {
            builder = builder.header("content-type", ct);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = resp.bytes().await?.to_vec();
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range() {
        let ok = HttpResponse {
            status: 201,
            content_type: None,
            body: Vec::new(),
        };
        assert!(ok.is_success());
        let not_found = HttpResponse {
            status: 404,
            content_type: None,
            body: Vec::new(),
        };
        assert!(!not_found.is_success());
    }
}
