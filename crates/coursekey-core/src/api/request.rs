use std::fmt;

use reqwest::{header, Method, Url};
use serde::Serialize;

use super::client::HttpRequest;
use super::ApiError;

/// How a request is authorized.
#[derive(Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Attach the stored access credential; 401 triggers a refresh.
    Bearer,
    /// Attach this exact credential; never triggers a refresh.
    Token(String),
    /// Send without credentials; never triggers a refresh.
    None,
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorization::Bearer => f.write_str("Bearer"),
            Authorization::Token(_) => f.write_str("Token(<redacted>)"),
            Authorization::None => f.write_str("None"),
        }
    }
}

/// A replayable request description, relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub authorization: Authorization,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            authorization: Authorization::Bearer,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to encode body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.authorization = Authorization::None;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.authorization = Authorization::Token(token.into());
        self
    }

    pub fn url(&self, base_url: &Url) -> Result<Url, ApiError> {
        let mut url = base_url
            .join(self.path.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidRequest(format!("Bad path {:?}: {}", self.path, e)))?;
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(url)
    }

    /// Resolve into a wire request carrying `credential` as a bearer token.
    pub(crate) fn to_http(
        &self,
        base_url: &Url,
        credential: Option<&str>,
    ) -> Result<HttpRequest, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(token) = credential {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidRequest("Credential is not a valid header".into()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        Ok(HttpRequest {
            method: self.method.clone(),
            url: self.url(base_url)?,
            headers,
            body: self.body.clone(),
        })
    }
}

/// Normalize a base URL so relative paths join beneath it.
pub(crate) fn parse_base_url(base: &str) -> Result<Url, ApiError> {
    let normalized = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    };
    Url::parse(&normalized)
        .map_err(|e| ApiError::InvalidRequest(format!("Bad base URL {:?}: {}", base, e)))
}
