//! Authenticated request pipeline
//!
//! Every call goes through two intercepts:
//!
//! - outbound: read the current access token from the store (per attempt,
//!   never cached) and attach it as a bearer `Authorization` header;
//! - inbound: pass 2xx through; on 401 renew once and replay the request;
//!   on a second 401 for the same request give up without renewing again.
//!
//! Requests are described by `ApiRequest`, which owns its body so it can be
//! replayed after a renewal.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::renewal::Renewal;
use crate::store::CredentialStore;

/// A replayable outbound API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    retried: bool,
}

impl ApiRequest {
    /// A request for `path`, relative to the API base URL.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            retried: false,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace all headers. `Authorization` is always overwritten per attempt.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Serialize `body` as the JSON request body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| Error::InvalidRequest(format!("serializing JSON body: {e}")))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this request has already been replayed after a renewal.
    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

/// HTTP client that attaches session credentials and recovers from 401s.
///
/// One instance per session; clones share the same store and renewal.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    store: Arc<CredentialStore>,
    renewal: Arc<Renewal>,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        base: Url,
        store: Arc<CredentialStore>,
        renewal: Arc<Renewal>,
    ) -> Self {
        Self {
            http,
            base,
            store,
            renewal,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn get(&self, path: impl Into<String>) -> ApiRequest {
        ApiRequest::new(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> ApiRequest {
        ApiRequest::new(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> ApiRequest {
        ApiRequest::new(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> ApiRequest {
        ApiRequest::new(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> ApiRequest {
        ApiRequest::new(Method::DELETE, path)
    }

    /// Send `request`, renewing credentials and replaying once on 401.
    ///
    /// Returns the response for any 2xx status. Everything else is an
    /// `Error::Status`; `requires_login` is set only when renewal failed.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: ApiRequest) -> Result<reqwest::Response> {
        let mut request = request;
        loop {
            let (response, sent_with) = self.dispatch(&request).await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            if status != StatusCode::UNAUTHORIZED {
                return Err(status_error(response, false).await);
            }

            if request.retried {
                warn!("replayed request rejected again, not renewing twice");
                return Err(status_error(response, false).await);
            }
            request.retried = true;

            // A renewal may have landed while this attempt was in flight.
            let current = self.store.get().map(|pair| pair.access.expose().clone());
            if current.is_some() && current != sent_with {
                debug!("credentials changed since the request was sent, replaying");
                continue;
            }

            debug!("401 received, renewing credentials");
            if self.renewal.renew().await {
                continue;
            }

            warn!("renewal failed, session requires login");
            return Err(status_error(response, true).await);
        }
    }

    /// Send `request` and decode a 2xx JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Http(format!("decoding response body: {e}")))
    }

    /// One attempt. Returns the response and the access token it carried.
    async fn dispatch(&self, request: &ApiRequest) -> Result<(reqwest::Response, Option<String>)> {
        let mut url = session_auth::endpoint(&self.base, &request.path)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }

        let mut headers = request.headers.clone();
        headers.remove(AUTHORIZATION);
        let access = self.store.get().map(|pair| pair.access.expose().clone());
        if let Some(access) = &access {
            let value = HeaderValue::from_str(&format!("Bearer {access}"))
                .map_err(|e| Error::InvalidRequest(format!("invalid access token value: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Http(format!("{} {} failed: {e}", request.method, request.path)))?;
        Ok((response, access))
    }
}

async fn status_error(response: reqwest::Response, requires_login: bool) -> Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Error::Status {
        status,
        body,
        requires_login,
    }
}
