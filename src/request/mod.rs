//! Fluent request sessions against the API.
//!
//! A [`Request`] accumulates path and query parameters, a payload and
//! auth overrides through chainable setters, fires with one of the
//! terminal verb methods and exposes the outcome through [`Request::error`]
//! and [`Request::json`]. Failures anywhere in the chain are latched and
//! surface on the next call to `error`, which also clears the latch so
//! the session can be reused.

use crate::client::Client;
use crate::errors::{ApiError, Error, Result, OBJECT_MODIFIED_HEADER, OBJECT_MODIFIED_MESSAGE};
use crate::object::ResourceDescriptor;
use crate::retry::{self, Backoff};
use crate::url::UrlResolver;
use crate::validation::{DependencyViolation, ValidationError, Warning, WARNING_HEADER};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Header carrying the client version on every request.
pub const CLIENT_VERSION_HEADER: &str = "x-client-version";

/// Callback invoked with any warnings attached to a mutating response.
pub type WarningHandler = Arc<dyn Fn(&[Warning]) + Send + Sync>;

/// A path or query parameter for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    /// Substituted into `{name}` placeholders of an endpoint template.
    Path {
        /// Placeholder name.
        name: String,
        /// Substituted value.
        value: String,
    },
    /// Appended to the query string. Repeats accumulate.
    Query {
        /// Query key.
        name: String,
        /// Query value.
        value: String,
    },
}

impl Parameter {
    /// A path parameter.
    pub fn path(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Path {
            name: name.into(),
            value: value.into(),
        }
    }

    /// A query parameter.
    pub fn query(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Query {
            name: name.into(),
            value: value.into(),
        }
    }

    /// A label selector query parameter.
    pub fn label(name: &str, value: &str) -> Self {
        Self::query("label", format!("{}={}", name, value))
    }

    /// Requests a server-side dry run of the operation.
    pub fn dry_run() -> Self {
        Self::query("dryRun", "All")
    }

    /// Requests ignoring read-only and ownership annotations.
    pub fn force() -> Self {
        Self::query("force", "true")
    }

    /// Runs the operation as the specified owner.
    pub fn owner(owner: &str) -> Self {
        Self::query("owner", owner)
    }

    /// Requests a server-side apply for an update operation.
    pub fn apply() -> Self {
        Self::query("apply", "true")
    }

    /// Requests deletion without removing underlying cloud resources.
    pub fn orphan() -> Self {
        Self::query("orphan", "true")
    }

    /// Requests cascading deletion of dependents.
    pub fn cascade() -> Self {
        Self::query("cascade", "true")
    }
}

/// Sends a prepared HTTP request. The default implementation wraps a
/// reqwest client; fakes can implement this to intercept traffic.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Performs the request, returning the raw response.
    async fn dispatch(&self, request: reqwest::Request) -> reqwest::Result<reqwest::Response>;
}

/// Default dispatcher backed by a reqwest client, trusting any CA
/// bundle configured on the server entry.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    /// Builds a dispatcher for the given server. Streaming requests get
    /// an unbounded timeout.
    pub fn new(ca_certificate: &str, follow: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder();

        if !follow {
            builder = builder.timeout(Duration::from_secs(30));
        }
        if !ca_certificate.is_empty() {
            let cert = reqwest::Certificate::from_pem(ca_certificate.as_bytes())
                .map_err(|e| Error::Config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.client.execute(request).await
    }
}

/// A single request session.
pub struct Request {
    client: Client,
    profile: String,
    resolver: UrlResolver,
    payload: Option<Bytes>,
    auth_token: Option<String>,
    unauthenticated: bool,
    follow: bool,
    latched: Option<Error>,
    body: Bytes,
    stream_response: Option<reqwest::Response>,
    warnings: Vec<Warning>,
    warning_handler: Option<WarningHandler>,
    cancel: Option<CancellationToken>,
}

impl Request {
    pub(crate) fn new(
        client: Client,
        profile: String,
        warning_handler: Option<WarningHandler>,
    ) -> Self {
        Self {
            client,
            profile,
            resolver: UrlResolver::new(),
            payload: None,
            auth_token: None,
            unauthenticated: false,
            follow: false,
            latched: None,
            body: Bytes::new(),
            stream_response: None,
            warnings: Vec::new(),
            warning_handler,
            cancel: None,
        }
    }

    /// Returns the profile this request authenticates as.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Targets a resource type.
    pub fn resource(&mut self, descriptor: &ResourceDescriptor) -> &mut Self {
        self.resolver.resource(
            &descriptor.group,
            &descriptor.version,
            &descriptor.api_name,
            descriptor.versioned,
        );
        self
    }

    /// Overrides the API version of the resource.
    pub fn resource_api_version(&mut self, v: &str) -> &mut Self {
        self.resolver.resource_api_version(v);
        self
    }

    /// Targets a specific stored version of a versioned resource.
    pub fn resource_version(&mut self, v: &str) -> &mut Self {
        self.resolver.resource_version(v);
        self
    }

    /// Scopes the request to a workspace.
    pub fn workspace(&mut self, v: &str) -> &mut Self {
        self.resolver.workspace_parameter(v);
        self
    }

    /// Sets the resource name.
    pub fn name(&mut self, v: &str) -> &mut Self {
        self.resolver.name_parameter(v);
        self
    }

    /// Targets a subresource.
    pub fn subresource(&mut self, v: &str) -> &mut Self {
        self.resolver.subresource(v);
        self
    }

    /// Sets the name under the subresource.
    pub fn subresource_name(&mut self, v: &str) -> &mut Self {
        self.resolver.subresource_name(v);
        self
    }

    /// Switches to an endpoint template under the non-resource API base.
    pub fn endpoint(&mut self, v: &str) -> &mut Self {
        self.resolver.endpoint(v);
        self
    }

    /// Switches to an endpoint template used verbatim, without a base
    /// path prefix.
    pub fn raw_endpoint(&mut self, v: &str) -> &mut Self {
        self.resolver.raw_endpoint(v);
        self
    }

    /// Adds parameters to the request. Path parameters with an empty
    /// name or value latch an error.
    pub fn parameters(&mut self, params: impl IntoIterator<Item = Parameter>) -> &mut Self {
        for param in params {
            match param {
                Parameter::Path { name, value } => {
                    if name.is_empty() || value.is_empty() {
                        self.latch(Error::InvalidOperation(format!(
                            "path parameter {:?} must have a name and value",
                            name
                        )));
                        return self;
                    }
                    self.resolver.set_parameter(&name, &value);
                }
                Parameter::Query { name, value } => {
                    if name.is_empty() {
                        self.latch(Error::InvalidOperation(
                            "query parameter must have a name".to_string(),
                        ));
                        return self;
                    }
                    self.resolver.add_query_parameter(&name, &value);
                }
            }
        }
        self
    }

    /// Attaches a JSON payload, serialized immediately.
    pub fn payload<T: Serialize>(&mut self, v: &T) -> &mut Self {
        match serde_json::to_vec(v) {
            Ok(bytes) => self.payload = Some(Bytes::from(bytes)),
            Err(e) => self.latch(Error::Serialization(e)),
        }
        self
    }

    /// Overrides the bearer token for this request.
    pub fn authorization(&mut self, token: impl Into<String>) -> &mut Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Marks the request as needing no authorization header.
    pub fn unauthenticated(&mut self) -> &mut Self {
        self.unauthenticated = true;
        self
    }

    /// Keeps the response open for streaming instead of buffering it.
    pub fn follow(&mut self, v: bool) -> &mut Self {
        self.follow = v;
        self
    }

    /// Overrides the warning handler for this request.
    pub fn with_warning_handler(&mut self, handler: WarningHandler) -> &mut Self {
        self.warning_handler = Some(handler);
        self
    }

    /// Attaches a cancellation token; backoff waits abort when it fires.
    pub fn cancel_token(&mut self, token: CancellationToken) -> &mut Self {
        self.cancel = Some(token);
        self
    }

    /// Performs a GET request.
    pub async fn get(&mut self) -> &mut Self {
        self.send(Method::GET).await;
        self
    }

    /// Performs a POST request.
    pub async fn post(&mut self) -> &mut Self {
        self.send(Method::POST).await;
        self
    }

    /// Performs a PUT request.
    pub async fn put(&mut self) -> &mut Self {
        self.send(Method::PUT).await;
        self
    }

    /// Performs a DELETE request and dispatches any response warnings.
    pub async fn delete(&mut self) -> &mut Self {
        self.send(Method::DELETE).await;
        self.handle_warnings();
        self
    }

    /// Creates the resource (POST) and dispatches any response warnings.
    pub async fn create(&mut self) -> &mut Self {
        self.send(Method::POST).await;
        self.handle_warnings();
        self
    }

    /// Updates the resource (PUT) and dispatches any response warnings.
    pub async fn update(&mut self) -> &mut Self {
        self.send(Method::PUT).await;
        self.handle_warnings();
        self
    }

    /// Checks whether the targeted resource exists. A 404 is not an
    /// error here.
    pub async fn exists(&mut self) -> Result<bool> {
        match self.get().await.error() {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns and clears the latched error, if any.
    pub fn error(&mut self) -> Result<()> {
        match self.latched.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Decodes the buffered response body, after checking for a latched
    /// error.
    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.error()?;

        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Returns the buffered response body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the warnings attached to the last response.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Consumes a followed request, returning the response byte stream.
    pub fn into_stream(mut self) -> Result<impl Stream<Item = reqwest::Result<Bytes>>> {
        self.error()?;

        let response = self.stream_response.take().ok_or_else(|| {
            Error::InvalidOperation("no streaming response, was the request followed?".to_string())
        })?;

        Ok(response.bytes_stream())
    }

    /// Returns a fresh session with the same target, payload and
    /// handlers, without any latched state.
    pub fn duplicate(&self) -> Self {
        Self {
            client: self.client.clone(),
            profile: self.profile.clone(),
            resolver: self.resolver.duplicate(),
            payload: self.payload.clone(),
            auth_token: self.auth_token.clone(),
            unauthenticated: self.unauthenticated,
            follow: self.follow,
            latched: None,
            body: Bytes::new(),
            stream_response: None,
            warnings: Vec::new(),
            warning_handler: self.warning_handler.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn latch(&mut self, err: Error) {
        if self.latched.is_none() {
            self.latched = Some(err);
        }
    }

    async fn send(&mut self, method: Method) {
        if self.latched.is_some() {
            return;
        }
        if let Err(e) = self.dispatch_with_retry(method).await {
            self.latched = Some(e);
        }
    }

    async fn dispatch_with_retry(&mut self, method: Method) -> Result<()> {
        let server = self.client.server(&self.profile).await?;
        let uri = self.resolver.make_url(&server.api_info())?;
        let url = format!("{}/{}", server.endpoint, uri);

        tracing::debug!(
            endpoint = %server.endpoint,
            method = %method,
            uri = %uri,
            custom_ca = !server.ca_certificate.is_empty(),
            "api request"
        );

        let dispatcher = self.client.dispatcher(&server, self.follow)?;
        let started = Instant::now();
        let backoff = Backoff::default();

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;

            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }

            let request = self.build_request(method.clone(), &url).await?;
            let response = dispatcher.dispatch(request).await?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS
                && attempt < retry::TRANSPORT_ATTEMPTS
            {
                tracing::warn!(uri = %uri, "rate limited by the api, backing off and retrying");
                if !retry::sleep_cancellable(self.cancel.as_ref(), backoff.duration(attempt)).await
                {
                    return Err(Error::Cancelled);
                }
                continue;
            }

            break response;
        };

        tracing::debug!(
            uri = %uri,
            code = response.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "api request complete"
        );

        self.handle_response(&method, &uri, response).await
    }

    async fn build_request(&self, method: Method, url: &str) -> Result<reqwest::Request> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid request url {}: {}", url, e)))?;

        let mut request = reqwest::Request::new(method, parsed);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.headers_mut().insert(
            CLIENT_VERSION_HEADER,
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );

        if let Some(payload) = &self.payload {
            *request.body_mut() = Some(reqwest::Body::from(payload.clone()));
        }

        if !self.unauthenticated {
            let token = self.bearer_token().await?;
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| Error::InvalidToken("token is not a valid header value".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }

    /// Resolves the bearer token: explicit override first, then the
    /// profile's static token, then its identity - refreshing the
    /// identity when its access token has expired.
    async fn bearer_token(&self) -> Result<String> {
        if let Some(token) = &self.auth_token {
            return Ok(token.clone());
        }

        let auth = self
            .client
            .auth_info(&self.profile)
            .await
            .ok_or_else(|| Error::invalid_profile(&self.profile, "missing authentication profile"))?;

        if let Some(token) = &auth.token {
            return Ok(token.clone());
        }

        if let Some(identity) = &auth.identity {
            if !identity.is_expired()? {
                return Ok(identity.token.clone());
            }

            self.client.refresh_identity_boxed().await?;

            let refreshed = self
                .client
                .auth_info(&self.profile)
                .await
                .and_then(|a| a.identity)
                .ok_or_else(|| {
                    Error::invalid_profile(&self.profile, "missing authentication profile")
                })?;

            return Ok(refreshed.token);
        }

        Err(Error::invalid_profile(
            &self.profile,
            "missing authentication profile",
        ))
    }

    async fn handle_response(
        &mut self,
        method: &Method,
        uri: &str,
        response: reqwest::Response,
    ) -> Result<()> {
        self.warnings = parse_warnings(response.headers());

        let status = response.status();
        if status.is_success() {
            if self.follow {
                self.stream_response = Some(response);
            } else {
                self.body = response.bytes().await?;
            }
            return Ok(());
        }

        let headers = response.headers().clone();
        self.body = response.bytes().await.unwrap_or_default();

        Err(Error::Api(classify_response(
            status.as_u16(),
            method.as_str(),
            uri,
            &headers,
            &self.body,
        )))
    }

    fn handle_warnings(&mut self) {
        if self.warnings.is_empty() {
            return;
        }
        tracing::debug!(count = self.warnings.len(), "api request returned warnings");
        if let Some(handler) = &self.warning_handler {
            handler(&self.warnings);
        }
    }
}

/// Builds the structured error for a non-2xx response.
///
/// 400 bodies are decoded as validation errors and 409s are split by
/// the object-modified header into concurrency conflicts and dependency
/// violations. Anything else falls back to the error body, then to a
/// per-status message.
fn classify_response(
    code: u16,
    verb: &str,
    uri: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> ApiError {
    let mut api_error = ApiError::new(code, verb, uri);

    match code {
        400 => match serde_json::from_slice::<ValidationError>(body) {
            Ok(validation) => {
                api_error.message = validation.to_string();
                api_error.validation = Some(validation);
            }
            Err(e) => {
                tracing::debug!(error = %e, "response cannot be decoded into a validation error");
            }
        },
        // Two kinds of conflict share 409: a write conflict on the
        // object and a dependency blocking deletion.
        409 => {
            let modified = headers
                .get(OBJECT_MODIFIED_HEADER)
                .and_then(|v| v.to_str().ok())
                == Some("true");

            if modified {
                api_error.message = OBJECT_MODIFIED_MESSAGE.to_string();
            } else {
                match serde_json::from_slice::<DependencyViolation>(body) {
                    Ok(violation) => {
                        api_error.message = violation.to_string();
                        api_error.dependency_violation = Some(violation);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "response cannot be decoded into a dependency violation");
                    }
                }
            }
        }
        _ => {
            if !body.is_empty() {
                match serde_json::from_slice::<ApiError>(body) {
                    Ok(decoded) => {
                        api_error.message = decoded.message;
                        api_error.detail = decoded.detail;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "error response cannot be decoded");
                    }
                }
            }
        }
    }

    if api_error.message.is_empty() {
        api_error.message = fallback_message(code, verb);
    }

    api_error
}

fn fallback_message(code: u16, verb: &str) -> String {
    match code {
        400 => "Invalid request".to_string(),
        401 => "Authorization required".to_string(),
        403 => "Request denied, check your permissions".to_string(),
        404 => "Resource does not exist".to_string(),
        405 => format!("Resource does not support method {}", verb),
        409 => OBJECT_MODIFIED_MESSAGE.to_string(),
        429 => "Too many requests, please try again shortly".to_string(),
        503 => "API service unavailable".to_string(),
        _ => "Unexpected error from API".to_string(),
    }
}

fn parse_warnings(headers: &HeaderMap) -> Vec<Warning> {
    headers
        .get_all(WARNING_HEADER)
        .iter()
        .filter_map(|value| {
            let raw = value.to_str().ok()?;
            match serde_json::from_str(raw) {
                Ok(warning) => Some(warning),
                Err(e) => {
                    tracing::debug!(error = %e, raw, "response warning cannot be parsed");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::WarningType;
    use reqwest::header::HeaderName;

    #[test]
    fn test_classify_validation_error() {
        let body = br#"{
            "code": 400,
            "message": "appenv has failed validation",
            "fieldErrors": [
                {"field": "spec.name", "errCode": "required", "message": "name is required"}
            ]
        }"#;

        let err = classify_response(400, "POST", "/x", &HeaderMap::new(), body);
        assert_eq!(err.code, 400);
        assert!(err.message.contains("appenv has failed validation"));
        assert!(err.message.contains("spec.name: name is required"));
        assert_eq!(err.validation.as_ref().unwrap().field_errors.len(), 1);
    }

    #[test]
    fn test_classify_validation_error_without_fields_falls_back() {
        // no field errors renders an empty message, so the generic 400
        // message applies
        let body = br#"{"code": 400, "message": "bad"}"#;
        let err = classify_response(400, "POST", "/x", &HeaderMap::new(), body);
        assert_eq!(err.message, "Invalid request");
    }

    #[test]
    fn test_classify_object_modified_conflict() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(OBJECT_MODIFIED_HEADER),
            HeaderValue::from_static("true"),
        );

        let err = classify_response(409, "PUT", "/x", &headers, b"");
        assert_eq!(err.message, OBJECT_MODIFIED_MESSAGE);
        assert!(err.is_object_modified());
    }

    #[test]
    fn test_classify_dependency_violation() {
        let body = br#"{
            "code": 409,
            "message": "dependency violation",
            "dependents": [
                {"kind": "AppEnv", "name": "prod", "workspace": "teamA", "system": false}
            ]
        }"#;

        let err = classify_response(409, "DELETE", "/x", &HeaderMap::new(), body);
        assert!(!err.is_object_modified());
        assert!(err.message.contains("deleted first"));
        assert!(err.message.contains("AppEnv/teamA/prod"));
        assert!(err.dependency_violation.is_some());
    }

    #[test]
    fn test_classify_decodes_error_body() {
        let body = br#"{"code": 503, "message": "database down", "detail": "pg timeout"}"#;
        let err = classify_response(503, "GET", "/x", &HeaderMap::new(), body);
        assert_eq!(err.message, "database down");
        assert_eq!(err.detail, "pg timeout");
        assert_eq!(err.code, 503);
    }

    #[test]
    fn test_fallback_messages() {
        for (code, expected) in [
            (401, "Authorization required"),
            (404, "Resource does not exist"),
            (403, "Request denied, check your permissions"),
            (429, "Too many requests, please try again shortly"),
            (503, "API service unavailable"),
            (409, OBJECT_MODIFIED_MESSAGE),
            (500, "Unexpected error from API"),
        ] {
            let err = classify_response(code, "GET", "/x", &HeaderMap::new(), b"");
            assert_eq!(err.message, expected, "status {}", code);
        }

        let err = classify_response(405, "PATCH", "/x", &HeaderMap::new(), b"");
        assert_eq!(err.message, "Resource does not support method PATCH");
    }

    #[test]
    fn test_parse_warnings_drops_malformed() {
        let mut headers = HeaderMap::new();
        headers.append(
            HeaderName::from_static(WARNING_HEADER),
            HeaderValue::from_static(
                r#"{"warningType": "General", "message": "deprecated field in use"}"#,
            ),
        );
        headers.append(
            HeaderName::from_static(WARNING_HEADER),
            HeaderValue::from_static("not json"),
        );

        let warnings = parse_warnings(&headers);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].warning_type, WarningType::General);
    }

    #[test]
    fn test_parameter_constructors() {
        assert_eq!(Parameter::dry_run(), Parameter::query("dryRun", "All"));
        assert_eq!(Parameter::force(), Parameter::query("force", "true"));
        assert_eq!(Parameter::orphan(), Parameter::query("orphan", "true"));
        assert_eq!(Parameter::cascade(), Parameter::query("cascade", "true"));
        assert_eq!(Parameter::apply(), Parameter::query("apply", "true"));
        assert_eq!(
            Parameter::label("env", "prod"),
            Parameter::query("label", "env=prod")
        );
    }
}
