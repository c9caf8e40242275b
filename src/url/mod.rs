//! URL construction for resource and endpoint requests.
//!
//! All URLs the client sends are built here, in one place, so the
//! resource-oriented grammar can be unit tested in isolation and shared
//! with any fake transport.

use crate::config::ApiInfo;
use crate::errors::{Error, Result};
use std::collections::BTreeMap;

/// Path parameter: the workspace of a workspaced resource.
pub const PARAM_WORKSPACE: &str = "workspace";
/// Path parameter: the API version of the resource.
pub const PARAM_API_VERSION: &str = "apiVersion";
/// Path parameter: the API group of the resource.
pub const PARAM_GROUP: &str = "group";
/// Path parameter: the plural API name of the resource.
pub const PARAM_RESOURCE: &str = "resource";
/// Path parameter: the name of the resource.
pub const PARAM_NAME: &str = "name";
/// Path parameter: a specific stored version of a versioned resource.
pub const PARAM_RESOURCE_VERSION: &str = "resourceVersion";
/// Path parameter: a subresource of the resource.
pub const PARAM_SUBRESOURCE: &str = "subresource";
/// Path parameter: the name under a subresource.
pub const PARAM_SUBRESOURCE_NAME: &str = "subresourcename";

/// Builds request URIs from accumulated path and query parameters.
///
/// Two modes exist: resource mode (the default) renders the
/// resource-oriented grammar under the server's resource API base;
/// endpoint mode renders a caller-supplied template with `{param}`
/// placeholders under the non-resource API base, or verbatim when raw.
#[derive(Debug, Clone, Default)]
pub struct UrlResolver {
    parameters: BTreeMap<String, String>,
    query: BTreeMap<String, Vec<String>>,
    endpoint: String,
    raw_endpoint: bool,
    versioned_resource: bool,
}

impl UrlResolver {
    /// Creates an empty resolver in resource mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an independent copy of this resolver.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Renders the URI relative to the server endpoint.
    pub fn make_url(&self, api_info: &ApiInfo) -> Result<String> {
        if !self.endpoint.is_empty() {
            return Ok(self.make_endpoint_url(api_info));
        }

        self.make_resource_url(api_info)
    }

    /// Checks if this is a resource request rather than an endpoint one.
    pub fn is_resource_request(&self) -> bool {
        self.endpoint.is_empty()
    }

    /// Checks if this is a request for a subresource.
    pub fn is_subresource_request(&self) -> bool {
        self.parameter(PARAM_SUBRESOURCE).is_some()
    }

    /// Returns the group, version and resource name of a resource
    /// request, when all three are set.
    pub fn group_version_resource(&self) -> Option<(&str, &str, &str)> {
        if !self.is_resource_request() {
            return None;
        }

        Some((
            self.parameter(PARAM_GROUP)?,
            self.parameter(PARAM_API_VERSION)?,
            self.parameter(PARAM_RESOURCE)?,
        ))
    }

    /// Returns the resource name parameter.
    pub fn name(&self) -> &str {
        self.parameter(PARAM_NAME).unwrap_or("")
    }

    /// Returns the workspace parameter.
    pub fn workspace(&self) -> &str {
        self.parameter(PARAM_WORKSPACE).unwrap_or("")
    }

    /// Builds a URI of the form
    /// `<resourceAPI>/<group>/<version>[/workspaces/<ws>][/<resource>][/<name>][/versions[/<rv>]][/<sub>[/<subname>]]`.
    /// The `/versions` segment is appended only for versioned resources
    /// addressed by name.
    fn make_resource_url(&self, api_info: &ApiInfo) -> Result<String> {
        let group = self
            .parameter(PARAM_GROUP)
            .ok_or(Error::MissingGroupVersion)?;
        let version = self
            .parameter(PARAM_API_VERSION)
            .ok_or(Error::MissingGroupVersion)?;

        let mut paths = vec![
            api_info.resource_api.trim_start_matches('/').to_string(),
            group.to_string(),
            version.to_string(),
        ];

        if let Some(workspace) = self.parameter(PARAM_WORKSPACE) {
            paths.push("workspaces".to_string());
            paths.push(workspace.to_string());
        }
        for key in [PARAM_RESOURCE, PARAM_NAME] {
            if let Some(value) = self.parameter(key) {
                paths.push(value.to_string());
            }
        }

        if self.versioned_resource && self.parameter(PARAM_NAME).is_some() {
            paths.push("versions".to_string());
            if let Some(rv) = self.parameter(PARAM_RESOURCE_VERSION) {
                paths.push(rv.to_string());
            }
        }

        for key in [PARAM_SUBRESOURCE, PARAM_SUBRESOURCE_NAME] {
            if let Some(value) = self.parameter(key) {
                paths.push(value.to_string());
            }
        }

        Ok(self.with_query(paths.join("/")))
    }

    /// Expands an endpoint template: prefixes the non-resource API base
    /// (unless raw), substitutes `{param}` placeholders and appends the
    /// query string.
    fn make_endpoint_url(&self, api_info: &ApiInfo) -> String {
        let mut uri = if self.raw_endpoint {
            self.endpoint.clone()
        } else {
            format!(
                "{}/{}",
                api_info.non_resource_api,
                self.endpoint.trim_start_matches('/')
            )
        };

        uri = uri.trim_start_matches('/').to_string();

        for (param, value) in &self.parameters {
            uri = uri.replace(&format!("{{{}}}", param), value);
        }

        self.with_query(uri)
    }

    fn with_query(&self, uri: String) -> String {
        if self.query.is_empty() {
            return uri;
        }

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.query {
            for value in values {
                serializer.append_pair(key, value);
            }
        }

        format!("{}?{}", uri, serializer.finish())
    }

    /// Sets the subresource of the operation.
    pub fn subresource(&mut self, v: &str) {
        self.set_parameter(PARAM_SUBRESOURCE, v);
    }

    /// Sets the name under the subresource.
    pub fn subresource_name(&mut self, v: &str) {
        self.set_parameter(PARAM_SUBRESOURCE_NAME, v);
    }

    /// Sets the resource name. Empty names are ignored.
    pub fn name_parameter(&mut self, v: &str) {
        if v.is_empty() {
            return;
        }
        self.set_parameter(PARAM_NAME, v);
    }

    /// Sets the group, version, API name and versioning of the target
    /// resource type.
    pub fn resource(&mut self, group: &str, version: &str, api_name: &str, versioned: bool) {
        self.set_parameter(PARAM_RESOURCE, api_name);
        if !group.is_empty() {
            self.set_parameter(PARAM_GROUP, group);
        }
        if !version.is_empty() {
            self.set_parameter(PARAM_API_VERSION, version);
        }
        self.versioned_resource = versioned;
    }

    /// Overrides the API version of the resource. Empty versions are
    /// ignored.
    pub fn resource_api_version(&mut self, v: &str) {
        if v.is_empty() {
            return;
        }
        self.set_parameter(PARAM_API_VERSION, v);
    }

    /// Targets a specific stored version of a versioned resource. Empty
    /// versions are ignored.
    pub fn resource_version(&mut self, rv: &str) {
        if rv.is_empty() {
            return;
        }
        self.set_parameter(PARAM_RESOURCE_VERSION, rv);
    }

    /// Sets the workspace of the request. Empty workspaces are ignored.
    pub fn workspace_parameter(&mut self, v: &str) {
        if !v.is_empty() {
            self.set_parameter(PARAM_WORKSPACE, v);
        }
    }

    /// Sets a path parameter.
    pub fn set_parameter(&mut self, key: &str, value: &str) {
        self.parameters.insert(key.to_string(), value.to_string());
    }

    /// Appends a query parameter. Repeats accumulate.
    pub fn add_query_parameter(&mut self, key: &str, value: &str) {
        self.query
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// Returns a path parameter, treating the empty string as absent.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        match self.parameters.get(key) {
            Some(v) if !v.is_empty() => Some(v.as_str()),
            _ => None,
        }
    }

    /// Returns the values of a query parameter, if any were added.
    pub fn query_parameter(&self, key: &str) -> Option<&[String]> {
        match self.query.get(key) {
            Some(v) if !v.is_empty() => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Switches to endpoint mode with the given template, rendered under
    /// the non-resource API base.
    pub fn endpoint(&mut self, v: &str) {
        self.endpoint = v.to_string();
        self.raw_endpoint = false;
    }

    /// Switches to endpoint mode with the given template, rendered
    /// without any base path prefix.
    pub fn raw_endpoint(&mut self, v: &str) {
        self.endpoint = v.to_string();
        self.raw_endpoint = true;
    }
}
