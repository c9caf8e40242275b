//! Typed object operations over the resource API, styled after the
//! controller-runtime client.

use crate::client::Client;
use crate::errors::{Error, Result};
use crate::request::{Parameter, Request, WarningHandler};
use crate::retry;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Identity of a resource type within the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// API group, e.g. `app.appvia.io`.
    pub group: String,
    /// API version, e.g. `v2beta1`.
    pub version: String,
    /// Plural name used in URLs, e.g. `appenvs`.
    pub api_name: String,
    /// True for resources stored as immutable named versions.
    pub versioned: bool,
}

impl ResourceDescriptor {
    /// Creates a descriptor for an unversioned resource.
    pub fn new(group: impl Into<String>, version: impl Into<String>, api_name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            api_name: api_name.into(),
            versioned: false,
        }
    }

    /// Marks the resource as versioned.
    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }
}

/// A typed API object.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// The resource type this object belongs to.
    fn descriptor() -> ResourceDescriptor;

    /// Name of the object.
    fn name(&self) -> &str;

    /// Workspace of the object, empty for workspace-less resources.
    fn workspace(&self) -> &str {
        ""
    }

    /// Generation of the object's spec, bumped by the API on spec
    /// changes only.
    fn generation(&self) -> i64;

    /// Opaque storage revision used for optimistic concurrency.
    fn resource_version(&self) -> &str;

    /// Replaces the storage revision, used when retrying a conflicted
    /// update.
    fn set_resource_version(&mut self, rv: String);

    /// Stored version of the object, empty for unversioned resources.
    fn version(&self) -> &str {
        ""
    }
}

/// A list of typed API objects.
pub trait ObjectList: Serialize + DeserializeOwned + Send + Sync {
    /// The item type.
    type Item: Object;

    /// The listed objects.
    fn items(&self) -> &[Self::Item];
}

/// Addresses a single object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectKey {
    /// Name of the object.
    pub name: String,
    /// Workspace of the object, empty for workspace-less resources.
    pub workspace: String,
    /// Stored version, required for versioned resources.
    pub version: Option<String>,
}

impl ObjectKey {
    /// Keys a workspace-less object by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Scopes the key to a workspace.
    pub fn in_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Targets a stored version.
    pub fn at_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Builds the key addressing the given object.
    pub fn from_object<T: Object>(obj: &T) -> Self {
        let version = if T::descriptor().versioned {
            Some(obj.version().to_string())
        } else {
            None
        };

        Self {
            name: obj.name().to_string(),
            workspace: obj.workspace().to_string(),
            version,
        }
    }
}

/// Options for list operations.
#[derive(Clone, Default)]
pub struct ListOptions {
    /// Restrict the list to a workspace.
    pub workspace: String,
    /// Extra query parameters, e.g. label selectors.
    pub query_parameters: Vec<Parameter>,
}

impl ListOptions {
    /// Creates empty list options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the list to a workspace.
    pub fn in_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Adds a query parameter.
    pub fn with_parameter(mut self, param: Parameter) -> Self {
        self.query_parameters.push(param);
        self
    }
}

/// Options for create operations.
#[derive(Clone, Default)]
pub struct CreateOptions {
    /// Validate server-side without persisting.
    pub dry_run: bool,
    /// Receives any warnings the API attaches to the response.
    pub warning_handler: Option<WarningHandler>,
}

impl CreateOptions {
    /// Creates default create options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates server-side without persisting.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Sets a handler for response warnings.
    pub fn with_warning_handler(mut self, handler: WarningHandler) -> Self {
        self.warning_handler = Some(handler);
        self
    }
}

/// Options for update operations.
#[derive(Clone, Default)]
pub struct UpdateOptions {
    /// Validate server-side without persisting.
    pub dry_run: bool,
    /// Ignore read-only and ownership annotations.
    pub force: bool,
    /// Request a server-side apply.
    pub apply: bool,
    /// Fail immediately on a write conflict instead of retrying
    /// status-only conflicts.
    pub no_retry_on_conflict: bool,
    /// Receives any warnings the API attaches to the response.
    pub warning_handler: Option<WarningHandler>,
}

impl UpdateOptions {
    /// Creates default update options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates server-side without persisting.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Ignores read-only and ownership annotations.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Requests a server-side apply.
    pub fn apply(mut self) -> Self {
        self.apply = true;
        self
    }

    /// Fails immediately on a write conflict.
    pub fn no_retry_on_conflict(mut self) -> Self {
        self.no_retry_on_conflict = true;
        self
    }

    /// Sets a handler for response warnings.
    pub fn with_warning_handler(mut self, handler: WarningHandler) -> Self {
        self.warning_handler = Some(handler);
        self
    }
}

/// Options for delete operations.
#[derive(Clone, Default)]
pub struct DeleteOptions {
    /// Validate server-side without persisting.
    pub dry_run: bool,
    /// Delete without removing underlying cloud resources.
    pub orphan: bool,
    /// Cascade the deletion to dependents.
    pub cascade: bool,
    /// Ignore read-only and ownership annotations.
    pub force: bool,
}

impl DeleteOptions {
    /// Creates default delete options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates server-side without persisting.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Deletes without removing underlying cloud resources.
    pub fn orphan(mut self) -> Self {
        self.orphan = true;
        self
    }

    /// Cascades the deletion to dependents.
    pub fn cascade(mut self) -> Self {
        self.cascade = true;
        self
    }

    /// Ignores read-only and ownership annotations.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = Vec::new();
        if self.dry_run {
            params.push(Parameter::dry_run());
        }
        if self.orphan {
            params.push(Parameter::orphan());
        }
        if self.cascade {
            params.push(Parameter::cascade());
        }
        if self.force {
            params.push(Parameter::force());
        }
        params
    }
}

/// Typed operations over API objects.
#[derive(Clone)]
pub struct ObjectClient {
    client: Client,
}

impl ObjectClient {
    /// Wraps the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Returns the underlying client.
    pub fn resource_client(&self) -> &Client {
        &self.client
    }

    /// Retrieves the object addressed by the key.
    pub async fn get<T: Object>(&self, key: &ObjectKey) -> Result<T> {
        let descriptor = T::descriptor();

        let mut req = self.client.request().await;
        if !key.workspace.is_empty() {
            req.workspace(&key.workspace);
        }
        if descriptor.versioned {
            match key.version.as_deref() {
                Some(version) if !version.is_empty() => {
                    req.resource_version(version);
                }
                _ => {
                    return Err(Error::InvalidOperation(format!(
                        "must set version of {} to retrieve",
                        key.name
                    )))
                }
            }
        }

        req.resource(&descriptor).name(&key.name).get().await.json()
    }

    /// Lists objects of the type.
    pub async fn list<L: ObjectList>(&self, opts: ListOptions) -> Result<L> {
        let descriptor = L::Item::descriptor();

        let mut req = self.client.request().await;
        if !opts.workspace.is_empty() {
            req.workspace(&opts.workspace);
        }
        req.parameters(opts.query_parameters);

        req.resource(&descriptor).get().await.json()
    }

    /// Lists the stored versions of a named versioned object.
    pub async fn list_versions<L: ObjectList>(&self, name: &str, opts: ListOptions) -> Result<L> {
        let descriptor = L::Item::descriptor();
        if !descriptor.versioned {
            return Err(Error::InvalidOperation(
                "cannot list versions of a non-versioned object".to_string(),
            ));
        }

        let mut req = self.client.request().await;
        if !opts.workspace.is_empty() {
            req.workspace(&opts.workspace);
        }
        req.parameters(opts.query_parameters);

        req.resource(&descriptor).name(name).get().await.json()
    }

    /// Creates the object, replacing it with the server's view on
    /// success.
    pub async fn create<T: Object>(&self, obj: &mut T, opts: CreateOptions) -> Result<()> {
        let descriptor = T::descriptor();

        let mut req = self.client.request().await;
        if !obj.workspace().is_empty() {
            req.workspace(obj.workspace());
        }
        if opts.dry_run {
            req.parameters([Parameter::dry_run()]);
        }
        if let Some(handler) = opts.warning_handler {
            req.with_warning_handler(handler);
        }

        *obj = req
            .resource(&descriptor)
            .payload(obj)
            .create()
            .await
            .json()?;

        Ok(())
    }

    /// Updates the object, replacing it with the server's view on
    /// success.
    ///
    /// A write conflict is retried when re-fetching the object shows the
    /// same generation: the spec was untouched, so only the storage
    /// revision moved (typically a status write) and it is safe to adopt
    /// the new revision and try again. A changed generation surfaces the
    /// original conflict.
    pub async fn update<T: Object>(&self, obj: &mut T, opts: UpdateOptions) -> Result<()> {
        let descriptor = T::descriptor();
        if descriptor.versioned && obj.version().is_empty() {
            return Err(Error::InvalidOperation(
                "version must be set on provided object to update".to_string(),
            ));
        }

        let mut last_conflict: Option<Error> = None;

        for _ in 0..retry::CONFLICT_ATTEMPTS {
            let mut req = self.client.request().await;
            if !obj.workspace().is_empty() {
                req.workspace(obj.workspace());
            }
            if opts.dry_run {
                req.parameters([Parameter::dry_run()]);
            }
            if opts.force {
                req.parameters([Parameter::force()]);
            }
            if opts.apply {
                req.parameters([Parameter::apply()]);
            }
            if descriptor.versioned {
                req.resource_version(obj.version());
            }
            if let Some(handler) = &opts.warning_handler {
                req.with_warning_handler(handler.clone());
            }

            req.resource(&descriptor)
                .name(obj.name())
                .payload(obj)
                .update()
                .await;

            match req.error() {
                Ok(()) => {
                    *obj = req.json()?;
                    return Ok(());
                }
                Err(e) if e.is_object_modified() && !opts.no_retry_on_conflict => {
                    let refetched: T = self
                        .get(&ObjectKey::from_object(obj))
                        .await
                        .map_err(|ge| Error::ConflictRefetch(Box::new(ge)))?;

                    if refetched.generation() != obj.generation() {
                        // the spec changed underneath us, not safe to
                        // silently retry
                        return Err(e);
                    }

                    obj.set_resource_version(refetched.resource_version().to_string());
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or(Error::MaxAttemptsReached))
    }

    /// Deletes the object, replacing it with the server's view of the
    /// deleted object on success.
    pub async fn delete<T: Object>(&self, obj: &mut T, opts: DeleteOptions) -> Result<()> {
        let descriptor = T::descriptor();
        if descriptor.versioned && obj.version().is_empty() {
            return Err(Error::InvalidOperation(
                "version must be set on provided object to delete".to_string(),
            ));
        }

        let mut req = self.client.request().await;
        if descriptor.versioned {
            req.resource_version(obj.version());
        }
        if !obj.workspace().is_empty() {
            req.workspace(obj.workspace());
        }
        req.parameters(opts.parameters());

        req.resource(&descriptor).name(obj.name()).delete().await;
        req.error()?;

        if !req.body().is_empty() {
            *obj = req.json()?;
        }

        Ok(())
    }

    /// Deletes every stored version of a versioned object, returning the
    /// deleted versions.
    pub async fn delete_all_versions<L: ObjectList>(
        &self,
        key: &ObjectKey,
        opts: DeleteOptions,
    ) -> Result<L> {
        let descriptor = L::Item::descriptor();

        let mut req = self.client.request().await;
        if !key.workspace.is_empty() {
            req.workspace(&key.workspace);
        }
        req.parameters(opts.parameters());

        req.resource(&descriptor).name(&key.name).delete().await.json()
    }

    /// Starts a request against an arbitrary endpoint. Paths under the
    /// known API bases are used verbatim; anything else is treated as a
    /// template under the non-resource API.
    pub async fn endpoint_request(&self, endpoint: &str) -> Request {
        let mut req = self.client.request().await;
        if endpoint.starts_with("/resources/") || endpoint.starts_with("/api/") {
            req.raw_endpoint(endpoint);
        } else {
            req.endpoint(endpoint);
        }
        req
    }

    /// Starts a request pre-targeted at the object's resource type.
    pub async fn resource_request<T: Object>(&self) -> Request {
        let mut req = self.client.request().await;
        req.resource(&T::descriptor());
        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pipeline {
        name: String,
        workspace: String,
        #[serde(default)]
        generation: i64,
        #[serde(rename = "resourceVersion", default)]
        resource_version: String,
        #[serde(default)]
        version: String,
    }

    impl Object for Pipeline {
        fn descriptor() -> ResourceDescriptor {
            ResourceDescriptor::new("app.appvia.io", "v2beta1", "pipelines").versioned()
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn workspace(&self) -> &str {
            &self.workspace
        }

        fn generation(&self) -> i64 {
            self.generation
        }

        fn resource_version(&self) -> &str {
            &self.resource_version
        }

        fn set_resource_version(&mut self, rv: String) {
            self.resource_version = rv;
        }

        fn version(&self) -> &str {
            &self.version
        }
    }

    #[test]
    fn test_object_key_from_object() {
        let pipeline = Pipeline {
            name: "build".to_string(),
            workspace: "teamA".to_string(),
            generation: 3,
            resource_version: "41".to_string(),
            version: "1.0.2".to_string(),
        };

        let key = ObjectKey::from_object(&pipeline);
        assert_eq!(key.name, "build");
        assert_eq!(key.workspace, "teamA");
        assert_eq!(key.version.as_deref(), Some("1.0.2"));
    }

    #[test]
    fn test_object_key_builders() {
        let key = ObjectKey::new("prod").in_workspace("teamA").at_version("v3");
        assert_eq!(key.name, "prod");
        assert_eq!(key.workspace, "teamA");
        assert_eq!(key.version.as_deref(), Some("v3"));
    }

    #[test]
    fn test_delete_options_parameters() {
        let opts = DeleteOptions::new().dry_run().orphan().cascade().force();
        assert_eq!(
            opts.parameters(),
            vec![
                Parameter::dry_run(),
                Parameter::orphan(),
                Parameter::cascade(),
                Parameter::force(),
            ]
        );

        assert!(DeleteOptions::new().parameters().is_empty());
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = ResourceDescriptor::new("app.appvia.io", "v2beta1", "appenvs");
        assert!(!descriptor.versioned);
        assert!(descriptor.clone().versioned().versioned);
    }
}
