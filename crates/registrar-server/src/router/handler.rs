//! Resource handler capability and its two variants

use super::{RequestContext, RouteEntry, Verb, check_scope};
use crate::error::{ApiError, Result};
use crate::store::{InstanceStore, StoreError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use registrar_crd::{DynamicObject, RegistrationSpec, WatchEvent};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// Stream of watch events rendered as JSON
pub type WatchStream = BoxStream<'static, WatchEvent<Value>>;

/// Operations every resource handler serves over opaque JSON records
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn create(&self, ctx: &RequestContext, body: Value) -> Result<Value>;

    async fn get(&self, ctx: &RequestContext) -> Result<Value>;

    async fn list(&self, ctx: &RequestContext) -> Result<Value>;

    async fn watch(&self, ctx: &RequestContext) -> Result<WatchStream>;

    async fn update(&self, ctx: &RequestContext, body: Value) -> Result<Value>;

    /// JSON merge patch on top of the current object.
    ///
    /// The current resourceVersion travels with the merged object, so a
    /// concurrent write turns into a conflict instead of being overwritten.
    async fn patch(&self, ctx: &RequestContext, patch: Value) -> Result<Value> {
        let mut current = self.get(ctx).await?;
        merge_patch(&mut current, &patch);
        self.update(ctx, current).await
    }

    async fn delete(&self, ctx: &RequestContext) -> Result<Value>;
}

/// Apply an RFC 7386 merge patch in place
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Collection response body
pub fn list_object(api_version: &str, list_kind: &str, items: Vec<Value>) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": list_kind,
        "items": items,
    })
}

pub(crate) fn required_name(ctx: &RequestContext) -> Result<&str> {
    ctx.name
        .as_deref()
        .ok_or_else(|| ApiError::Invalid("resource name is required".to_string()))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

/// Turn a broadcast receiver into a JSON watch stream, keeping only events
/// that pass `keep`.
pub(crate) fn watch_stream<T>(
    receiver: tokio::sync::broadcast::Receiver<WatchEvent<T>>,
    keep: impl Fn(&T) -> bool + Send + 'static,
) -> WatchStream
where
    T: Serialize + Clone + Send + 'static,
{
    let stream = BroadcastStream::new(receiver).filter_map(move |event| match event {
        Ok(event) if keep(&event.object) => match serde_json::to_value(&event.object) {
            Ok(object) => Some(WatchEvent {
                event_type: event.event_type,
                object,
            }),
            Err(e) => {
                warn!(error = %e, "Dropping unserializable watch event");
                None
            }
        },
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            warn!(missed, "Watcher fell behind; events were dropped");
            None
        }
    });
    Box::pin(stream)
}

/// A compiled-in resource type served ahead of dynamic registrations
#[derive(Clone)]
pub struct StaticRoute {
    /// Identifiers of the built-in type; also reserved in the value space
    pub spec: RegistrationSpec,
    pub handler: Arc<dyn ResourceHandler>,
}

impl StaticRoute {
    pub fn new(spec: RegistrationSpec, handler: Arc<dyn ResourceHandler>) -> Self {
        Self { spec, handler }
    }

    fn matches(&self, ctx: &RequestContext) -> bool {
        self.spec.group == ctx.group
            && self.spec.version == ctx.version
            && self.spec.plural_name == ctx.resource
    }
}

/// Ordered chain of built-in handlers. The first matching route wins;
/// anything unmatched is not found.
#[derive(Clone, Default)]
pub struct StaticHandler {
    chain: Arc<Vec<StaticRoute>>,
}

impl StaticHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, route: StaticRoute) -> Self {
        Arc::make_mut(&mut self.chain).push(route);
        self
    }

    pub fn routes(&self) -> impl Iterator<Item = &StaticRoute> {
        self.chain.iter()
    }

    fn resolve(&self, ctx: &RequestContext) -> Result<&Arc<dyn ResourceHandler>> {
        let route = self
            .chain
            .iter()
            .find(|route| route.matches(ctx))
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "the server could not find the requested resource {}/{}",
                    ctx.resource_name(),
                    ctx.version
                ))
            })?;
        check_scope(ctx, route.spec.cluster_scoped)?;
        Ok(&route.handler)
    }
}

impl fmt::Debug for StaticHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.chain.iter().map(|r| r.spec.derived_name()))
            .finish()
    }
}

#[async_trait]
impl ResourceHandler for StaticHandler {
    async fn create(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        self.resolve(ctx)?.create(ctx, body).await
    }

    async fn get(&self, ctx: &RequestContext) -> Result<Value> {
        self.resolve(ctx)?.get(ctx).await
    }

    async fn list(&self, ctx: &RequestContext) -> Result<Value> {
        self.resolve(ctx)?.list(ctx).await
    }

    async fn watch(&self, ctx: &RequestContext) -> Result<WatchStream> {
        self.resolve(ctx)?.watch(ctx).await
    }

    async fn update(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        self.resolve(ctx)?.update(ctx, body).await
    }

    async fn patch(&self, ctx: &RequestContext, patch: Value) -> Result<Value> {
        self.resolve(ctx)?.patch(ctx, patch).await
    }

    async fn delete(&self, ctx: &RequestContext) -> Result<Value> {
        self.resolve(ctx)?.delete(ctx).await
    }
}

/// Serves instances of one accepted registration from its storage scope
#[derive(Clone)]
pub struct DynamicHandler {
    route: RouteEntry,
    instances: Arc<dyn InstanceStore>,
}

impl DynamicHandler {
    pub fn new(route: RouteEntry, instances: Arc<dyn InstanceStore>) -> Self {
        Self { route, instances }
    }

    pub fn route(&self) -> &RouteEntry {
        &self.route
    }

    fn not_found(&self, name: &str) -> ApiError {
        ApiError::NotFound(format!(
            "{}.{} \"{}\"",
            self.route.plural, self.route.group, name
        ))
    }

    fn map_store_error(&self, verb: Verb, name: &str, err: StoreError) -> ApiError {
        match err {
            StoreError::NotFound(_) => self.not_found(name),
            StoreError::AlreadyExists(_) => ApiError::AlreadyExists(format!(
                "{}.{} \"{}\"",
                self.route.plural, self.route.group, name
            )),
            // The route was selected before the registration started terminating.
            StoreError::Closed(_) => ApiError::Terminating {
                resource: self.route.registration.clone(),
                verb: verb.to_string(),
            },
            other => other.into(),
        }
    }

    /// Parse a request body and reconcile it with the URL
    fn decode(&self, ctx: &RequestContext, body: Value) -> Result<DynamicObject> {
        let mut object: DynamicObject = serde_json::from_value(body)?;

        let api_version = self.route.api_version();
        if object.type_meta.api_version.is_empty() {
            object.type_meta.api_version = api_version;
        } else if object.type_meta.api_version != api_version {
            return Err(ApiError::Invalid(format!(
                "apiVersion {} does not match {}",
                object.type_meta.api_version, api_version
            )));
        }

        if object.type_meta.kind.is_empty() {
            object.type_meta.kind = self.route.kind.clone();
        } else if object.type_meta.kind != self.route.kind {
            return Err(ApiError::Invalid(format!(
                "kind {} does not match {}",
                object.type_meta.kind, self.route.kind
            )));
        }

        if let Some(name) = &ctx.name {
            if object.metadata.name.is_empty() {
                object.metadata.name = name.clone();
            } else if &object.metadata.name != name {
                return Err(ApiError::Invalid(format!(
                    "metadata.name {} does not match {} in the request path",
                    object.metadata.name, name
                )));
            }
        }
        if object.metadata.name.is_empty() {
            return Err(ApiError::Invalid("metadata.name is required".to_string()));
        }

        if let Some(body_ns) = object.metadata.namespace.as_deref() {
            match ctx.namespace.as_deref() {
                None => {
                    return Err(ApiError::Invalid(format!(
                        "{} is cluster-scoped; metadata.namespace must be empty",
                        self.route.registration
                    )));
                }
                Some(path_ns) if path_ns != body_ns => {
                    return Err(ApiError::Invalid(format!(
                        "metadata.namespace {} does not match {} in the request path",
                        body_ns, path_ns
                    )));
                }
                Some(_) => {}
            }
        }
        object.metadata.namespace = ctx.namespace.clone();

        Ok(object)
    }
}

impl fmt::Debug for DynamicHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicHandler")
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceHandler for DynamicHandler {
    async fn create(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        let object = self.decode(ctx, body)?;
        let created = self
            .instances
            .create_instance(&self.route.scope, &object)
            .await
            .map_err(|e| self.map_store_error(ctx.verb, object.name(), e))?;
        to_json(&created)
    }

    async fn get(&self, ctx: &RequestContext) -> Result<Value> {
        let name = required_name(ctx)?;
        let object = self
            .instances
            .get_instance(&self.route.scope, ctx.namespace.as_deref(), name)
            .await?
            .ok_or_else(|| self.not_found(name))?;
        to_json(&object)
    }

    async fn list(&self, ctx: &RequestContext) -> Result<Value> {
        let items = self
            .instances
            .list_instances(&self.route.scope, ctx.namespace.as_deref())
            .await?
            .iter()
            .map(to_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(list_object(
            &self.route.api_version(),
            &self.route.list_kind,
            items,
        ))
    }

    async fn watch(&self, ctx: &RequestContext) -> Result<WatchStream> {
        let receiver = self.instances.watch_instances(&self.route.scope)?;
        let namespace = ctx.namespace.clone();
        Ok(watch_stream(receiver, move |object: &DynamicObject| {
            namespace.is_none() || object.namespace() == namespace.as_deref()
        }))
    }

    async fn update(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        let object = self.decode(ctx, body)?;
        let updated = self
            .instances
            .update_instance(&self.route.scope, &object)
            .await
            .map_err(|e| self.map_store_error(ctx.verb, object.name(), e))?;
        to_json(&updated)
    }

    async fn delete(&self, ctx: &RequestContext) -> Result<Value> {
        let name = required_name(ctx)?;
        let namespace = ctx.namespace.as_deref();
        let existing = self
            .instances
            .get_instance(&self.route.scope, namespace, name)
            .await?
            .ok_or_else(|| self.not_found(name))?;

        self.instances
            .delete_instance(&self.route.scope, namespace, name)
            .await?;
        to_json(&existing)
    }
}

/// The handler chosen for one request
#[derive(Debug)]
pub enum Handler {
    Static(StaticHandler),
    Dynamic(DynamicHandler),
}

impl Handler {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }

    fn inner(&self) -> &dyn ResourceHandler {
        match self {
            Self::Static(handler) => handler,
            Self::Dynamic(handler) => handler,
        }
    }
}

#[async_trait]
impl ResourceHandler for Handler {
    async fn create(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        self.inner().create(ctx, body).await
    }

    async fn get(&self, ctx: &RequestContext) -> Result<Value> {
        self.inner().get(ctx).await
    }

    async fn list(&self, ctx: &RequestContext) -> Result<Value> {
        self.inner().list(ctx).await
    }

    async fn watch(&self, ctx: &RequestContext) -> Result<WatchStream> {
        self.inner().watch(ctx).await
    }

    async fn update(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        self.inner().update(ctx, body).await
    }

    async fn patch(&self, ctx: &RequestContext, patch: Value) -> Result<Value> {
        self.inner().patch(ctx, patch).await
    }

    async fn delete(&self, ctx: &RequestContext) -> Result<Value> {
        self.inner().delete(ctx).await
    }
}
