//! Delegating request router
//!
//! Every resource request passes through [`DelegatingRouter::select`]. The
//! router looks the `(group, version, plural)` tuple up in the current route
//! snapshot:
//!
//! - no match: the static handler chain gets the request unmodified
//! - match: the dynamic handler for that registration serves it, after the
//!   registration's scope is enforced and, if the registration is
//!   terminating, mutating verbs are rejected
//!
//! The snapshot is swapped atomically by the reconciler and the termination
//! controller; the request path never waits on either of them and holds no
//! lock while a handler runs.

mod handler;
mod snapshot;

pub use handler::{
    DynamicHandler, Handler, ResourceHandler, StaticHandler, StaticRoute, WatchStream,
    list_object, merge_patch,
};
pub(crate) use handler::{required_name, to_json, watch_stream};
pub use snapshot::{RouteEntry, RouteKey, RouteRefresher, RouteSnapshot, RouteTable};

use crate::error::{ApiError, Result};
use crate::store::InstanceStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// API verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Patch,
    Delete,
}

impl Verb {
    /// Verbs refused while a registration terminates
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Patch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Watch => "watch",
            Self::Create => "create",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the router knows about an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub verb: Verb,
    pub group: String,
    pub version: String,
    /// Plural resource name from the URL
    pub resource: String,
    /// `None` means a cluster-scoped access pattern
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl RequestContext {
    pub fn new(
        verb: Verb,
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            verb,
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
            namespace: None,
            name: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(&self.group, &self.version, &self.resource)
    }

    /// `widgets.example.com` style name for messages
    pub fn resource_name(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

/// Result of dispatching a request
pub enum Outcome {
    Object(Value),
    Watch(WatchStream),
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(value) => f.debug_tuple("Object").field(value).finish(),
            Self::Watch(_) => f.write_str("Watch(..)"),
        }
    }
}

/// Reject requests whose namespace presence disagrees with the type's scope
pub(crate) fn check_scope(ctx: &RequestContext, cluster_scoped: bool) -> Result<()> {
    match (cluster_scoped, ctx.namespace.is_some()) {
        (true, true) => Err(ApiError::ScopeMismatch {
            resource: ctx.resource_name(),
            scope: "cluster-scoped",
            hint: "it cannot be accessed inside a namespace",
        }),
        (false, false) => Err(ApiError::ScopeMismatch {
            resource: ctx.resource_name(),
            scope: "namespaced",
            hint: "a namespace is required",
        }),
        _ => Ok(()),
    }
}

pub struct DelegatingRouter {
    routes: Arc<RouteSnapshot>,
    instances: Arc<dyn InstanceStore>,
    fallback: StaticHandler,
}

impl DelegatingRouter {
    pub fn new(
        routes: Arc<RouteSnapshot>,
        instances: Arc<dyn InstanceStore>,
        fallback: StaticHandler,
    ) -> Self {
        Self {
            routes,
            instances,
            fallback,
        }
    }

    pub fn routes(&self) -> &Arc<RouteSnapshot> {
        &self.routes
    }

    /// Pick the handler that owns this request
    pub fn select(&self, ctx: &RequestContext) -> Result<Handler> {
        let table = self.routes.load();

        let Some(entry) = table.get(&ctx.route_key()) else {
            debug!(resource = %ctx.resource_name(), version = %ctx.version, "No dynamic route, delegating");
            return Ok(Handler::Static(self.fallback.clone()));
        };

        check_scope(ctx, entry.cluster_scoped)?;

        if entry.terminating && ctx.verb.is_mutating() {
            return Err(ApiError::Terminating {
                resource: entry.registration.clone(),
                verb: ctx.verb.to_string(),
            });
        }

        Ok(Handler::Dynamic(DynamicHandler::new(
            entry.clone(),
            self.instances.clone(),
        )))
    }

    /// Select a handler and run the request against it
    pub async fn dispatch(&self, ctx: &RequestContext, body: Option<Value>) -> Result<Outcome> {
        let handler = self.select(ctx)?;
        debug!(verb = %ctx.verb, resource = %ctx.resource_name(), dynamic = handler.is_dynamic(), "Dispatching");

        let value = match ctx.verb {
            Verb::Get => handler.get(ctx).await?,
            Verb::List => handler.list(ctx).await?,
            Verb::Watch => return Ok(Outcome::Watch(handler.watch(ctx).await?)),
            Verb::Create => handler.create(ctx, require_body(body)?).await?,
            Verb::Update => handler.update(ctx, require_body(body)?).await?,
            Verb::Patch => handler.patch(ctx, require_body(body)?).await?,
            Verb::Delete => handler.delete(ctx).await?,
        };
        Ok(Outcome::Object(value))
    }
}

fn require_body(body: Option<Value>) -> Result<Value> {
    body.ok_or_else(|| ApiError::Invalid("request body is required".to_string()))
}
