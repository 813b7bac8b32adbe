//! The `Registration` resource

use crate::error::{ApiError, Result};
use crate::router::{
    RequestContext, ResourceHandler, WatchStream, list_object, required_name, to_json, watch_stream,
};
use crate::store::{RegistrationStore, StoreError};
use crate::termination::TerminationController;
use async_trait::async_trait;
use registrar_crd::{API_GROUP, API_VERSION, Registration, RegistrationSpec, TypeMeta, VERSION};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Owner ids of reserved built-in identifiers start with this. `/` cannot
/// appear in a registration name, so no registration can ever match one.
pub const BUILTIN_OWNER_PREFIX: &str = "builtin/";

pub fn builtin_owner(spec: &RegistrationSpec) -> String {
    format!("{}{}", BUILTIN_OWNER_PREFIX, spec.derived_name())
}

/// Identifiers of the Registration type itself
pub fn registration_type_spec() -> RegistrationSpec {
    RegistrationSpec {
        group: API_GROUP.to_string(),
        version: VERSION.to_string(),
        plural_name: "registrations".to_string(),
        singular_name: Some("registration".to_string()),
        short_names: vec!["reg".to_string()],
        kind: "Registration".to_string(),
        list_kind: Some("RegistrationList".to_string()),
        cluster_scoped: true,
    }
}

pub struct RegistrationHandler {
    store: Arc<dyn RegistrationStore>,
    termination: Arc<TerminationController>,
}

impl RegistrationHandler {
    pub fn new(store: Arc<dyn RegistrationStore>, termination: Arc<TerminationController>) -> Self {
        Self { store, termination }
    }

    fn not_found(name: &str) -> ApiError {
        ApiError::NotFound(format!("registrations.{} \"{}\"", API_GROUP, name))
    }

    fn map_store_error(name: &str, err: StoreError) -> ApiError {
        match err {
            StoreError::NotFound(_) => Self::not_found(name),
            StoreError::AlreadyExists(_) => {
                ApiError::AlreadyExists(format!("registrations.{} \"{}\"", API_GROUP, name))
            }
            other => other.into(),
        }
    }

    fn decode(ctx: &RequestContext, body: Value) -> Result<Registration> {
        let mut registration: Registration = serde_json::from_value(body)?;

        if registration.type_meta.api_version.is_empty() && registration.type_meta.kind.is_empty() {
            registration.type_meta = TypeMeta::registration();
        } else if registration.type_meta != TypeMeta::registration() {
            return Err(ApiError::Invalid(format!(
                "expected {} Registration, got {} {}",
                API_VERSION, registration.type_meta.api_version, registration.type_meta.kind
            )));
        }

        if let Some(name) = &ctx.name {
            if registration.metadata.name.is_empty() {
                registration.metadata.name = name.clone();
            } else if &registration.metadata.name != name {
                return Err(ApiError::Invalid(format!(
                    "metadata.name {} does not match {} in the request path",
                    registration.metadata.name, name
                )));
            }
        }

        Ok(registration)
    }
}

#[async_trait]
impl ResourceHandler for RegistrationHandler {
    async fn create(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        let registration = Self::decode(ctx, body)?;
        registration.validate_create()?;

        let created = self
            .store
            .create_registration(&registration)
            .await
            .map_err(|e| Self::map_store_error(registration.name(), e))?;
        info!(registration = %created.name(), "Registration created");
        to_json(&created)
    }

    async fn get(&self, ctx: &RequestContext) -> Result<Value> {
        let name = required_name(ctx)?;
        let registration = self
            .store
            .get_registration(name)
            .await?
            .ok_or_else(|| Self::not_found(name))?;
        to_json(&registration)
    }

    async fn list(&self, _ctx: &RequestContext) -> Result<Value> {
        let items = self
            .store
            .list_registrations()
            .await?
            .iter()
            .map(to_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(list_object(API_VERSION, "RegistrationList", items))
    }

    async fn watch(&self, _ctx: &RequestContext) -> Result<WatchStream> {
        Ok(watch_stream(self.store.watch_registrations(), |_: &Registration| true))
    }

    /// Spec, labels and annotations only; status is owned by the control plane
    async fn update(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        let registration = Self::decode(ctx, body)?;
        registration.validate()?;

        let updated = self
            .store
            .update_registration(&registration)
            .await
            .map_err(|e| Self::map_store_error(registration.name(), e))?;
        to_json(&updated)
    }

    async fn delete(&self, ctx: &RequestContext) -> Result<Value> {
        let name = required_name(ctx)?;
        let registration = self
            .termination
            .request_delete(name)
            .await
            .map_err(|e| Self::map_store_error(name, e))?;
        to_json(&registration)
    }
}
