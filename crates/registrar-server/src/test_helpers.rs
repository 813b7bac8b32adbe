//! Test helpers for registrar-server integration tests
//!
//! Provides utilities for creating test instances of the control plane and
//! its HTTP API.

use crate::config::{ReconcilerConfig, RegistrarConfig, TerminationConfig};
use crate::store::{MemoryInstanceStore, MemoryStore};
use crate::{AppState, ControlPlane};
use std::sync::Arc;

/// Configuration with short resync and backoff intervals
pub fn test_config() -> RegistrarConfig {
    RegistrarConfig {
        reconciler: ReconcilerConfig {
            resync_interval_secs: 1,
        },
        termination: TerminationConfig {
            initial_backoff_ms: 5,
            max_backoff_ms: 50,
        },
        ..RegistrarConfig::default()
    }
}

/// Started control plane over in-memory stores. The instance store is
/// returned as well so tests can take it offline.
pub async fn create_test_app_state_with(
    config: RegistrarConfig,
) -> (AppState, Arc<MemoryInstanceStore>) {
    let instances = Arc::new(MemoryInstanceStore::new());
    let control_plane = ControlPlane::new(config, Arc::new(MemoryStore::new()), instances.clone())
        .expect("Failed to build control plane");
    let control_plane = Arc::new(control_plane);
    control_plane
        .start()
        .await
        .expect("Failed to start control plane");
    (AppState::new(control_plane), instances)
}

/// Create a minimal AppState for testing
pub async fn create_test_app_state() -> AppState {
    create_test_app_state_with(test_config()).await.0
}

/// Create a test router with API routes
pub async fn create_test_api_router() -> axum::Router {
    crate::api::api_router(create_test_app_state().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use registrar_crd::{ConditionType, Registration};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::ServiceExt;

    const REGISTRATIONS: &str = "/apis/registrar.io/v1/registrations";

    async fn send(
        app: &axum::Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn registration_body(plural: &str, kind: &str, cluster_scoped: bool) -> Value {
        json!({
            "apiVersion": "registrar.io/v1",
            "kind": "Registration",
            "metadata": {"name": format!("{}.example.com", plural)},
            "spec": {
                "group": "example.com",
                "version": "v1",
                "pluralName": plural,
                "kind": kind,
                "clusterScoped": cluster_scoped,
            },
        })
    }

    async fn get_registration(app: &axum::Router, name: &str) -> Option<Registration> {
        let (status, body) = send(app, Method::GET, &format!("{}/{}", REGISTRATIONS, name), None).await;
        match status {
            StatusCode::OK => Some(serde_json::from_value(body).unwrap()),
            StatusCode::NOT_FOUND => None,
            other => panic!("unexpected status {} reading {}", other, name),
        }
    }

    /// Poll until `check` holds for the registration (or its absence)
    async fn wait_until(
        app: &axum::Router,
        name: &str,
        what: &str,
        check: impl Fn(Option<&Registration>) -> bool,
    ) -> Option<Registration> {
        for _ in 0..300 {
            let current = get_registration(app, name).await;
            if check(current.as_ref()) {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never became {}", name, what);
    }

    async fn wait_accepted(app: &axum::Router, name: &str) -> Registration {
        wait_until(app, name, "accepted", |r| r.is_some_and(Registration::is_accepted))
            .await
            .unwrap()
    }

    async fn wait_rejected(app: &axum::Router, name: &str) -> Registration {
        wait_until(app, name, "rejected", |r| {
            r.is_some_and(|r| r.conditions().is_true(ConditionType::NameConflict))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_test_app_state() {
        let state = create_test_app_state().await;
        assert_eq!(state.router.routes().load().len(), 0);
    }

    #[tokio::test]
    async fn test_healthz() {
        let app = create_test_api_router().await;
        let (status, body) = send(&app, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["routes"], 0);
    }

    #[tokio::test]
    async fn test_registration_is_accepted_and_served() {
        let app = create_test_api_router().await;

        let (status, body) = send(
            &app,
            Method::POST,
            REGISTRATIONS,
            Some(registration_body("widgets", "Widget", false)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["metadata"]["generation"], 1);

        let accepted = wait_accepted(&app, "widgets.example.com").await;
        let condition = accepted.conditions().get(ConditionType::NameConflict).cloned().unwrap();
        assert_eq!(condition.reason, "NoConflicts");

        // Route publication follows acceptance.
        let mut served = false;
        for _ in 0..300 {
            let (status, _) = send(&app, Method::GET, "/apis/example.com/v1/namespaces/ns1/widgets", None).await;
            if status == StatusCode::OK {
                served = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(served, "widgets were never routed");

        let (status, created) = send(
            &app,
            Method::POST,
            "/apis/example.com/v1/namespaces/ns1/widgets",
            Some(json!({"metadata": {"name": "w1"}, "spec": {"size": 3}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["kind"], "Widget");

        let (status, list) = send(&app, Method::GET, "/apis/example.com/v1/namespaces/ns1/widgets", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["kind"], "WidgetList");
        assert_eq!(list["items"][0]["metadata"]["name"], "w1");

        // Namespaced type without a namespace.
        let (status, body) = send(&app, Method::GET, "/apis/example.com/v1/widgets", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "scope_mismatch");
    }

    #[tokio::test]
    async fn test_conflicting_registration_is_rejected_then_heals() {
        let app = create_test_api_router().await;

        send(&app, Method::POST, REGISTRATIONS, Some(registration_body("widgets", "Widget", false))).await;
        wait_accepted(&app, "widgets.example.com").await;

        // Same kind in the same group.
        let (status, _) = send(
            &app,
            Method::POST,
            REGISTRATIONS,
            Some(registration_body("gadgets", "Widget", false)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let rejected = wait_rejected(&app, "gadgets.example.com").await;
        let condition = rejected.conditions().get(ConditionType::NameConflict).cloned().unwrap();
        assert_eq!(condition.reason, "ConflictingName");
        assert!(condition.message.contains("widgets.example.com"));

        let owner = get_registration(&app, "widgets.example.com").await.unwrap();
        assert!(owner.is_accepted(), "the first owner must keep its names");

        let (status, body) = send(&app, Method::GET, "/apis/example.com/v1/namespaces/ns1/gadgets", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["reason"], "not_found");

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("{}/widgets.example.com", REGISTRATIONS),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        wait_accepted(&app, "gadgets.example.com").await;
    }

    #[tokio::test]
    async fn test_same_plural_collides_on_object_name() {
        let app = create_test_api_router().await;

        send(&app, Method::POST, REGISTRATIONS, Some(registration_body("widgets", "Widget", false))).await;
        let (status, body) = send(
            &app,
            Method::POST,
            REGISTRATIONS,
            Some(registration_body("widgets", "Gadget", false)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "already_exists");
    }

    #[tokio::test]
    async fn test_builtin_short_name_cannot_be_claimed() {
        let app = create_test_api_router().await;

        let mut body = registration_body("widgets", "Widget", false);
        body["spec"]["group"] = json!("registrar.io");
        body["metadata"]["name"] = json!("widgets.registrar.io");
        body["spec"]["shortNames"] = json!(["reg"]);
        let (status, _) = send(&app, Method::POST, REGISTRATIONS, Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);

        let rejected = wait_rejected(&app, "widgets.registrar.io").await;
        let condition = rejected.conditions().get(ConditionType::NameConflict).cloned().unwrap();
        assert!(condition.message.contains("builtin/registrations.registrar.io"));
    }

    #[tokio::test]
    async fn test_invalid_registrations_are_refused() {
        let app = create_test_api_router().await;

        let mut wrong_name = registration_body("widgets", "Widget", false);
        wrong_name["metadata"]["name"] = json!("widgets");
        let (status, body) = send(&app, Method::POST, REGISTRATIONS, Some(wrong_name)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["reason"], "invalid");
        assert!(get_registration(&app, "widgets").await.is_none());

        let mut with_status = registration_body("widgets", "Widget", false);
        with_status["status"] = json!({"conditions": [{"type": "NameConflict", "status": "False"}]});
        let (status, _) = send(&app, Method::POST, REGISTRATIONS, Some(with_status)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(&app, Method::POST, REGISTRATIONS, None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["reason"], "invalid");

        let (status, _) = send(
            &app,
            Method::GET,
            "/apis/registrar.io/v1/namespaces/ns1/registrations",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_patch_labels_keeps_generation() {
        let app = create_test_api_router().await;
        send(&app, Method::POST, REGISTRATIONS, Some(registration_body("widgets", "Widget", false))).await;
        wait_accepted(&app, "widgets.example.com").await;

        let (status, body) = send(
            &app,
            Method::PATCH,
            &format!("{}/widgets.example.com", REGISTRATIONS),
            Some(json!({"metadata": {"labels": {"team": "infra"}}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metadata"]["labels"]["team"], "infra");
        assert_eq!(body["metadata"]["generation"], 1);
    }

    /// Poll `uri` until it answers with `want`
    async fn wait_for_status(app: &axum::Router, uri: &str, want: StatusCode) {
        for _ in 0..300 {
            let (status, _) = send(app, Method::GET, uri, None).await;
            if status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never answered {}", uri, want);
    }

    #[tokio::test]
    async fn test_version_change_moves_the_route() {
        let app = create_test_api_router().await;
        send(&app, Method::POST, REGISTRATIONS, Some(registration_body("widgets", "Widget", false))).await;
        wait_accepted(&app, "widgets.example.com").await;
        let v1 = "/apis/example.com/v1/namespaces/ns1/widgets";
        let v2 = "/apis/example.com/v2/namespaces/ns1/widgets";
        wait_for_status(&app, v1, StatusCode::OK).await;

        let current = get_registration(&app, "widgets.example.com").await.unwrap();
        let mut respec = serde_json::to_value(&current).unwrap();
        respec["spec"]["version"] = json!("v2");
        let (status, body) = send(
            &app,
            Method::PUT,
            &format!("{}/widgets.example.com", REGISTRATIONS),
            Some(respec),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metadata"]["generation"], 2);

        wait_for_status(&app, v2, StatusCode::OK).await;
        let (status, _) = send(&app, Method::GET, v1, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, created) = send(&app, Method::POST, v2, Some(json!({"metadata": {"name": "w1"}}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["apiVersion"], "example.com/v2");
    }

    #[tokio::test]
    async fn test_terminating_type_refuses_writes_but_serves_reads() {
        // Backoff long enough that the drain cannot finish during the test.
        let mut config = test_config();
        config.termination = TerminationConfig {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        };
        config.reconciler.resync_interval_secs = 60;
        let (state, instances) = create_test_app_state_with(config).await;
        let app = crate::api::api_router(state);

        send(&app, Method::POST, REGISTRATIONS, Some(registration_body("widgets", "Widget", false))).await;
        wait_accepted(&app, "widgets.example.com").await;
        let widgets = "/apis/example.com/v1/namespaces/ns1/widgets";
        let mut created = StatusCode::NOT_FOUND;
        for _ in 0..300 {
            created = send(&app, Method::POST, widgets, Some(json!({"metadata": {"name": "w1"}}))).await.0;
            if created == StatusCode::CREATED {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(created, StatusCode::CREATED);

        // First drain attempt fails and backs off.
        instances.set_available(false);
        let (status, body) = send(
            &app,
            Method::DELETE,
            &format!("{}/widgets.example.com", REGISTRATIONS),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let deleted: Registration = serde_json::from_value(body).unwrap();
        assert!(deleted.is_terminating());
        assert!(deleted.metadata.deletion_timestamp.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        instances.set_available(true);

        let (status, body) = send(&app, Method::POST, widgets, Some(json!({"metadata": {"name": "w2"}}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "terminating");

        let (status, body) = send(
            &app,
            Method::PATCH,
            &format!("{}/w1", widgets),
            Some(json!({"spec": {"size": 2}})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "terminating");

        let (status, _) = send(&app, Method::GET, &format!("{}/w1", widgets), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, list) = send(&app, Method::GET, widgets, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["items"].as_array().unwrap().len(), 1);
        let (status, _) = send(&app, Method::DELETE, &format!("{}/w1", widgets), None).await;
        assert_eq!(status, StatusCode::OK);

        let still = get_registration(&app, "widgets.example.com").await.unwrap();
        assert!(still.is_terminating());

        // Spec is frozen while terminating.
        let mut respec = serde_json::to_value(&still).unwrap();
        respec["spec"]["shortNames"] = json!(["wd"]);
        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("{}/widgets.example.com", REGISTRATIONS),
            Some(respec),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_deleted_registration_is_drained_and_removed() {
        let (state, instances) = create_test_app_state_with(test_config()).await;
        let app = crate::api::api_router(state);

        send(&app, Method::POST, REGISTRATIONS, Some(registration_body("gears", "Gear", true))).await;
        wait_accepted(&app, "gears.example.com").await;
        let gears = "/apis/example.com/v1/gears";
        let mut created = 0;
        for attempt in 0..300 {
            let name = format!("g{}", attempt);
            let (status, _) = send(&app, Method::POST, gears, Some(json!({"metadata": {"name": name}}))).await;
            if status == StatusCode::CREATED {
                created += 1;
                if created == 3 {
                    break;
                }
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        assert_eq!(created, 3);
        assert_eq!(instances.len(), 3);

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("{}/gears.example.com", REGISTRATIONS),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        wait_until(&app, "gears.example.com", "removed", |r| r.is_none()).await;
        assert!(instances.is_empty());

        let mut unrouted = false;
        for _ in 0..300 {
            if send(&app, Method::GET, gears, None).await.0 == StatusCode::NOT_FOUND {
                unrouted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(unrouted, "gears stayed routed after removal");

        // The names are free again.
        send(&app, Method::POST, REGISTRATIONS, Some(registration_body("gears", "Gear", true))).await;
        wait_accepted(&app, "gears.example.com").await;
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_found() {
        let app = create_test_api_router().await;
        let (status, body) = send(&app, Method::GET, "/apis/example.com/v1/namespaces/ns1/things", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "Status");
        assert_eq!(body["code"], 404);
    }
}
