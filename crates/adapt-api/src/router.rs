//! Route configuration

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::error::uniform_layer_errors;
use crate::handlers::{self, auth, resources, users};
use crate::middleware::{admission_middleware, public_admission_middleware, CapabilityGuard};
use crate::models::{KnowledgeEntry, Project, Resource, Task};
use crate::state::AppState;
use adapt_admission::capability::{USERS_READ_ALL, USERS_READ_SELF, USERS_WRITE_SELF};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Guarded CRUD routes for one resource kind.
fn resource_routes<R: Resource>(state: &AppState) -> Router<AppState> {
    let base = format!("/api/{}", R::KIND.as_str());
    let item = format!("{}/:id", base);

    Router::new()
        .route(&base, get(resources::list::<R>).post(resources::create::<R>))
        .route(
            &item,
            get(resources::fetch::<R>)
                .put(resources::update::<R>)
                .delete(resources::remove::<R>),
        )
        .route_layer(middleware::from_fn_with_state(
            CapabilityGuard::new(state.clone(), R::READ, R::WRITE),
            admission_middleware,
        ))
}

/// Body limit and timeout, answering in the uniform error shape.
fn with_request_limits(router: Router<AppState>) -> Router<AppState> {
    router
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::map_response(uniform_layer_errors))
}

/// Create the application router.
///
/// ## Routes
/// - GET /health, /health/ready, /health/live - probes, never throttled
/// - GET /version, /metrics - throttled by subject or origin
/// - POST /api/users/register, /api/users/login - issue a credential,
///   throttled by origin
/// - GET|PUT /api/users/me - own profile
/// - GET /api/users - all profiles (admin)
/// - GET|POST /api/{tasks,projects,knowledge}
/// - GET|PUT|DELETE /api/{tasks,projects,knowledge}/:id
///
/// Every other `/api` route passes the admission middleware before its
/// handler.
pub fn create_router(state: AppState) -> Router {
    let probes = Router::new()
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::ready))
        .route("/health/live", get(handlers::live));

    let public = Router::new()
        .route("/version", get(handlers::version))
        .route("/metrics", get(handlers::metrics))
        .route("/api/users/register", post(auth::register))
        .route("/api/users/login", post(auth::login))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            public_admission_middleware,
        ));

    let own_profile = Router::new()
        .route("/api/users/me", get(users::me).put(users::update_me))
        .route_layer(middleware::from_fn_with_state(
            CapabilityGuard::new(state.clone(), USERS_READ_SELF, USERS_WRITE_SELF),
            admission_middleware,
        ));

    let all_profiles = Router::new()
        .route("/api/users", get(users::list_users))
        .route_layer(middleware::from_fn_with_state(
            CapabilityGuard::single(state.clone(), USERS_READ_ALL),
            admission_middleware,
        ));

    let routes = Router::new()
        .merge(probes)
        .merge(public)
        .merge(own_profile)
        .merge(all_profiles)
        .merge(resource_routes::<Task>(&state))
        .merge(resource_routes::<Project>(&state))
        .merge(resource_routes::<KnowledgeEntry>(&state));

    with_request_limits(routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapt_admission::store::MemoryStore;
    use adapt_admission::{AdmissionPipeline, ManualClock, Role, ThrottlePolicy};
    use crate::repository::MemoryRepository;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, Response, StatusCode};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt; // For `oneshot`

    const SECRET: &str = "router-test-secret";

    struct TestApp {
        app: Router,
        state: AppState,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn test_app(limit: u64) -> TestApp {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let pipeline = AdmissionPipeline::builder()
            .with_secret(SECRET)
            .with_clock(clock.clone())
            .with_store(store.clone())
            .with_throttle_policy(ThrottlePolicy {
                limit,
                window: Duration::from_secs(60),
                ..ThrottlePolicy::default()
            })
            .build()
            .unwrap();
        let state = AppState::new(pipeline, Arc::new(MemoryRepository::new()));
        TestApp {
            app: create_router(state.clone()),
            state,
            store,
            clock,
        }
    }

    impl TestApp {
        fn token(&self, subject: &str, role: Role, verified: bool) -> String {
            self.state
                .pipeline
                .issuer()
                .issue(subject, role, verified)
                .unwrap()
        }

        async fn send(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> Response<Body> {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let body = match body {
                Some(json) => {
                    builder = builder.header(header::CONTENT_TYPE, "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            self.app
                .clone()
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap()
        }
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let t = test_app(10);
        let response = t.send("GET", "/health", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_ready_route_tracks_store() {
        let t = test_app(10);
        let response = t.send("GET", "/health/ready", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        t.store.set_available(false);
        let response = t.send("GET", "/health/ready", None, None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_probes_are_not_throttled() {
        let t = test_app(1);
        for _ in 0..3 {
            let response = t.send("GET", "/health/live", None, None).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_version_is_throttled() {
        let t = test_app(1);
        let response = t.send("GET", "/version", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["ratelimit-remaining"], "0");

        let response = t.send("GET", "/version", None, None).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let t = test_app(10);
        let response = t.send("GET", "/metrics", None, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_not_found() {
        let t = test_app(10);
        let response = t.send("GET", "/notfound", None, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let t = test_app(10);
        let response = t.send("GET", "/api/tasks", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "CREDENTIAL_MISSING");
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_tampered_and_expired_credentials() {
        let t = test_app(10);
        let token = t.token("u1", Role::User, true);

        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        let response = t.send("GET", "/api/tasks", Some(&tampered), None).await;
        assert_eq!(json_body(response).await["error"]["code"], "INVALID_SIGNATURE");

        t.clock.advance(Duration::from_secs(3600));
        let response = t.send("GET", "/api/tasks", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "CREDENTIAL_EXPIRED");
    }

    #[tokio::test]
    async fn test_user_cannot_list_all_users() {
        let t = test_app(10);
        let user = t.token("u1", Role::User, true);
        let response = t.send("GET", "/api/users", Some(&user), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = t.token("a1", Role::Admin, true);
        let response = t.send("GET", "/api/users", Some(&admin), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unverified_user_cannot_write() {
        let t = test_app(10);
        let token = t.token("u1", Role::User, false);

        let response = t.send("GET", "/api/tasks", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = t
            .send("POST", "/api/tasks", Some(&token), Some(json!({"title": "a"})))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let t = test_app(2);
        let token = t.token("u1", Role::User, true);

        for remaining in ["1", "0"] {
            let response = t.send("GET", "/api/tasks", Some(&token), None).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["ratelimit-limit"], "2");
            assert_eq!(response.headers()["ratelimit-remaining"], remaining);
        }

        let response = t.send("GET", "/api/tasks", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        assert_eq!(json_body(response).await["error"]["code"], "RATE_LIMIT_EXCEEDED");

        // another subject has its own window
        let other = t.token("u2", Role::User, true);
        let response = t.send("GET", "/api/tasks", Some(&other), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        t.clock.advance(Duration::from_secs(60));
        let response = t.send("GET", "/api/tasks", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let t = test_app(10);
        let token = t.token("u1", Role::User, true);
        t.store.set_available(false);

        let response = t.send("GET", "/api/tasks", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"]["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_write_then_read_sees_write() {
        let t = test_app(100);
        let token = t.token("u1", Role::User, true);

        let response = t.send("GET", "/api/tasks", Some(&token), None).await;
        assert_eq!(response.headers()["x-cache"], "MISS");
        let response = t.send("GET", "/api/tasks", Some(&token), None).await;
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(json_body(response).await, json!([]));

        let response = t
            .send(
                "POST",
                "/api/tasks",
                Some(&token),
                Some(json!({"title": "Write report", "status": "in_progress"})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["owner_id"], "u1");
        assert_eq!(created["status"], "in_progress");

        let response = t.send("GET", "/api/tasks", Some(&token), None).await;
        assert_eq!(response.headers()["x-cache"], "MISS");
        let tasks = json_body(response).await;
        assert_eq!(tasks.as_array().unwrap().len(), 1);
        assert_eq!(tasks[0]["title"], "Write report");
    }

    #[tokio::test]
    async fn test_update_invalidates_item() {
        let t = test_app(100);
        let token = t.token("u1", Role::User, true);

        let created = json_body(
            t.send("POST", "/api/projects", Some(&token), Some(json!({"name": "alpha"})))
                .await,
        )
        .await;
        let uri = format!("/api/projects/{}", created["id"]);

        let response = t.send("GET", &uri, Some(&token), None).await;
        assert_eq!(json_body(response).await["name"], "alpha");

        let response = t
            .send("PUT", &uri, Some(&token), Some(json!({"name": "beta"})))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = t.send("GET", &uri, Some(&token), None).await;
        assert_eq!(response.headers()["x-cache"], "MISS");
        assert_eq!(json_body(response).await["name"], "beta");

        let response = t.send("DELETE", &uri, Some(&token), None).await;
        assert_eq!(json_body(response).await["message"], "Project removed");
        let response = t.send("GET", &uri, Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resources_are_owner_scoped() {
        let t = test_app(100);
        let owner = t.token("u1", Role::User, true);
        let other = t.token("u2", Role::User, true);

        let created = json_body(
            t.send(
                "POST",
                "/api/knowledge",
                Some(&owner),
                Some(json!({"title": "Runbook", "content": "restart it"})),
            )
            .await,
        )
        .await;
        let uri = format!("/api/knowledge/{}", created["id"]);

        let response = t.send("GET", &uri, Some(&other), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = t.send("DELETE", &uri, Some(&other), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let t = test_app(100);
        let token = t.token("u1", Role::User, true);

        let response = t
            .send("POST", "/api/tasks", Some(&token), Some(json!({"title": ""})))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["message"], "Title is required");

        let response = t.send("GET", "/api/tasks/abc", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["message"], "Invalid task ID");
    }

    #[tokio::test]
    async fn test_duplicate_project_conflicts() {
        let t = test_app(100);
        let token = t.token("u1", Role::User, true);
        let body = json!({"name": "alpha"});

        t.send("POST", "/api/projects", Some(&token), Some(body.clone()))
            .await;
        let response = t
            .send("POST", "/api/projects", Some(&token), Some(body))
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_profile_update_visible_to_admin_listing() {
        let t = test_app(100);
        let user = t.token("u1", Role::User, true);
        let admin = t.token("a1", Role::Admin, true);

        let me = json_body(t.send("GET", "/api/users/me", Some(&user), None).await).await;
        assert_eq!(me["id"], "u1");
        assert_eq!(me["role"], "user");

        let listing = json_body(t.send("GET", "/api/users", Some(&admin), None).await).await;
        assert_eq!(listing, json!([]));

        let response = t
            .send(
                "PUT",
                "/api/users/me",
                Some(&user),
                Some(json!({"username": "ada", "bio": "engineer"})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = t.send("GET", "/api/users/me", Some(&user), None).await;
        assert_eq!(response.headers()["x-cache"], "MISS");
        assert_eq!(json_body(response).await["username"], "ada");

        let listing = json_body(t.send("GET", "/api/users", Some(&admin), None).await).await;
        assert_eq!(listing[0]["username"], "ada");
    }

    #[tokio::test]
    async fn test_update_of_foreign_project_is_not_found() {
        let t = test_app(100);
        let owner = t.token("u1", Role::User, true);
        let other = t.token("u2", Role::User, true);

        t.send("POST", "/api/projects", Some(&other), Some(json!({"name": "alpha"})))
            .await;
        let theirs = json_body(
            t.send("POST", "/api/projects", Some(&owner), Some(json!({"name": "beta"})))
                .await,
        )
        .await;

        // u2 already has "alpha", but u1's project is invisible to u2
        let uri = format!("/api/projects/{}", theirs["id"]);
        let response = t
            .send("PUT", &uri, Some(&other), Some(json!({"name": "alpha"})))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = t
            .send("PUT", "/api/projects/999", Some(&other), Some(json!({"name": "alpha"})))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn credentials(username: &str, password: &str) -> Option<Value> {
        Some(json!({"username": username, "password": password}))
    }

    #[tokio::test]
    async fn test_register_then_use_token() {
        let t = test_app(100);
        let admin = t.token("a1", Role::Admin, true);
        let listing = json_body(t.send("GET", "/api/users", Some(&admin), None).await).await;
        assert_eq!(listing, json!([]));

        let response = t
            .send("POST", "/api/users/register", None, credentials("ada", "correct horse"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let registered = json_body(response).await;
        let token = registered["token"].as_str().unwrap().to_string();

        let response = t.send("GET", "/api/users/me", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let me = json_body(response).await;
        assert_eq!(me["username"], "ada");
        assert_eq!(me["role"], "user");

        let response = t
            .send("POST", "/api/tasks", Some(&token), Some(json!({"title": "first"})))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let listing = json_body(t.send("GET", "/api/users", Some(&admin), None).await).await;
        assert_eq!(listing[0]["username"], "ada");

        let response = t
            .send("POST", "/api/users/login", None, credentials("ada", "correct horse"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let token = json_body(response).await["token"].as_str().unwrap().to_string();
        let response = t.send("GET", "/api/users/me", Some(&token), None).await;
        assert_eq!(json_body(response).await["id"], me["id"]);
    }

    #[tokio::test]
    async fn test_duplicate_register_conflicts() {
        let t = test_app(100);
        t.send("POST", "/api/users/register", None, credentials("ada", "correct horse"))
            .await;

        let response = t
            .send("POST", "/api/users/register", None, credentials("ADA", "another one"))
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "CONFLICT");
        assert_eq!(body["error"]["message"], "User already exists");
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let t = test_app(100);
        t.send("POST", "/api/users/register", None, credentials("ada", "correct horse"))
            .await;

        for (username, password) in [("ada", "wrong horse"), ("grace", "correct horse")] {
            let response = t
                .send("POST", "/api/users/login", None, credentials(username, password))
                .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            assert_eq!(body["error"]["message"], "Invalid Credentials");
            assert!(body.get("token").is_none());
        }
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let t = test_app(100);
        let response = t
            .send("POST", "/api/users/register", None, credentials("ada", "short"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"]["message"],
            "Password must be 8-128 characters"
        );
    }

    #[tokio::test]
    async fn test_account_routes_are_throttled() {
        let t = test_app(1);
        let response = t
            .send("POST", "/api/users/login", None, credentials("ada", "correct horse"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = t
            .send("POST", "/api/users/register", None, credentials("ada", "correct horse"))
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_public_outcomes_are_counted() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let t = test_app(1);
                t.send("GET", "/version", None, None).await;
                t.send("GET", "/version", None, None).await;
            })
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"admission_outcomes_total{code="ADMITTED"} 1"#));
        assert!(rendered.contains(r#"admission_outcomes_total{code="RATE_LIMIT_EXCEEDED"} 1"#));
    }

    #[tokio::test]
    async fn test_oversized_body_gets_uniform_error() {
        let t = test_app(100);
        let token = t.token("u1", Role::User, true);
        let body = "x".repeat(MAX_BODY_BYTES + 1);
        let request = Request::builder()
            .method("POST")
            .uri("/api/tasks")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();

        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "PAYLOAD_TOO_LARGE");
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_gets_uniform_error() {
        let t = test_app(100);
        let slow = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(REQUEST_TIMEOUT * 2).await;
                    "late"
                }),
            );
        let app = with_request_limits(slow).with_state(t.state.clone());

        let response = app
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(json_body(response).await["error"]["code"], "REQUEST_TIMEOUT");
    }

    #[tokio::test]
    async fn test_legacy_token_header() {
        let t = test_app(10);
        let token = t.token("u1", Role::User, true);
        let response = t
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/tasks")
                    .header("x-auth-token", token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
