#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use imagine_studio_server::{
    accounts,
    auth::{AuthService, SessionClaims},
    build_router,
    config::Config,
    db,
    square,
    state::AppState,
    stripe_api,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

pub const JWT_SECRET: &str = "integration-secret";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_integration";
pub const SQUARE_KEY: &str = "square-signature-key";
pub const SQUARE_URL: &str = "https://studio.example.com/api/webhooks/square";
pub const ADMIN_KEY: &str = "operator-key";

/// Stand-in for the generation backend and the Stripe API.
#[derive(Default)]
pub struct MockUpstream {
    pub fail_submissions: AtomicBool,
    pub fail_customer_lookups: AtomicBool,
    /// Stripe customer id to the `userId` its metadata carries.
    pub customer_owners: Mutex<HashMap<String, String>>,
    pub stripe_subscriptions: Mutex<HashMap<String, Value>>,
    pub job_statuses: Mutex<HashMap<String, String>>,
    pub credit_packs: Mutex<Vec<Value>>,
    pub tier_updates: Mutex<Vec<(String, String)>>,
    pub revoked_keys: Mutex<Vec<String>>,
    pub checkout_forms: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

impl MockUpstream {
    fn next(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_job_status(&self, task_id: &str, status: &str) {
        self.job_statuses
            .lock()
            .insert(task_id.to_string(), status.to_string());
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub upstream: Arc<MockUpstream>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(customize: impl FnOnce(&mut Config)) -> Self {
        let upstream = Arc::new(MockUpstream::default());
        let base_url = spawn_upstream(upstream.clone()).await;

        let mut config = Config {
            port: 0,
            trust_proxy: false,
            tls_key_path: None,
            tls_cert_path: None,
            database_path: ":memory:".into(),
            backend_url: base_url.clone(),
            backend_admin_key: Some("backend-admin".into()),
            auth_jwt_secret: JWT_SECRET.into(),
            admin_api_key: Some(ADMIN_KEY.into()),
            stripe_secret_key: Some("sk_test_integration".into()),
            stripe_webhook_secret: Some(STRIPE_WEBHOOK_SECRET.into()),
            stripe_api_base: format!("{base_url}/stripe"),
            square_webhook_signature_key: Some(SQUARE_KEY.into()),
            square_webhook_url: Some(SQUARE_URL.into()),
            frontend_url: Some("https://studio.example.com".into()),
            stripe_price_id_pro_monthly: Some("price_pro_monthly".into()),
            stripe_price_id_pro_yearly: Some("price_pro_yearly".into()),
            stripe_price_id_credits_small: Some("price_credits_small".into()),
            stripe_price_id_credits_large: Some("price_credits_large".into()),
            square_plan_variation_id_pro: Some("SQ_VAR_PRO".into()),
            welcome_credits: 50,
            pro_monthly_credits: 2_000,
            api_rate_limit_per_window: 1_000,
        };
        customize(&mut config);

        let pool = db::init_memory().expect("in-memory database");
        let state = AppState::from_config(config, db::Store::new(pool)).expect("app state");
        Self {
            router: build_router(state.clone()),
            state,
            upstream,
        }
    }

    pub fn token(&self, user_id: &str, email: &str) -> String {
        let auth = AuthService::new(JWT_SECRET).expect("auth service");
        let exp = (chrono::Utc::now().timestamp() + 3_600) as usize;
        auth.issue_token(&SessionClaims {
            sub: user_id.to_string(),
            email: email.to_string(),
            name: None,
            exp,
            iat: None,
        })
        .expect("token")
    }

    /// Creates the user and profile directly, the way a first session would.
    pub fn seed_user(&self, user_id: &str, email: &str) {
        self.state
            .store
            .users
            .upsert(user_id, email, None)
            .expect("user");
        accounts::ensure_profile(&self.state, user_id).expect("profile");
    }

    pub fn balance(&self, user_id: &str) -> i64 {
        self.state.store.ledger.balance(user_id).expect("balance")
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    pub async fn call(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        self.send(request).await
    }

    pub async fn call_with_api_key(&self, uri: &str, api_key: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(uri)
            .header("x-api-key", api_key)
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    pub async fn stripe_webhook(&self, event: &Value) -> (StatusCode, Value) {
        let payload = event.to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/api/webhooks/stripe")
            .header("stripe-signature", stripe_signature(payload.as_bytes()))
            .header("content-type", "application/json")
            .body(Body::from(payload))
            .expect("request");
        self.send(request).await
    }

    pub async fn square_webhook(&self, event: &Value) -> (StatusCode, Value) {
        let payload = event.to_string();
        let signature =
            square::sign(SQUARE_KEY, SQUARE_URL, payload.as_bytes()).expect("square signature");
        let request = Request::builder()
            .method("POST")
            .uri("/api/webhooks/square")
            .header(square::SIGNATURE_HEADER, signature)
            .header("content-type", "application/json")
            .body(Body::from(payload))
            .expect("request");
        self.send(request).await
    }
}

pub fn stripe_signature(payload: &[u8]) -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let signature =
        stripe_api::sign_payload(STRIPE_WEBHOOK_SECRET, timestamp, payload).expect("signature");
    format!("t={timestamp},v1={signature}")
}

pub fn stripe_event(id: &str, event_type: &str, created: i64, object: Value) -> Value {
    json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": { "object": object },
    })
}

async fn spawn_upstream(upstream: Arc<MockUpstream>) -> String {
    let app = Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/accounts", post(create_account))
        .route("/accounts/{id}", patch(update_account))
        .route("/accounts/{id}/api-keys", post(issue_key))
        .route("/accounts/{id}/api-keys/{key_id}", delete(revoke_key))
        .route("/accounts/{id}/credit-packs", post(create_pack))
        .route("/jobs/diffusion", post(submit_job))
        .route("/jobs/upscale", post(submit_job))
        .route("/jobs/{task_id}", get(job_status))
        .route("/stripe/customers", post(create_customer))
        .route("/stripe/customers/{id}", get(retrieve_customer))
        .route("/stripe/subscriptions/{id}", get(retrieve_subscription))
        .route("/stripe/checkout/sessions", post(create_checkout))
        .route(
            "/stripe/billing_portal/sessions",
            post(|| async { Json(json!({ "url": "https://billing.stripe.test/portal" })) }),
        )
        .with_state(upstream);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock upstream");
    });
    format!("http://{addr}")
}

async fn create_account(
    State(upstream): State<Arc<MockUpstream>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    Json(json!({ "id": format!("acct_{}", upstream.next()), "tier": body["tier"] }))
}

async fn update_account(
    State(upstream): State<Arc<MockUpstream>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let tier = body["tier"].as_str().unwrap_or_default().to_string();
    upstream.tier_updates.lock().push((id.clone(), tier));
    Json(json!({ "id": id }))
}

async fn issue_key(State(upstream): State<Arc<MockUpstream>>) -> Json<Value> {
    let n = upstream.next();
    Json(json!({ "data": { "id": format!("bk_{n}"), "key": format!("msk_live_{n}_{}", uuid::Uuid::new_v4().simple()) } }))
}

async fn revoke_key(
    State(upstream): State<Arc<MockUpstream>>,
    Path((_id, key_id)): Path<(String, String)>,
) -> StatusCode {
    upstream.revoked_keys.lock().push(key_id);
    StatusCode::NO_CONTENT
}

async fn create_pack(
    State(upstream): State<Arc<MockUpstream>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    upstream.credit_packs.lock().push(body);
    Json(json!({ "id": format!("pack_{}", upstream.next()) }))
}

async fn submit_job(State(upstream): State<Arc<MockUpstream>>) -> Response {
    if upstream.fail_submissions.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "queue is full").into_response();
    }
    let task_id = format!("task_{}", upstream.next());
    upstream.set_job_status(&task_id, "pending");
    Json(json!({ "taskId": task_id, "status": "pending" })).into_response()
}

async fn job_status(
    State(upstream): State<Arc<MockUpstream>>,
    Path(task_id): Path<String>,
) -> Response {
    let status = upstream.job_statuses.lock().get(&task_id).cloned();
    match status {
        Some(status) => Json(json!({
            "taskId": task_id,
            "status": status,
            "progress": "40",
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "no such job").into_response(),
    }
}

async fn create_customer(State(upstream): State<Arc<MockUpstream>>) -> Json<Value> {
    Json(json!({ "id": format!("cus_mock_{}", upstream.next()), "metadata": {} }))
}

async fn retrieve_customer(
    State(upstream): State<Arc<MockUpstream>>,
    Path(id): Path<String>,
) -> Response {
    if upstream.fail_customer_lookups.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": { "message": "temporarily unavailable" } })),
        )
            .into_response();
    }
    let metadata = match upstream.customer_owners.lock().get(&id) {
        Some(user_id) => json!({ "userId": user_id }),
        None => json!({}),
    };
    Json(json!({ "id": id, "metadata": metadata })).into_response()
}

async fn retrieve_subscription(
    State(upstream): State<Arc<MockUpstream>>,
    Path(id): Path<String>,
) -> Response {
    match upstream.stripe_subscriptions.lock().get(&id).cloned() {
        Some(subscription) => Json(subscription).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": "No such subscription" } })),
        )
            .into_response(),
    }
}

async fn create_checkout(State(upstream): State<Arc<MockUpstream>>, body: Bytes) -> Json<Value> {
    upstream
        .checkout_forms
        .lock()
        .push(String::from_utf8_lossy(&body).into_owned());
    Json(json!({ "id": "cs_test_1", "url": "https://checkout.stripe.test/cs_test_1" }))
}
