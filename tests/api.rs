mod common;

use std::sync::atomic::Ordering;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{TestApp, ADMIN_KEY};
use serde_json::json;

#[tokio::test]
async fn health_reports_ok_when_dependencies_are_up() {
    let app = TestApp::spawn().await;
    let (status, body) = app.call("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn requests_without_a_session_are_rejected() {
    let app = TestApp::spawn().await;
    let (status, _) = app.call("GET", "/api/profile", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call("GET", "/api/profile", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn first_session_creates_profile_with_welcome_credits() {
    let app = TestApp::spawn().await;
    let token = app.token("user_new", "new@example.com");

    let (status, body) = app.call("GET", "/api/profile", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["email"], "new@example.com");
    assert_eq!(body["profile"]["plan"], "free");
    assert_eq!(body["profile"]["credits"], 50);
    assert!(body["profile"]["preferences"]["backendAccountId"]
        .as_str()
        .is_some_and(|id| id.starts_with("acct_")));

    // A second session must not grant the welcome credits again.
    let (_, body) = app
        .call("GET", "/api/credits/transactions", Some(&token), None)
        .await;
    assert_eq!(body["balance"], 50);
    let transactions = body["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["reference"], "welcome:user_new");
}

#[tokio::test]
async fn preferences_merge_but_protected_keys_are_rejected() {
    let app = TestApp::spawn().await;
    let token = app.token("user_prefs", "prefs@example.com");

    let (status, _) = app
        .call(
            "PATCH",
            "/api/profile/preferences",
            Some(&token),
            Some(json!({ "backendAccountId": "acct_hijack" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .call(
            "PATCH",
            "/api/profile/preferences",
            Some(&token),
            Some(json!({ "theme": "dark" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["preferences"]["theme"], "dark");
    assert!(body["preferences"]["backendAccountId"].is_string());

    let (status, _) = app
        .call(
            "PATCH",
            "/api/profile/preferences",
            Some(&token),
            Some(json!(["not", "an", "object"])),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_keys_are_issued_listed_and_revoked() {
    let app = TestApp::spawn().await;
    let token = app.token("user_keys", "keys@example.com");

    let (status, body) = app
        .call("POST", "/api/keys", Some(&token), Some(json!({ "name": "ci" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let raw_key = body["apiKey"].as_str().unwrap().to_string();
    let key_id = body["key"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["key"]["name"], "ci");
    assert!(body["key"].get("keyHash").is_none());

    let (_, body) = app.call("GET", "/api/keys", Some(&token), None).await;
    assert_eq!(body["keys"].as_array().unwrap().len(), 1);

    let (status, _) = app
        .call("DELETE", &format!("/api/keys/{key_id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app.call("GET", "/api/keys", Some(&token), None).await;
    assert!(body["keys"].as_array().unwrap().is_empty());
    assert_eq!(app.upstream.revoked_keys.lock().len(), 1);

    let (status, _) = app
        .call_with_api_key("/api/v1/status/task_1", &raw_key)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call("DELETE", &format!("/api/keys/{key_id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn imagine_spends_credits_and_records_the_task() {
    let app = TestApp::spawn().await;
    let token = app.token("user_gen", "gen@example.com");

    let (status, body) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&token),
            Some(json!({ "prompt": "a lighthouse at dusk", "aspectRatio": "16:9" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["cost"], 8);
    assert_eq!(body["balance"], 42);
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let (status, body) = app
        .call("GET", &format!("/api/tasks/{task_id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["kind"], "imagine");
    assert_eq!(body["job"]["status"], "pending");

    let (status, body) = app
        .call(
            "POST",
            "/api/generate/upscale",
            Some(&token),
            Some(json!({ "jobId": task_id, "index": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["balance"], 40);
}

#[tokio::test]
async fn imagine_rejects_empty_prompts() {
    let app = TestApp::spawn().await;
    let token = app.token("user_empty", "empty@example.com");
    let (status, _) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&token),
            Some(json!({ "prompt": "   " })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.balance("user_empty"), 50);
}

#[tokio::test]
async fn insufficient_credits_return_402_without_touching_the_balance() {
    let app = TestApp::spawn_with(|config| config.welcome_credits = 5).await;
    let token = app.token("user_poor", "poor@example.com");

    let (status, body) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&token),
            Some(json!({ "prompt": "a castle" })),
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["balance"], 5);
    assert_eq!(body["required"], 8);
    assert_eq!(app.balance("user_poor"), 5);
}

#[tokio::test]
async fn failed_submission_is_refunded() {
    let app = TestApp::spawn().await;
    let token = app.token("user_refund", "refund@example.com");
    app.upstream.fail_submissions.store(true, Ordering::SeqCst);

    let (status, _) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&token),
            Some(json!({ "prompt": "a storm" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(app.balance("user_refund"), 50);

    let kinds: Vec<_> = app
        .state
        .store
        .ledger
        .history("user_refund", 10)
        .unwrap()
        .into_iter()
        .map(|tx| tx.kind.as_str())
        .collect();
    assert_eq!(kinds.iter().filter(|kind| **kind == "spend").count(), 1);
    assert_eq!(kinds.iter().filter(|kind| **kind == "refund").count(), 1);
}

#[tokio::test]
async fn task_that_cannot_be_recorded_is_refunded() {
    let app = TestApp::spawn().await;
    let token = app.token("user_untracked", "untracked@example.com");
    app.state
        .store
        .pool
        .get()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER tasks_down BEFORE INSERT ON generation_tasks
             BEGIN SELECT RAISE(ABORT, 'task table unavailable'); END;",
        )
        .unwrap();

    let (status, _) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&token),
            Some(json!({ "prompt": "a quiet harbour" })),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(app.balance("user_untracked"), 50);
    let refund = app
        .state
        .store
        .ledger
        .history("user_untracked", 10)
        .unwrap()
        .into_iter()
        .find(|tx| tx.kind.as_str() == "refund");
    assert_eq!(refund.map(|tx| tx.amount), Some(8));
}

#[tokio::test]
async fn upscale_requires_a_task_the_caller_owns() {
    let app = TestApp::spawn().await;
    let owner = app.token("user_owner", "owner@example.com");
    let other = app.token("user_other", "other@example.com");

    let (_, body) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&owner),
            Some(json!({ "prompt": "a forest" })),
        )
        .await;
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let (status, _) = app
        .call(
            "POST",
            "/api/generate/upscale",
            Some(&other),
            Some(json!({ "jobId": task_id, "index": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .call(
            "POST",
            "/api/generate/upscale",
            Some(&owner),
            Some(json!({ "jobId": task_id, "index": 9 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.balance("user_other"), 50);
}

async fn issue_key(app: &TestApp, token: &str) -> String {
    let (status, body) = app.call("POST", "/api/keys", Some(token), None).await;
    assert_eq!(status, StatusCode::CREATED);
    body["apiKey"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn public_status_is_limited_to_the_key_owner() {
    let app = TestApp::spawn().await;
    let owner = app.token("user_a", "a@example.com");
    let stranger = app.token("user_b", "b@example.com");

    let (_, body) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&owner),
            Some(json!({ "prompt": "a river" })),
        )
        .await;
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let owner_key = issue_key(&app, &owner).await;
    let stranger_key = issue_key(&app, &stranger).await;

    let uri = format!("/api/v1/status/{task_id}");
    let (status, _) = app.call_with_api_key(&uri, &stranger_key).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app.call_with_api_key(&uri, &owner_key).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["taskId"], task_id.as_str());
    assert_eq!(body["status"], "pending");

    let (status, _) = app
        .call_with_api_key("/api/v1/status/..%2Fadmin", &owner_key)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.call("GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn failed_job_is_refunded_exactly_once() {
    let app = TestApp::spawn().await;
    let token = app.token("user_fail", "fail@example.com");

    let (_, body) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&token),
            Some(json!({ "prompt": "a glacier" })),
        )
        .await;
    let task_id = body["taskId"].as_str().unwrap().to_string();
    assert_eq!(app.balance("user_fail"), 42);

    let api_key = issue_key(&app, &token).await;
    app.upstream.set_job_status(&task_id, "failed");

    let uri = format!("/api/v1/status/{task_id}");
    for _ in 0..2 {
        let (status, body) = app.call_with_api_key(&uri, &api_key).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
    }
    let (status, _) = app
        .call("GET", &format!("/api/tasks/{task_id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(app.balance("user_fail"), 50);
    let task = app
        .state
        .store
        .tasks
        .find_for_user(&task_id, "user_fail")
        .unwrap()
        .unwrap();
    assert!(task.refunded);
    assert_eq!(task.status, "failed");
}

#[tokio::test]
async fn status_stream_emits_status_and_done_events() {
    let app = TestApp::spawn().await;
    let token = app.token("user_sse", "sse@example.com");

    let (_, body) = app
        .call(
            "POST",
            "/api/generate/imagine",
            Some(&token),
            Some(json!({ "prompt": "a harbor" })),
        )
        .await;
    let task_id = body["taskId"].as_str().unwrap().to_string();
    let api_key = issue_key(&app, &token).await;
    app.upstream.set_job_status(&task_id, "completed");

    let request = Request::builder()
        .uri(format!("/api/v1/status/{task_id}/stream"))
        .header("x-api-key", api_key)
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("event: status"));
    assert!(text.contains("\"completed\""));
    assert!(text.contains("event: done"));
}

#[tokio::test]
async fn redeem_codes_are_created_by_operators_and_used_once() {
    let app = TestApp::spawn().await;
    let token = app.token("user_redeem", "redeem@example.com");

    let create = |key: &str| {
        Request::builder()
            .method("POST")
            .uri("/api/admin/redeem-codes")
            .header("x-admin-key", key)
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "code": "launch-100", "credits": 100, "maxUses": 5 }).to_string(),
            ))
            .unwrap()
    };
    assert_eq!(app.send(create("wrong")).await.0, StatusCode::UNAUTHORIZED);
    let (status, body) = app.send(create(ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["code"], "LAUNCH-100");

    let (status, body) = app
        .call(
            "POST",
            "/api/credits/redeem",
            Some(&token),
            Some(json!({ "code": "launch-100" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "redeemed");
    assert_eq!(app.balance("user_redeem"), 150);

    let (status, _) = app
        .call(
            "POST",
            "/api/credits/redeem",
            Some(&token),
            Some(json!({ "code": "LAUNCH-100" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(app.balance("user_redeem"), 150);

    let (status, _) = app
        .call(
            "POST",
            "/api/credits/redeem",
            Some(&token),
            Some(json!({ "code": "NOPE" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn checkout_creates_and_reuses_the_stripe_customer() {
    let app = TestApp::spawn().await;
    let token = app.token("user_buy", "buy@example.com");

    let (status, body) = app
        .call(
            "POST",
            "/api/billing/checkout",
            Some(&token),
            Some(json!({ "plan": "pro", "interval": "year" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "https://checkout.stripe.test/cs_test_1");

    let customer = app
        .state
        .store
        .customers
        .customer_for_user("stripe", "user_buy")
        .unwrap()
        .unwrap();

    let (status, _) = app
        .call(
            "POST",
            "/api/billing/checkout",
            Some(&token),
            Some(json!({ "pack": "small" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let forms = app.upstream.checkout_forms.lock().clone();
    assert_eq!(forms.len(), 2);
    assert!(forms[0].contains("price_pro_yearly"));
    assert!(forms[1].contains("price_credits_small"));
    assert!(forms.iter().all(|form| form.contains(&customer)));

    let (status, body) = app
        .call("POST", "/api/billing/portal", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].is_string());
}

#[tokio::test]
async fn portal_requires_an_existing_customer() {
    let app = TestApp::spawn().await;
    let token = app.token("user_noportal", "noportal@example.com");
    let (status, _) = app
        .call("POST", "/api/billing/portal", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
