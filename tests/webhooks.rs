mod common;

use std::sync::atomic::Ordering;

use axum::{body::Body, http::{Request, StatusCode}};
use chrono::Utc;
use common::{stripe_event, TestApp};
use imagine_studio_server::plans::Plan;
use serde_json::json;

fn paid_pack_session(session_id: &str, user_id: &str, customer_id: &str, pack: &str) -> serde_json::Value {
    json!({
        "id": session_id,
        "mode": "payment",
        "payment_status": "paid",
        "client_reference_id": user_id,
        "customer": customer_id,
        "metadata": { "userId": user_id, "pack": pack },
    })
}

fn pro_subscription(subscription_id: &str, customer_id: &str, status: &str) -> serde_json::Value {
    json!({
        "id": subscription_id,
        "customer": customer_id,
        "status": status,
        "cancel_at_period_end": false,
        "current_period_end": Utc::now().timestamp() + 30 * 86_400,
        "metadata": {},
        "items": { "data": [{ "price": { "id": "price_pro_monthly" } }] },
    })
}

#[tokio::test]
async fn duplicate_event_is_processed_once() {
    let app = TestApp::spawn().await;
    app.seed_user("user_dup", "dup@example.com");

    let event = stripe_event(
        "evt_checkout_1",
        "checkout.session.completed",
        Utc::now().timestamp(),
        paid_pack_session("cs_1", "user_dup", "cus_dup", "small"),
    );

    let (status, body) = app.stripe_webhook(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));
    assert_eq!(app.balance("user_dup"), 550);

    let (status, body) = app.stripe_webhook(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
    assert_eq!(app.balance("user_dup"), 550);

    let customer = app
        .state
        .store
        .customers
        .user_for_customer("stripe", "cus_dup")
        .unwrap();
    assert_eq!(customer.as_deref(), Some("user_dup"));
}

#[tokio::test]
async fn redelivered_purchase_under_a_new_event_id_grants_once() {
    let app = TestApp::spawn().await;
    app.seed_user("user_async", "async@example.com");
    let session = paid_pack_session("cs_async", "user_async", "cus_async", "large");

    let now = Utc::now().timestamp();
    let completed = stripe_event("evt_a", "checkout.session.completed", now, session.clone());
    let async_paid = stripe_event("evt_b", "checkout.session.async_payment_succeeded", now, session);

    assert_eq!(app.stripe_webhook(&completed).await.0, StatusCode::OK);
    assert_eq!(app.stripe_webhook(&async_paid).await.0, StatusCode::OK);
    assert_eq!(app.balance("user_async"), 50 + 2_500);
}

#[tokio::test]
async fn paid_and_succeeded_invoices_grant_period_credits_once() {
    let app = TestApp::spawn().await;
    app.seed_user("user_pro", "pro@example.com");
    app.state
        .store
        .customers
        .link("stripe", "cus_pro", "user_pro")
        .unwrap();

    let now = Utc::now().timestamp();
    let created = stripe_event(
        "evt_sub_created",
        "customer.subscription.created",
        now,
        pro_subscription("sub_pro", "cus_pro", "active"),
    );
    assert_eq!(app.stripe_webhook(&created).await.0, StatusCode::OK);

    let profile = app.state.store.profiles.get("user_pro").unwrap();
    assert_eq!(profile.plan, Plan::Pro);
    assert_eq!(profile.subscription_status.as_deref(), Some("active"));

    let invoice = json!({
        "id": "in_1",
        "customer": "cus_pro",
        "subscription": "sub_pro",
        "lines": { "data": [{
            "price": { "id": "price_pro_monthly" },
            "period": { "start": now, "end": now + 30 * 86_400 },
        }] },
    });
    let paid = stripe_event("evt_inv_paid", "invoice.paid", now, invoice.clone());
    let succeeded = stripe_event("evt_inv_ok", "invoice.payment_succeeded", now, invoice);

    assert_eq!(app.stripe_webhook(&paid).await.0, StatusCode::OK);
    assert_eq!(app.stripe_webhook(&succeeded).await.0, StatusCode::OK);
    assert_eq!(app.balance("user_pro"), 50 + 2_000);

    let history = app.state.store.ledger.history("user_pro", 10).unwrap();
    let period_grants = history
        .iter()
        .filter(|tx| tx.reference.as_deref() == Some("stripe:invoice:in_1"))
        .count();
    assert_eq!(period_grants, 1);
}

#[tokio::test]
async fn out_of_order_subscription_events_do_not_regress_state() {
    let app = TestApp::spawn().await;
    app.seed_user("user_order", "order@example.com");
    app.state
        .store
        .customers
        .link("stripe", "cus_order", "user_order")
        .unwrap();

    let now = Utc::now().timestamp();
    let newer = stripe_event(
        "evt_newer",
        "customer.subscription.updated",
        now,
        pro_subscription("sub_order", "cus_order", "active"),
    );
    let older = stripe_event(
        "evt_older",
        "customer.subscription.updated",
        now - 120,
        pro_subscription("sub_order", "cus_order", "incomplete_expired"),
    );

    assert_eq!(app.stripe_webhook(&newer).await.0, StatusCode::OK);
    assert_eq!(app.stripe_webhook(&older).await.0, StatusCode::OK);

    let record = app
        .state
        .store
        .subscriptions
        .find("stripe", "sub_order")
        .unwrap()
        .unwrap();
    assert_eq!(record.status, "active");
    assert_eq!(record.last_event_at, now);
    let profile = app.state.store.profiles.get("user_order").unwrap();
    assert_eq!(profile.plan, Plan::Pro);
}

#[tokio::test]
async fn deleted_subscription_downgrades_to_free() {
    let app = TestApp::spawn().await;
    app.seed_user("user_cancel", "cancel@example.com");
    app.state
        .store
        .customers
        .link("stripe", "cus_cancel", "user_cancel")
        .unwrap();

    let now = Utc::now().timestamp();
    let created = stripe_event(
        "evt_c1",
        "customer.subscription.created",
        now - 60,
        pro_subscription("sub_cancel", "cus_cancel", "active"),
    );
    let deleted = stripe_event(
        "evt_c2",
        "customer.subscription.deleted",
        now,
        pro_subscription("sub_cancel", "cus_cancel", "canceled"),
    );
    assert_eq!(app.stripe_webhook(&created).await.0, StatusCode::OK);
    assert_eq!(app.stripe_webhook(&deleted).await.0, StatusCode::OK);

    let profile = app.state.store.profiles.get("user_cancel").unwrap();
    assert_eq!(profile.plan, Plan::Free);
    assert_eq!(profile.subscription_status.as_deref(), Some("canceled"));
}

#[tokio::test]
async fn stripe_payment_failure_marks_past_due_and_keeps_plan() {
    let app = TestApp::spawn().await;
    app.seed_user("user_late", "late@example.com");
    app.state
        .store
        .customers
        .link("stripe", "cus_late", "user_late")
        .unwrap();

    let now = Utc::now().timestamp();
    let created = stripe_event(
        "evt_late_sub",
        "customer.subscription.created",
        now,
        pro_subscription("sub_late", "cus_late", "active"),
    );
    assert_eq!(app.stripe_webhook(&created).await.0, StatusCode::OK);

    let failed = stripe_event(
        "evt_late_inv",
        "invoice.payment_failed",
        now,
        json!({ "id": "in_late", "customer": "cus_late", "subscription": "sub_late" }),
    );
    assert_eq!(app.stripe_webhook(&failed).await.0, StatusCode::OK);

    let profile = app.state.store.profiles.get("user_late").unwrap();
    assert_eq!(profile.plan, Plan::Pro);
    assert_eq!(profile.subscription_status.as_deref(), Some("past_due"));
    assert_eq!(app.balance("user_late"), 50);
}

#[tokio::test]
async fn failed_apply_releases_the_claim_for_the_next_delivery() {
    let app = TestApp::spawn().await;
    app.seed_user("user_retry", "retry@example.com");
    app.upstream
        .fail_customer_lookups
        .store(true, Ordering::SeqCst);

    let event = stripe_event(
        "evt_retry",
        "customer.subscription.updated",
        Utc::now().timestamp(),
        pro_subscription("sub_retry", "cus_retry", "active"),
    );
    let (status, _) = app.stripe_webhook(&event).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        app.state.store.profiles.get("user_retry").unwrap().plan,
        Plan::Free
    );

    app.upstream
        .fail_customer_lookups
        .store(false, Ordering::SeqCst);
    app.upstream
        .customer_owners
        .lock()
        .insert("cus_retry".into(), "user_retry".into());

    let (status, body) = app.stripe_webhook(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));
    assert_eq!(
        app.state.store.profiles.get("user_retry").unwrap().plan,
        Plan::Pro
    );
    let linked = app
        .state
        .store
        .customers
        .user_for_customer("stripe", "cus_retry")
        .unwrap();
    assert_eq!(linked.as_deref(), Some("user_retry"));
}

#[tokio::test]
async fn invoice_ahead_of_its_subscription_fetches_it_from_stripe() {
    let app = TestApp::spawn().await;
    app.seed_user("user_early", "early@example.com");
    app.state
        .store
        .customers
        .link("stripe", "cus_early", "user_early")
        .unwrap();
    app.upstream.stripe_subscriptions.lock().insert(
        "sub_early".into(),
        pro_subscription("sub_early", "cus_early", "active"),
    );

    let now = Utc::now().timestamp();
    let paid = stripe_event(
        "evt_early_inv",
        "invoice.paid",
        now,
        json!({
            "id": "in_early",
            "customer": "cus_early",
            "subscription": "sub_early",
            "lines": { "data": [{ "price": { "id": "price_pro_monthly" } }] },
        }),
    );
    assert_eq!(app.stripe_webhook(&paid).await.0, StatusCode::OK);

    let record = app
        .state
        .store
        .subscriptions
        .find("stripe", "sub_early")
        .unwrap()
        .unwrap();
    assert_eq!(record.user_id, "user_early");
    assert_eq!(record.status, "active");
    assert_eq!(
        app.state.store.profiles.get("user_early").unwrap().plan,
        Plan::Pro
    );
    assert_eq!(app.balance("user_early"), 50 + 2_000);
}

#[tokio::test]
async fn signed_but_undecodable_payload_is_acknowledged() {
    let app = TestApp::spawn().await;
    let event = stripe_event(
        "evt_garbled",
        "customer.subscription.updated",
        Utc::now().timestamp(),
        json!({ "id": "sub_garbled" }),
    );
    let (status, body) = app.stripe_webhook(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ignored"], true);
    assert!(app
        .state
        .store
        .subscriptions
        .find("stripe", "sub_garbled")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn events_for_unknown_customers_are_acknowledged() {
    let app = TestApp::spawn().await;

    let event = stripe_event(
        "evt_orphan",
        "customer.subscription.updated",
        Utc::now().timestamp(),
        pro_subscription("sub_orphan", "cus_nobody", "active"),
    );
    let (status, body) = app.stripe_webhook(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
    assert!(app
        .state
        .store
        .subscriptions
        .find("stripe", "sub_orphan")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unhandled_event_types_are_acknowledged() {
    let app = TestApp::spawn().await;
    let event = stripe_event("evt_other", "charge.refunded", 0, json!({ "id": "ch_1" }));
    let (status, _) = app.stripe_webhook(&event).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn stripe_signatures_are_enforced() {
    let app = TestApp::spawn().await;
    let payload = stripe_event("evt_sig", "charge.refunded", 0, json!({})).to_string();

    let missing = Request::builder()
        .method("POST")
        .uri("/api/webhook/stripe")
        .body(Body::from(payload.clone()))
        .unwrap();
    assert_eq!(app.send(missing).await.0, StatusCode::BAD_REQUEST);

    let signature = common::stripe_signature(payload.as_bytes());
    let tampered = Request::builder()
        .method("POST")
        .uri("/api/stripe/webhooks")
        .header("stripe-signature", signature)
        .body(Body::from(payload.replace("evt_sig", "evt_forged")))
        .unwrap();
    assert_eq!(app.send(tampered).await.0, StatusCode::BAD_REQUEST);

    let stale_ts = Utc::now().timestamp() - 3_600;
    let stale_sig = imagine_studio_server::stripe_api::sign_payload(
        common::STRIPE_WEBHOOK_SECRET,
        stale_ts,
        payload.as_bytes(),
    )
    .unwrap();
    let stale = Request::builder()
        .method("POST")
        .uri("/api/webhooks/stripe")
        .header("stripe-signature", format!("t={stale_ts},v1={stale_sig}"))
        .body(Body::from(payload))
        .unwrap();
    assert_eq!(app.send(stale).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unconfigured_webhook_secret_is_a_server_error() {
    let app = TestApp::spawn_with(|config| config.stripe_webhook_secret = None).await;
    let event = stripe_event("evt_x", "charge.refunded", 0, json!({}));
    let (status, _) = app.stripe_webhook(&event).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn square_pack_payment_grants_credits_and_links_customer() {
    let app = TestApp::spawn().await;
    app.seed_user("user_sq", "sq@example.com");

    let event = json!({
        "event_id": "sq_evt_1",
        "type": "payment.updated",
        "created_at": Utc::now().to_rfc3339(),
        "data": {
            "type": "payment",
            "id": "pay_1",
            "object": { "payment": {
                "id": "pay_1",
                "status": "COMPLETED",
                "customer_id": "SQ_CUST_1",
                "reference_id": "large:user_sq",
            } },
        },
    });

    let (status, _) = app.square_webhook(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.balance("user_sq"), 50 + 2_500);

    let (status, body) = app.square_webhook(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
    assert_eq!(app.balance("user_sq"), 50 + 2_500);

    let linked = app
        .state
        .store
        .customers
        .user_for_customer("square", "SQ_CUST_1")
        .unwrap();
    assert_eq!(linked.as_deref(), Some("user_sq"));
}

#[tokio::test]
async fn square_subscription_invoice_grants_period_credits() {
    let app = TestApp::spawn().await;
    app.seed_user("user_sqpro", "sqpro@example.com");
    app.state
        .store
        .customers
        .link("square", "SQ_CUST_PRO", "user_sqpro")
        .unwrap();

    let subscription = json!({
        "event_id": "sq_evt_sub",
        "type": "subscription.created",
        "created_at": Utc::now().to_rfc3339(),
        "data": { "type": "subscription", "object": { "subscription": {
            "id": "SQ_SUB_1",
            "status": "ACTIVE",
            "customer_id": "SQ_CUST_PRO",
            "plan_variation_id": "SQ_VAR_PRO",
            "charged_through_date": "2099-01-01",
        } } },
    });
    assert_eq!(app.square_webhook(&subscription).await.0, StatusCode::OK);
    assert_eq!(
        app.state.store.profiles.get("user_sqpro").unwrap().plan,
        Plan::Pro
    );

    let invoice = json!({
        "event_id": "sq_evt_inv",
        "type": "invoice.payment_made",
        "created_at": Utc::now().to_rfc3339(),
        "data": { "type": "invoice", "object": { "invoice": {
            "id": "SQ_INV_1",
            "status": "PAID",
            "subscription_id": "SQ_SUB_1",
            "primary_recipient": { "customer_id": "SQ_CUST_PRO" },
        } } },
    });
    assert_eq!(app.square_webhook(&invoice).await.0, StatusCode::OK);
    assert_eq!(app.balance("user_sqpro"), 50 + 2_000);
}

#[tokio::test]
async fn square_failed_charge_marks_past_due_and_keeps_plan() {
    let app = TestApp::spawn().await;
    app.seed_user("user_sqlate", "sqlate@example.com");
    app.state
        .store
        .customers
        .link("square", "SQ_CUST_LATE", "user_sqlate")
        .unwrap();

    let subscription = json!({
        "event_id": "sq_evt_late_sub",
        "type": "subscription.created",
        "created_at": Utc::now().to_rfc3339(),
        "data": { "type": "subscription", "object": { "subscription": {
            "id": "SQ_SUB_LATE",
            "status": "ACTIVE",
            "customer_id": "SQ_CUST_LATE",
            "plan_variation_id": "SQ_VAR_PRO",
        } } },
    });
    assert_eq!(app.square_webhook(&subscription).await.0, StatusCode::OK);

    let failed = json!({
        "event_id": "sq_evt_late_inv",
        "type": "invoice.scheduled_charge_failed",
        "created_at": Utc::now().to_rfc3339(),
        "data": { "type": "invoice", "object": { "invoice": {
            "id": "SQ_INV_LATE",
            "status": "UNPAID",
            "subscription_id": "SQ_SUB_LATE",
            "primary_recipient": { "customer_id": "SQ_CUST_LATE" },
        } } },
    });
    assert_eq!(app.square_webhook(&failed).await.0, StatusCode::OK);

    let profile = app.state.store.profiles.get("user_sqlate").unwrap();
    assert_eq!(profile.plan, Plan::Pro);
    assert_eq!(profile.subscription_status.as_deref(), Some("past_due"));
}

#[tokio::test]
async fn square_signature_mismatch_is_rejected() {
    let app = TestApp::spawn().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/square")
        .header(imagine_studio_server::square::SIGNATURE_HEADER, "bm90LWEtc2lnbmF0dXJl")
        .body(Body::from(r#"{"event_id":"x","type":"payment.updated","data":{}}"#))
        .unwrap();
    assert_eq!(app.send(request).await.0, StatusCode::BAD_REQUEST);
}
