//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::config::WebhookSecrets;
use api::signature::{
    DOCUSIGN_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER, ZOHO_SIGNATURE_HEADER,
    docusign_signature_header, stripe_signature_header, zoho_signature_header,
};
use api::{AppState, Config};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use common::ContactId;
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::SecretString;
use serde_json::{Value, json};
use session_store::{InMemorySessionStore, NewSignupLink, SessionStore, SignupLinkStore};
use tower::ServiceExt;

const STRIPE_SECRET: &str = "whsec_stripe_test";
const DOCUSIGN_SECRET: &str = "docusign_connect_test";
const ZOHO_SECRET: &str = "zoho_billing_test";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn secret(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

fn test_config() -> Config {
    Config {
        public_base_url: "https://portal.example.com".to_string(),
        webhook_secrets: WebhookSecrets {
            stripe: Some(secret(STRIPE_SECRET)),
            docusign: Some(secret(DOCUSIGN_SECRET)),
            zoho_billing: Some(secret(ZOHO_SECRET)),
        },
        ..Config::default()
    }
}

fn setup() -> (axum::Router, Arc<AppState<InMemorySessionStore>>) {
    let state = api::create_default_state(InMemorySessionStore::new(), &test_config());
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

fn json_request(method: &str, uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::empty()).unwrap()
}

fn signed_stripe(body: &[u8]) -> Request<Body> {
    let header = stripe_signature_header(&secret(STRIPE_SECRET), Utc::now().timestamp(), body);
    Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header(STRIPE_SIGNATURE_HEADER, header)
        .body(Body::from(body.to_vec()))
        .unwrap()
}

fn signed_docusign(body: &[u8]) -> Request<Body> {
    let header = docusign_signature_header(&secret(DOCUSIGN_SECRET), body);
    Request::builder()
        .method("POST")
        .uri("/webhooks/docusign")
        .header(DOCUSIGN_SIGNATURE_HEADER, header)
        .body(Body::from(body.to_vec()))
        .unwrap()
}

fn signed_zoho(body: &[u8]) -> Request<Body> {
    let header = zoho_signature_header(&secret(ZOHO_SECRET), body);
    Request::builder()
        .method("POST")
        .uri("/webhooks/zoho-billing")
        .header(ZOHO_SIGNATURE_HEADER, header)
        .body(Body::from(body.to_vec()))
        .unwrap()
}

fn stripe_paid(event_id: &str, intent: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "created": 1_700_000_000,
        "data": {"object": {
            "id": intent,
            "amount_received": 49900,
            "payment_method_details": {"card": {"last4": "4242"}}
        }}
    }))
    .unwrap()
}

fn envelope_event(event: &str, envelope_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event": event,
        "generatedDateTime": "2026-10-16T10:00:00Z",
        "data": {"envelopeId": envelope_id}
    }))
    .unwrap()
}

/// Registers a user and walks a session up to a sent envelope.
/// Returns (user id, session id, envelope id).
async fn onboard(app: &axum::Router, payment_reference: &str) -> (String, String, String) {
    let (status, user) = send(
        app,
        json_request(
            "POST",
            "/users",
            None,
            json!({"email": "ada@example.com", "name": "Ada Lovelace"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let user_id = user["id"].as_str().unwrap().to_string();

    let (status, session) = send(
        app,
        json_request(
            "POST",
            "/sessions",
            Some(&user_id),
            json!({
                "module": "Inventory",
                "amountCents": 49900,
                "paymentReference": payment_reference
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "pending");
    let session_id = session["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        app,
        json_request(
            "PUT",
            &format!("/sessions/{session_id}/company-info"),
            Some(&user_id),
            json!({"companyName": "Acme", "contactName": "Ada Lovelace", "city": "London"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, signing) = send(
        app,
        json_request(
            "POST",
            &format!("/sessions/{session_id}/agreement"),
            Some(&user_id),
            json!({"returnUrl": "https://portal.example.com/done"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let envelope_id = signing["envelopeId"].as_str().unwrap().to_string();
    assert!(signing["url"].as_str().is_some());

    (user_id, session_id, envelope_id)
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let (status, json) = send(&app, get_request("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();

    let response = app
        .oneshot(get_request("/metrics", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_session_routes_require_user_header() {
    let (app, _) = setup();

    let (status, json) = send(&app, get_request("/sessions", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["error"].as_str().unwrap().contains("x-user-id"));

    let (status, _) = send(&app, get_request("/sessions", Some("not-a-uuid"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_email_is_bad_request() {
    let (app, _) = setup();

    let (status, _) = send(
        &app,
        json_request("POST", "/users", None, json!({"email": "nobody"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_full_onboarding_through_webhooks() {
    let (app, state) = setup();
    let (user_id, session_id, envelope_id) = onboard(&app, "pi_api_1").await;

    let (status, ack) = send(&app, signed_stripe(&stripe_paid("evt_api_1", "pi_api_1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["received"], true);
    assert_eq!(ack["outcome"], "applied");

    let completed = envelope_event("envelope-completed", &envelope_id);
    let (status, ack) = send(&app, signed_docusign(&completed)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "applied");

    let (status, ack) = send(&app, signed_docusign(&completed)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "duplicate");

    let (status, details) = send(
        &app,
        get_request(&format!("/sessions/{session_id}"), Some(&user_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["session"]["status"], "completed");
    assert_eq!(details["session"]["card_last4"], "4242");
    assert_eq!(details["agreement"]["status"], "completed");
    assert!(details["salesOrder"]["external_id"].as_str().is_some());

    assert_eq!(state.collaborators.crm.contacts_created(), 1);
    assert_eq!(state.collaborators.crm.sales_order_count(), 1);

    let (status, outcome) = send(
        &app,
        json_request(
            "POST",
            &format!("/sessions/{session_id}/provision"),
            Some(&user_id),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "already_complete");
    assert_eq!(state.collaborators.crm.sales_order_count(), 1);

    let (status, _) = send(
        &app,
        json_request(
            "PUT",
            &format!("/sessions/{session_id}/company-info"),
            Some(&user_id),
            json!({"companyName": "Acme Ltd", "contactName": "Ada Lovelace"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_other_users_sessions_are_hidden() {
    let (app, _) = setup();
    let (_, session_id, _) = onboard(&app, "pi_api_2").await;

    let (_, stranger) = send(
        &app,
        json_request("POST", "/users", None, json!({"email": "bo@example.com"})),
    )
    .await;
    let stranger_id = stranger["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        get_request(&format!("/sessions/{session_id}"), Some(stranger_id)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, list) = send(&app, get_request("/sessions", Some(stranger_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 0);

    let (status, _) = send(
        &app,
        get_request("/sessions/not-a-uuid", Some(stranger_id)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bad_signature_is_rejected() {
    let (app, _) = setup();
    let body = stripe_paid("evt_forged", "pi_forged");

    let forged = stripe_signature_header(&secret("wrong"), Utc::now().timestamp(), &body);
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header(STRIPE_SIGNATURE_HEADER, forged)
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhooks/docusign")
        .body(Body::from(envelope_event("envelope-completed", "env-x")))
        .unwrap();
    let (status, _) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unsigned_provider_without_secret_is_rejected() {
    let config = Config {
        webhook_secrets: WebhookSecrets::default(),
        ..test_config()
    };
    let state = api::create_default_state(InMemorySessionStore::new(), &config);
    let app = api::create_app(state, get_metrics_handle());

    let body = stripe_paid("evt_1", "pi_1");
    let (status, _) = send(&app, signed_stripe(&body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_orphaned_and_malformed_webhooks_are_acknowledged() {
    let (app, _) = setup();

    let (status, ack) = send(
        &app,
        signed_docusign(&envelope_event("envelope-completed", "env-unknown")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "orphaned");

    let (status, ack) = send(&app, signed_zoho(b"{\"event_type\": 7}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "invalid");
}

#[tokio::test]
async fn test_zoho_invoice_paid_confirms_payment() {
    let (app, _) = setup();
    let (user_id, session_id, _) = onboard(&app, "inv-api-7").await;

    let body = serde_json::to_vec(&json!({
        "event_id": "zb-evt-1",
        "event_type": "invoice.paid",
        "data": {"id": "inv-api-7", "amount": 499.00}
    }))
    .unwrap();
    let (status, ack) = send(&app, signed_zoho(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "applied");

    let (_, details) = send(
        &app,
        get_request(&format!("/sessions/{session_id}"), Some(&user_id)),
    )
    .await;
    assert_eq!(details["session"]["status"], "payment_completed");
}

#[tokio::test]
async fn test_refresh_payment_without_webhook() {
    let (app, state) = setup();
    let (user_id, session_id, _) = onboard(&app, "pi_api_3").await;

    state.collaborators.billing.register_payment(
        "pi_api_3",
        common::Money::from_cents(49_900),
        reconciliation::services::PaymentState::Paid,
    );

    let (status, details) = send(
        &app,
        json_request(
            "POST",
            &format!("/sessions/{session_id}/refresh-payment"),
            Some(&user_id),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["session"]["status"], "payment_completed");
}

#[tokio::test]
async fn test_magic_link_issue_and_redeem() {
    let (app, state) = setup();
    let (user_id, _, envelope_id) = onboard(&app, "pi_api_4").await;

    // No CRM contact yet.
    let (status, _) = send(
        &app,
        json_request("POST", "/signup-links", Some(&user_id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&app, signed_stripe(&stripe_paid("evt_api_4", "pi_api_4"))).await;
    send(
        &app,
        signed_docusign(&envelope_event("envelope-completed", &envelope_id)),
    )
    .await;
    assert_eq!(state.collaborators.crm.contacts_created(), 1);

    let (status, issued) = send(
        &app,
        json_request("POST", "/signup-links", Some(&user_id), json!({"maxUses": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let magic_link = issued["magicLink"].as_str().unwrap();
    assert!(magic_link.starts_with("https://portal.example.com/crm-data/"));
    let path = magic_link.trim_start_matches("https://portal.example.com");

    let (status, body) = send(
        &app,
        get_request(&format!("{path}?includeSalesOrders=true"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["salesOrders"].as_array().unwrap().len(), 1);
    assert!(body["data"]["deals"].as_array().unwrap().is_empty());

    let (status, _) = send(&app, get_request(path, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_magic_link_include_flags_other_than_true_are_off() {
    let (app, state) = setup();
    let (user_id, _, envelope_id) = onboard(&app, "pi_api_6").await;
    send(&app, signed_stripe(&stripe_paid("evt_api_6", "pi_api_6"))).await;
    send(
        &app,
        signed_docusign(&envelope_event("envelope-completed", &envelope_id)),
    )
    .await;
    assert_eq!(state.collaborators.crm.sales_order_count(), 1);

    let (_, issued) = send(
        &app,
        json_request("POST", "/signup-links", Some(&user_id), json!({"maxUses": 2})),
    )
    .await;
    let path = issued["magicLink"]
        .as_str()
        .unwrap()
        .trim_start_matches("https://portal.example.com")
        .to_string();

    let (status, body) = send(
        &app,
        get_request(&format!("{path}?includeSalesOrders=1&includeDeals=yes"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["salesOrders"].as_array().unwrap().is_empty());
    assert!(body["data"]["deals"].as_array().unwrap().is_empty());

    let (status, body) = send(
        &app,
        get_request(&format!("{path}?includeSalesOrders=true"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["salesOrders"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_magic_link_expired_and_unknown() {
    let (app, state) = setup();
    let user = state
        .store
        .create_user("cy@example.com", None)
        .await
        .unwrap();
    let contact = ContactId::new("zcrm-contact-expired");
    state
        .store
        .create_signup_link(NewSignupLink {
            contact_id: contact.clone(),
            login_code: "stale-code".to_string(),
            created_by: user.id,
            expires_at: Utc::now() - chrono::Duration::hours(1),
            max_uses: 1,
        })
        .await
        .unwrap();

    let (status, _) = send(
        &app,
        get_request(&format!("/crm-data/{contact}/stale-code"), None),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);

    let (status, _) = send(
        &app,
        get_request(&format!("/crm-data/{contact}/no-such-code"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
