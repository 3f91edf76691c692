mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{token_for, Harness};
use live_poll::config::RateLimits;

async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    // Extractor rejections from axum itself come back as plain text.
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn poll_body(h: &Harness) -> Value {
    json!({
        "title": "Where should we eat?",
        "description": "Friday lunch",
        "expires_at": h.clock_now() + chrono::Duration::hours(1),
        "options": ["Tacos", "Pho"],
    })
}

#[tokio::test]
async fn health_check_needs_no_token() {
    let h = Harness::new().await;
    let (status, body) = send(&h.app(), Method::GET, "/up", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn api_rejects_missing_or_unknown_tokens() {
    let h = Harness::new().await;
    let app = h.app();

    let (status, body) = send(&app, Method::GET, "/api/v1/polls", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = send(&app, Method::GET, "/api/v1/polls", Some("forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_vote_and_read_results_over_http() {
    let h = Harness::new().await;
    h.user("ada").await;
    h.user("grace").await;
    let (ada, grace) = (token_for("ada"), token_for("grace"));
    let app = h.app();

    let (status, poll) = send(&app, Method::POST, "/api/v1/polls", Some(&ada), Some(poll_body(&h))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(poll["owner"]["name"], "ada");
    let poll_id = poll["id"].as_str().unwrap().to_string();
    let tacos = poll["options"][0]["option_id"].as_str().unwrap().to_string();

    let votes_uri = format!("/api/v1/polls/{poll_id}/votes");
    let (status, outcome) = send(&app, Method::POST, &votes_uri, Some(&grace), Some(json!({ "option_id": tacos }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(outcome["poll"]["total_votes"], 1);

    let (status, body) = send(&app, Method::POST, &votes_uri, Some(&grace), Some(json!({ "option_id": tacos }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "duplicate_vote");

    let (status, results) = send(&app, Method::GET, &format!("/api/v1/polls/{poll_id}/results"), Some(&ada), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results["options"][0]["percentage"], 100.0);
    assert_eq!(results["options"][1]["percentage"], 0.0);

    let vote_id = outcome["vote"]["id"].as_str().unwrap();
    let (status, after) = send(&app, Method::DELETE, &format!("/api/v1/votes/{vote_id}"), Some(&grace), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after["total_votes"], 0);
}

#[tokio::test]
async fn invalid_poll_lists_every_problem() {
    let h = Harness::new().await;
    h.user("ada").await;
    let body = json!({
        "title": "Hey",
        "expires_at": h.clock_now() - chrono::Duration::hours(1),
        "options": ["Only one"],
    });

    let (status, body) = send(&h.app(), Method::POST, "/api/v1/polls", Some(&token_for("ada")), Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_error");
    assert_eq!(body["errors"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn owner_only_routes_return_forbidden() {
    let h = Harness::new().await;
    let ada = h.user("ada").await;
    h.user("grace").await;
    let poll = h.poll(ada, &["A", "B"]).await;
    let app = h.app();
    let grace = token_for("grace");

    let uri = format!("/api/v1/polls/{}", poll.id);
    let (status, _) = send(&app, Method::DELETE, &uri, Some(&grace), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, Method::GET, &format!("{uri}/analytics"), Some(&grace), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, Method::DELETE, &uri, Some(&token_for("ada")), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, Method::GET, &uri, Some(&grace), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn listing_and_my_polls() {
    let h = Harness::new().await;
    let ada = h.user("ada").await;
    h.user("grace").await;
    h.poll(ada, &["A", "B"]).await;
    let app = h.app();

    let (status, page) = send(&app, Method::GET, "/api/v1/polls?sort=popular&per_page=5", Some(&token_for("grace")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total_count"], 1);
    assert_eq!(page["per_page"], 5);

    let (_, mine) = send(&app, Method::GET, "/api/v1/polls/my", Some(&token_for("grace")), None).await;
    assert_eq!(mine.as_array().unwrap().len(), 0);
    let (_, mine) = send(&app, Method::GET, "/api/v1/polls/my", Some(&token_for("ada")), None).await;
    assert_eq!(mine.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn poll_creation_is_rate_limited() {
    let h = Harness::new().await;
    h.user("ada").await;
    let app = h.app_with_limits(RateLimits {
        polls_per_minute: 2,
        votes_per_minute: 10,
    });
    let ada = token_for("ada");

    for _ in 0..2 {
        let (status, _) = send(&app, Method::POST, "/api/v1/polls", Some(&ada), Some(poll_body(&h))).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, body) = send(&app, Method::POST, "/api/v1/polls", Some(&ada), Some(poll_body(&h))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["retry_after"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn cable_requires_credentials() {
    let h = Harness::new().await;
    let (status, _) = send(&h.app(), Method::GET, "/cable", None, None).await;
    assert_ne!(status, StatusCode::SWITCHING_PROTOCOLS);
}
