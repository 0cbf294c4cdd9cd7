//! HTTP surface: the ingestion endpoint and the definition API.

mod test_utils;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use stream_ingest::server::create_app;
use tower::ServiceExt;
use test_utils::*;

struct Reply {
    status: StatusCode,
    content_type: String,
    body: String,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or_else(|err| panic!("invalid json {err}: {}", self.body))
    }
}

async fn send(app: &Router, request: Request<Body>) -> Reply {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    Reply {
        status,
        content_type,
        body: String::from_utf8(body.to_vec()).unwrap(),
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_record(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

/// Defines branch 1, source `github` and the `test` sink `out` through the API.
async fn define_pipeline(app: &Router) -> String {
    let branch = send(app, post_json("/v1/projects/123/branches", json!({"branchId": 1, "isDefault": true}))).await;
    assert_eq!(branch.status, StatusCode::CREATED, "{}", branch.body);

    let source = send(
        app,
        post_json(
            "/v1/projects/123/branches/1/sources",
            json!({"sourceId": "github", "name": "GitHub"}),
        ),
    )
    .await;
    assert_eq!(source.status, StatusCode::CREATED, "{}", source.body);
    let source = source.json();
    assert_eq!(source["version"]["description"], "Source created.");
    let secret = source["http"]["secret"].as_str().unwrap().to_string();
    assert_eq!(secret.len(), 48);

    let sink = send(
        app,
        post_json(
            "/v1/projects/123/branches/1/sources/github/sinks",
            json!({"sinkId": "out", "type": "test", "name": "Out"}),
        ),
    )
    .await;
    assert_eq!(sink.status, StatusCode::CREATED, "{}", sink.body);
    secret
}

/// Posts until the mirrors have caught up with the definitions.
async fn post_when_ready(app: &Router, uri: &str) -> Reply {
    for _ in 0..100 {
        let reply = send(app, post_record(uri, "{\"n\":1}")).await;
        let not_ready = reply.status == StatusCode::NOT_FOUND
            || reply.body.contains("No enabled sink found.");
        if !not_ready {
            return reply;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("definitions were not mirrored in time");
}

#[tokio::test]
async fn test_service_routes() {
    let opener = TestOpener::new();
    let state = start_state(memory_kv(), &opener).await;
    let app = create_app(state.clone());

    let health = send(&app, get("/health-check")).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.body, "OK\n");

    let root = send(&app, get("/")).await;
    assert_eq!(root.json()["service"], "stream-ingest");

    let missing = send(&app, get("/nothing/here")).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json()["error"], "stream.in.routeNotFound");

    let openapi = send(&app, get("/openapi.json")).await;
    assert_eq!(openapi.status, StatusCode::OK);
    assert!(openapi.json()["paths"]["/stream/{projectId}/{sourceId}/{secret}"].is_object());

    state.shutdown().await;
}

#[tokio::test]
async fn test_ingest_plain_and_verbose() {
    let opener = TestOpener::new();
    let state = start_state(memory_kv(), &opener).await;
    let app = create_app(state.clone());
    let secret = define_pipeline(&app).await;

    let plain = post_when_ready(&app, &format!("/stream/123/github/{secret}")).await;
    assert_eq!(plain.status, StatusCode::OK, "{}", plain.body);
    assert_eq!(plain.body, "OK");
    assert_eq!(plain.content_type, "text/plain");

    let verbose = send(
        &app,
        post_record(&format!("/stream/123/github/{secret}?verbose=true"), "{\"n\":2}"),
    )
    .await;
    assert_eq!(verbose.status, StatusCode::OK);
    assert_eq!(
        verbose.json(),
        json!({
            "statusCode": 200,
            "message": "Successfully written to 1/1 sinks.",
            "sources": [{
                "projectId": 123,
                "sourceId": "github",
                "branchId": 1,
                "statusCode": 200,
                "message": "Successfully written to 1/1 sinks.",
                "sinks": [{"sinkId": "out", "statusCode": 200, "message": "processed"}]
            }]
        })
    );

    let written = opener.written_to(&sink_key(1, "github", "out"));
    assert_eq!(written.len(), 2);
    assert_eq!(&written[1][..], b"{\"n\":2}");

    state.shutdown().await;
}

#[tokio::test]
async fn test_ingest_failures_are_reported_as_json() {
    let opener = TestOpener::new();
    opener.fail_writes_of("out");
    let state = start_state(memory_kv(), &opener).await;
    let app = create_app(state.clone());
    let secret = define_pipeline(&app).await;

    let reply = post_when_ready(&app, &format!("/stream/123/github/{secret}")).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.content_type, "application/json");
    let json = reply.json();
    assert_eq!(json["error"], "stream.in.writeFailed");
    assert_eq!(json["message"], "Written to 0/1 sinks.");
    assert_eq!(json["sources"][0]["sinks"][0]["message"], "Some write error.");

    state.shutdown().await;
}

#[tokio::test]
async fn test_ingest_request_errors() {
    let opener = TestOpener::new();
    let state = start_state(memory_kv(), &opener).await;
    let app = create_app(state.clone());
    let secret = define_pipeline(&app).await;

    let invalid_project = send(&app, post_record("/stream/abc/github/secret", "{}")).await;
    assert_eq!(invalid_project.status, StatusCode::BAD_REQUEST);
    assert_eq!(invalid_project.json()["error"], "stream.in.badRequest");

    let wrong_secret = send(&app, post_record("/stream/123/github/wrong", "{}")).await;
    assert_eq!(wrong_secret.status, StatusCode::NOT_FOUND);
    assert_eq!(wrong_secret.json()["error"], "stream.in.noSourceFound");

    let invalid_slug = send(&app, post_record("/stream/123/Not%20A%20Slug/secret", "{}")).await;
    assert_eq!(invalid_slug.json()["error"], "stream.in.noSourceFound");

    // The test body limit is 1024 bytes.
    let too_large = send(
        &app,
        post_record(&format!("/stream/123/github/{secret}"), vec![b'x'; 2048]),
    )
    .await;
    assert_eq!(too_large.status, StatusCode::PAYLOAD_TOO_LARGE);
    let json = too_large.json();
    assert_eq!(json["error"], "stream.in.bodyTooLarge");
    assert_eq!(json["message"], "Request body size is over the maximum \"1024B\".");

    let options = send(
        &app,
        Request::options("/stream/123/github/secret").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(options.status, StatusCode::OK);

    state.shutdown().await;
}

#[tokio::test]
async fn test_definition_lifecycle() {
    let opener = TestOpener::new();
    let state = start_state(memory_kv(), &opener).await;
    let app = create_app(state.clone());
    define_pipeline(&app).await;
    let source = "/v1/projects/123/branches/1/sources/github";

    let default = send(&app, get("/v1/projects/123/branches/default")).await;
    assert_eq!(default.json()["branchId"], 1);

    let updated = send(
        &app,
        Request::patch(source)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"name": "Renamed"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(updated.status, StatusCode::OK, "{}", updated.body);
    assert_eq!(updated.json()["version"]["number"], 2);
    assert_eq!(updated.json()["version"]["description"], "Source updated.");

    let disabled = send(&app, post_json(&format!("{source}/disable"), json!({}))).await;
    assert_eq!(disabled.json()["disabledReason"], "Disabled by an operator.");
    assert_eq!(disabled.json()["version"]["description"], "Disabled.");

    let rolled_back = send(&app, Request::post(format!("{source}/versions/1/rollback")).body(Body::empty()).unwrap()).await;
    assert_eq!(rolled_back.status, StatusCode::OK, "{}", rolled_back.body);
    assert_eq!(rolled_back.json()["name"], "GitHub");
    assert_eq!(rolled_back.json()["version"]["number"], 4);

    let versions = send(&app, get(&format!("{source}/versions"))).await;
    assert_eq!(versions.json()["data"].as_array().unwrap().len(), 4);

    let deleted = send(&app, Request::delete(source).body(Body::empty()).unwrap()).await;
    assert_eq!(deleted.status, StatusCode::OK, "{}", deleted.body);

    let listed = send(&app, get("/v1/projects/123/branches/1/sources?deleted=true")).await;
    assert_eq!(listed.json()["data"][0]["sourceId"], "github");
    let sinks = send(&app, get(&format!("{source}/sinks"))).await;
    assert_eq!(sinks.status, StatusCode::OK);
    assert!(sinks.json()["data"].as_array().unwrap().is_empty());

    let missing = send(&app, get(source)).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json()["error"], "stream.api.resourceNotFound");
    assert_eq!(missing.json()["message"], "Source \"github\" not found in the branch.");

    let restored = send(&app, Request::post(format!("{source}/undelete")).body(Body::empty()).unwrap()).await;
    assert_eq!(restored.status, StatusCode::OK, "{}", restored.body);
    let sinks = send(&app, get(&format!("{source}/sinks"))).await;
    assert_eq!(sinks.json()["data"][0]["sinkId"], "out");

    state.shutdown().await;
}

#[tokio::test]
async fn test_definition_validation() {
    let opener = TestOpener::new();
    let state = start_state(memory_kv(), &opener).await;
    let app = create_app(state.clone());
    define_pipeline(&app).await;

    let duplicate = send(
        &app,
        post_json(
            "/v1/projects/123/branches/1/sources",
            json!({"sourceId": "github", "name": "Again"}),
        ),
    )
    .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
    assert_eq!(duplicate.json()["error"], "stream.api.resourceAlreadyExists");

    let unsupported = send(
        &app,
        post_json(
            "/v1/projects/123/branches/1/sources/github/sinks",
            json!({"sinkId": "kafka", "type": "kafka", "name": "Kafka"}),
        ),
    )
    .await;
    assert_eq!(unsupported.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        unsupported.json()["message"],
        "Sink type \"kafka\" is not supported, supported types: test."
    );

    let empty_name = send(
        &app,
        post_json(
            "/v1/projects/123/branches/1/sources",
            json!({"sourceId": "blank", "name": "  "}),
        ),
    )
    .await;
    assert_eq!(empty_name.status, StatusCode::BAD_REQUEST);

    let bad_path = send(&app, get("/v1/projects/0/branches")).await;
    assert_eq!(bad_path.status, StatusCode::BAD_REQUEST);

    state.shutdown().await;
}

#[tokio::test]
async fn test_definition_api_requires_token_when_configured() {
    let opener = TestOpener::new();
    let config = stream_ingest::config::AppConfig {
        operator_tokens: vec!["operator-token".to_string()],
        ..test_config()
    };
    let state = start_state_with_config(config, memory_kv(), &opener).await;
    let app = create_app(state.clone());

    let anonymous = send(&app, get("/v1/projects/123/branches")).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
    assert_eq!(anonymous.json()["error"], "stream.api.unauthorized");

    let authorized = send(
        &app,
        Request::get("/v1/projects/123/branches")
            .header(header::AUTHORIZATION, "Bearer operator-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(authorized.status, StatusCode::OK);
    assert_eq!(authorized.json(), json!({"data": []}));

    // Ingestion stays public.
    let stream = send(&app, post_record("/stream/123/github/secret", "{}")).await;
    assert_eq!(stream.status, StatusCode::NOT_FOUND);

    state.shutdown().await;
}
