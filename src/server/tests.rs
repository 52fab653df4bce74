use super::*;
use crate::test_support::spawn_server;
use axum::{
    body::Body,
    extract::Path,
    http::{header, Request, StatusCode},
};
use serde_json::Value;
use tower::ServiceExt;

const STREAM_JS: &str = r#"
exports.getStream = async function ({ link, type, providerContext }) {
    console.log("resolving", link);
    if (link.indexOf("broken") !== -1) throw new Error("scrape failed");
    return [{ server: "Own", link: link + ".m3u8", type: "m3u8" }];
};
"#;

const POSTS_JS: &str = r#"
module.exports = {
    getPosts: async ({ filter, page }) => [{ title: filter, page: page }],
};
"#;

/// A mirror that only knows the `mod` provider's stream and posts modules
async fn mirror() -> String {
    spawn_server(Router::new().route(
        "/:provider/:file",
        get(|Path((provider, file)): Path<(String, String)>| async move {
            match (provider.as_str(), file.as_str()) {
                ("mod", "stream.js") => Ok(STREAM_JS),
                ("mod", "posts.js") => Ok(POSTS_JS),
                _ => Err(StatusCode::NOT_FOUND),
            }
        }),
    ))
    .await
}

async fn app(production: bool) -> Router {
    let mut config = Config::default();
    config.modules.mirrors = vec![mirror().await];
    config.server.production = production;
    router(Arc::new(AppState::from_config(&config).unwrap()))
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_carries_request_id() {
    let response = app(false)
        .await
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"].len(), 36);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_through_alias() {
    let (status, body) = get_json(
        app(false).await,
        "/api/stream?provider=modflix&link=https%3A%2F%2Fsite.example%2Fep1&type=series",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "provider");
    assert_eq!(body["data"][0]["link"], "https://site.example/ep1.m3u8");
    assert_eq!(body["data"][0]["type"], "m3u8");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_parameters_are_bad_requests() {
    let app = app(false).await;
    let (status, body) = get_json(app.clone(), "/api/stream?provider=mod").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body["suggestions"].as_array().unwrap().is_empty());

    let (status, _) = get_json(app, "/api/proxy?url=ftp%3A%2F%2Fx").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_provider_is_not_found() {
    let (status, body) = get_json(
        app(false).await,
        "/api/stream?provider=nobody&link=https%3A%2F%2Fsite.example%2Fx",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["provider"], "nobody");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_error_hides_stack_in_production() {
    let uri = "/api/stream?provider=mod&link=https%3A%2F%2Fsite.example%2Fbroken";

    let (status, body) = get_json(app(true).await, uri).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("scrape failed"));
    assert!(body.get("details").is_none());

    let (_, body) = get_json(app(false).await, uri).await;
    assert!(body["details"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_posts_and_episodes_pass_through() {
    let app = app(false).await;
    let (status, body) = get_json(app.clone(), "/api/posts?provider=mod&filter=latest&page=3&refresh=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!([{"title": "latest", "page": 3}]));

    let (status, body) = get_json(app, "/api/episodes?provider=mod&url=https%3A%2F%2Fsite.example%2Fs1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_test_provider_reports_modules() {
    let (status, body) = get_json(app(false).await, "/api/test-provider?provider=moviesmod").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "mod");
    assert_eq!(body["modules"], serde_json::json!(["posts", "stream"]));
    assert_eq!(body["moduleSizes"]["stream"], STREAM_JS.len());
    assert_eq!(body["exports"]["posts"]["functions"], serde_json::json!(["getPosts"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_range_request_end_to_end() {
    let upstream = spawn_server(Router::new().route(
        "/v.mp4",
        get(|| async {
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, "video/mp4"),
                    (header::CONTENT_RANGE, "bytes 100-199/1000"),
                    (header::ACCEPT_RANGES, "bytes"),
                ],
                vec![7u8; 100],
            )
        }),
    ))
    .await;

    let uri = format!("/api/proxy?url={}", urlencoding::encode(&format!("{}/v.mp4", upstream)));
    let response = app(false)
        .await
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(header::RANGE, "bytes=100-199")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 100-199/1000");
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 100);
}
