use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::any;
use flowgate::FlowConfig;
use flowgate_server::state::FlowState;
use flowgate_server::transport::http::serve;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Stand-in map server: echoes the query and the forwarded client, and
/// takes its time on GetMap
async fn spawn_upstream() -> SocketAddr {
    let app = Router::new().route(
        "/geoserver/{service}",
        any(
            |headers: HeaderMap, uri: axum::http::Uri| async move {
                let query = uri.query().unwrap_or_default().to_string();
                if query.contains("GetMap") {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                let forwarded = headers
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (
                    [("content-type", "text/plain"), ("x-upstream", "geoserver")],
                    format!("{query}|{forwarded}"),
                )
            },
        ),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_gateway(rules: serde_json::Value, upstream: Option<String>) -> SocketAddr {
    let flow: FlowConfig = serde_json::from_value(rules).unwrap();
    let state = Arc::new(FlowState::new(&flow, upstream.as_deref()).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, state).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_forwards_admitted_requests() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(
        json!({ "controllers": [{ "type": "global", "capacity": 4 }] }),
        Some(format!("http://{upstream}/geoserver")),
    )
    .await;

    let response = reqwest::get(format!(
        "http://{gateway}/wms?service=WMS&request=GetCapabilities"
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream"], "geoserver");
    let body = response.text().await.unwrap();
    assert_eq!(body, "service=WMS&request=GetCapabilities|127.0.0.1");
}

#[tokio::test]
async fn test_busy_gate_answers_503() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(
        json!({
            "timeout_secs": 0,
            "controllers": [{ "type": "ows", "service": "WMS", "operation": "GetMap", "capacity": 1 }]
        }),
        Some(format!("http://{upstream}/geoserver")),
    )
    .await;

    let client = reqwest::Client::new();
    let url = format!("http://{gateway}/wms?request=GetMap");

    let slow = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move { client.get(url).send().await.unwrap().status() }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let refused = client.get(&url).send().await.unwrap();
    assert_eq!(refused.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Other operations are not gated
    let caps = client
        .get(format!("http://{gateway}/wms?request=GetCapabilities"))
        .send()
        .await
        .unwrap();
    assert_eq!(caps.status(), StatusCode::OK);

    assert_eq!(slow.await.unwrap(), StatusCode::OK);

    // Permit released once the slow request finished
    let again = client.get(&url).send().await.unwrap();
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_over_http() {
    let gateway = spawn_gateway(
        json!({ "controllers": [{ "type": "rate", "rate": "2/h" }] }),
        None,
    )
    .await;

    // Cookie keyed: the session cookie issued on the first answer identifies
    // the client afterwards
    let client = reqwest::Client::new();
    let url = format!("http://{gateway}/wfs?request=GetFeature");

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-remaining"], "1");
    let cookie = first
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .unwrap()
        .to_string();

    let second = client
        .get(&url)
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

    let third = client
        .get(&url)
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);

    // A fresh session has its own budget
    let other = client.get(&url).send().await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_dead_upstream_answers_502() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let gateway = spawn_gateway(json!({}), Some(format!("http://{dead}"))).await;
    let response = reqwest::get(format!("http://{gateway}/wms?request=GetMap"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let metrics = reqwest::get(format!("http://{gateway}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("flowgate_upstream_errors 1"));
}

#[tokio::test]
async fn test_queued_requests_run_one_at_a_time() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(
        json!({ "controllers": [{ "type": "ip", "capacity": 1 }] }),
        Some(format!("http://{upstream}/geoserver")),
    )
    .await;

    let client = reqwest::Client::new();
    let url = format!("http://{gateway}/wms?request=GetMap");
    let started = std::time::Instant::now();

    let statuses = futures::future::join_all(
        (0..3).map(|_| async { client.get(&url).send().await.unwrap().status() }),
    )
    .await;

    assert!(statuses.iter().all(|s| *s == StatusCode::OK));
    // Each GetMap takes 300ms upstream and the client's gate admits one
    assert!(started.elapsed() >= Duration::from_millis(900));
}
