#[cfg(test)]
mod tests {
    use super::super::http::router;
    use crate::state::FlowState;
    use crate::types::{DispatchResponse, ErrorResponse, StatusResponse};
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use axum::Router;
    use flowgate::{FlowChain, FlowConfig, FlowController, GlobalFlowController};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(state: FlowState) -> Router {
        app_from(state, "10.0.0.1")
    }

    fn app_from(state: FlowState, ip: &str) -> Router {
        let peer = SocketAddr::new(ip.parse().unwrap(), 40000);
        router(Arc::new(state)).layer(MockConnectInfo(peer))
    }

    fn state(rules: serde_json::Value) -> FlowState {
        let flow: FlowConfig = serde_json::from_value(rules).unwrap();
        FlowState::new(&flow, None).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(state(json!({})))
            .oneshot(get("/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admitted_without_upstream() {
        let response = app(state(json!({
            "controllers": [
                { "type": "global", "capacity": 4 },
                { "type": "ows", "service": "WMS", "capacity": 2 }
            ]
        })))
        .oneshot(get(
            "/ows?SERVICE=WMS&REQUEST=GetMap&FORMAT=image/png&LAYERS=topp:states",
        ))
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: DispatchResponse = body_json(response).await;
        assert!(body.admitted);
        assert_eq!(body.service.as_deref(), Some("WMS"));
        assert_eq!(body.request.as_deref(), Some("GetMap"));
        assert_eq!(body.output_format.as_deref(), Some("image/png"));
        assert_eq!(body.controllers, 2);
    }

    #[tokio::test]
    async fn test_service_from_path() {
        let response = app(state(json!({})))
            .oneshot(get("/topp/wfs?request=GetFeature"))
            .await
            .unwrap();

        let body: DispatchResponse = body_json(response).await;
        assert_eq!(body.service.as_deref(), Some("WFS"));
        assert_eq!(body.request.as_deref(), Some("GetFeature"));
    }

    #[tokio::test]
    async fn test_blacklisted_client() {
        let rules = json!({
            "blacklist": "192.168.1.8",
            "controllers": [{ "type": "global", "capacity": 4 }]
        });

        let response = app_from(state(rules.clone()), "192.168.1.8")
            .oneshot(get("/wms?request=GetMap"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: ErrorResponse = body_json(response).await;
        assert!(body.error.contains("blacklisted"));

        let response = app_from(state(rules), "192.168.1.9")
            .oneshot(get("/wms?request=GetMap"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_blacklist_uses_forwarded_client() {
        let app = app(state(json!({ "blacklist": "192.168.1.8" })));
        let request = Request::builder()
            .uri("/wms?request=GetMap")
            .header("X-Forwarded-For", "192.168.1.8")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_full_gate_times_out() {
        let global = Arc::new(GlobalFlowController::new(1));
        assert!(global.blocker().acquire(Duration::ZERO, 0).await);

        let chain = FlowChain::new(
            vec![global.clone() as Arc<dyn FlowController>],
            Duration::ZERO,
        );
        let state = FlowState::with_chain(chain, None).unwrap();
        let response = app(state).oneshot(get("/wms?request=GetMap")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorResponse = body_json(response).await;
        assert!(body.error.contains("timed out"));

        global.blocker().release();
        assert_eq!(global.status().running, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_headers_and_rejection() {
        let app = app(state(json!({
            "controllers": [{ "type": "rate", "key": "ip", "service": "WMS", "rate": "1/h" }]
        })));

        let first = app
            .clone()
            .oneshot(get("/wms?request=GetMap"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-limit"], "1");
        assert_eq!(first.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(first.headers()["x-ratelimit-action"], "Reject excess requests");
        assert!(first.headers().contains_key("x-ratelimit-reset"));

        let second = app.oneshot(get("/wms?request=GetMap")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["x-ratelimit-remaining"], "0");
    }

    #[tokio::test]
    async fn test_rate_limit_ignores_other_services() {
        let app = app(state(json!({
            "controllers": [{ "type": "rate", "key": "ip", "service": "WMS", "rate": "1/h" }]
        })));

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(get("/wfs?request=GetFeature"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-limit"));
        }
    }

    #[tokio::test]
    async fn test_status_reports_controllers() {
        let response = app(state(json!({
            "timeout_secs": 5,
            "controllers": [
                { "type": "global", "capacity": 10 },
                { "type": "ip", "capacity": 2 }
            ]
        })))
        .oneshot(get("/status"))
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let status: StatusResponse = body_json(response).await;
        assert_eq!(status.timeout_secs, 5);
        assert_eq!(status.controllers.len(), 2);
        assert_eq!(status.controllers[0].kind, "global");
        assert_eq!(status.controllers[0].capacity, 10);
        assert_eq!(status.controllers[1].kind, "ip");
        assert_eq!(status.controllers[1].running, 0);
    }

    #[tokio::test]
    async fn test_metrics_count_outcomes() {
        let app = app(state(json!({
            "controllers": [{ "type": "rate", "key": "ip", "rate": "1/h" }]
        })));

        for _ in 0..2 {
            app.clone().oneshot(get("/wms")).await.unwrap();
        }
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("flowgate_requests_total 2"));
        assert!(text.contains("flowgate_requests_by_outcome{outcome=\"admitted\"} 1"));
        assert!(text.contains("flowgate_requests_by_outcome{outcome=\"rejected\"} 1"));
        assert!(text.contains("flowgate_controller_capacity{controller=\"rate ip\",kind=\"rate\"} 1"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = format!("http://{addr}");
        let state = FlowState::new(&FlowConfig::default(), Some(&upstream)).unwrap();
        let response = app(state).oneshot(get("/wms?request=GetMap")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
