use crate::handlers::{health, stats, ws};
use crate::state::AppState;
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/stats", get(stats::get_stats))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use market_data::{Engine, SubscriberHub};
    use persistence::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use types::bucket::Stats;
    use types::swap::{Side, SwapEvent};

    fn test_state() -> AppState {
        let (hub, _reaper) = SubscriberHub::new(16);
        let engine = Arc::new(Engine::new(Arc::new(MemoryStore::default())));
        AppState::new(engine, hub, Duration::from_secs(60))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get_json(create_router(test_state()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert!(body["time"].is_string());
    }

    #[tokio::test]
    async fn test_stats_requires_token() {
        for uri in ["/stats", "/stats?token=", "/stats?token=%20"] {
            let (status, body) = get_json(create_router(test_state()), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["error"], "BAD_REQUEST");
        }
    }

    #[tokio::test]
    async fn test_stats_unknown_token_is_zero() {
        let (status, body) = get_json(create_router(test_state()), "/stats?token=NEW_TOKEN").await;
        assert_eq!(status, StatusCode::OK);
        let stats: Stats = serde_json::from_value(body).unwrap();
        assert_eq!(stats.token, "NEW_TOKEN");
        assert!(stats.is_empty());
    }

    #[tokio::test]
    async fn test_stats_reflects_applied_events() {
        let state = test_state();
        let now = Utc::now();
        let event = SwapEvent {
            event_id: "e1".to_string(),
            token: "BTC".to_string(),
            amount: 1.0,
            usd_value: 50_000.0,
            side: Side::Buy,
            created_at: now,
            executed_at: now,
        };
        state.engine.apply(&event).await.unwrap();

        let (status, body) = get_json(create_router(state), "/stats?token=BTC").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["window_5m"]["count"], 1);
        assert_eq!(body["window_24h"]["usd"], 50_000.0);
    }

    #[tokio::test]
    async fn test_ws_requires_token() {
        let (status, body) = get_json(create_router(test_state()), "/ws").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_ws_without_upgrade_is_rejected() {
        let response = create_router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/ws?token=BTC")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
