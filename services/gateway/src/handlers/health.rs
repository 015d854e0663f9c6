use axum::Json;
use chrono::Utc;

use crate::models::HealthResponse;

pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        time: Utc::now(),
    })
}
