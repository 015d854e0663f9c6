use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use types::bucket::Stats;

use crate::error::AppError;
use crate::models::TokenQuery;
use crate::state::AppState;

/// Current 5m/1h/24h view for `?token=`; all zeros for an unknown token.
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Stats>, AppError> {
    let token = query.require_token()?;
    Ok(Json(state.engine.stats(&token, Utc::now())))
}
