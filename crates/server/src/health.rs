use aisle_db::{ping, DbPool};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub readiness: Readiness,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub readiness: Readiness,
    pub orchestrator: ComponentStatus,
    pub context_store: ComponentStatus,
    pub checked_at: DateTime<Utc>,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(report)).with_state(db_pool)
}

/// Answers 503 whenever the context store cannot run a trivial query. Turns still complete
/// in that state, just without memory.
pub async fn report(State(db_pool): State<DbPool>) -> (StatusCode, Json<HealthReport>) {
    let context_store = match ping(&db_pool).await {
        Ok(()) => ComponentStatus {
            readiness: Readiness::Ready,
            detail: "answering queries".to_string(),
        },
        Err(error) => {
            warn!(
                event_name = "system.health.context_store_down",
                correlation_id = "health",
                error = %error,
                "context store ping failed"
            );
            ComponentStatus { readiness: Readiness::Degraded, detail: error.to_string() }
        }
    };
    let readiness = context_store.readiness;

    let body = HealthReport {
        readiness,
        orchestrator: ComponentStatus {
            readiness: Readiness::Ready,
            detail: "accepting turns".to_string(),
        },
        context_store,
        checked_at: Utc::now(),
    };
    let status = match readiness {
        Readiness::Ready => StatusCode::OK,
        Readiness::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(body))
}
