use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use dataagent_core::config::LlmConfig;
use dataagent_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    llm_detail: String,
}

impl HealthState {
    pub fn new(db_pool: DbPool, llm: &LlmConfig) -> Self {
        let provider = serde_json::to_value(llm.provider)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        Self { db_pool, llm_detail: format!("{provider} model `{}`", llm.model) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub llm: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "dataagent-server query runtime initialized".to_string(),
        },
        database,
        llm: HealthCheck { status: "configured", detail: state.llm_detail.clone() },
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversation_turn").fetch_one(pool).await
    {
        Ok(turns) => HealthCheck { status: "ready", detail: format!("{turns} conversation turns stored") },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        extract::State,
        http::{Request, StatusCode},
        Json,
    };
    use dataagent_core::config::AppConfig;
    use dataagent_db::{connect_with_settings, migrations};
    use tower::ServiceExt;

    use crate::health::{health, router, HealthState};

    #[tokio::test]
    async fn health_returns_ready_when_turn_store_is_reachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let config = AppConfig::default();

        let response = router(HealthState::new(pool.clone(), &config.llm))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "ready");
        assert_eq!(payload["database"]["detail"], "0 conversation turns stored");
        assert_eq!(payload["llm"]["detail"], "ollama model `qwen2.5`");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_is_degraded_before_migrations_or_after_close() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let config = AppConfig::default();

        let (status, Json(payload)) =
            health(State(HealthState::new(pool.clone(), &config.llm))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.database.status, "degraded");

        pool.close().await;
        let (status, Json(payload)) = health(State(HealthState::new(pool, &config.llm))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }
}
