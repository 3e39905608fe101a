use std::collections::BTreeMap;
use std::sync::Arc;

use aisle_agent::{TurnError, TurnOrchestrator};
use aisle_core::domain::turn::{StreamEvent, TurnRequest};
use aisle_core::errors::{ApplicationError, FailureClass, InterfaceError};
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Data of the final SSE event.
pub const DONE_SENTINEL: &str = "[DONE]";
const STREAM_BUFFER: usize = 32;

#[derive(Clone)]
pub struct ApiState {
    orchestrator: Arc<TurnOrchestrator>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimingResponse {
    pub response: String,
    pub images: BTreeMap<String, String>,
    pub timings: BTreeMap<String, f64>,
    pub degraded: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    correlation_id: String,
}

pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_turn(error: TurnError) -> Self {
        let interface = ApplicationError::from(error).into_interface(Uuid::new_v4().to_string());
        warn!(
            event_name = "http.turn.rejected",
            correlation_id = %interface.correlation_id,
            error = %interface,
            "turn request rejected"
        );
        Self(interface)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.class {
            FailureClass::Rejected => StatusCode::BAD_REQUEST,
            FailureClass::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            FailureClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody { error: self.0.user_message(), correlation_id: self.0.correlation_id };
        (status, Json(body)).into_response()
    }
}

pub fn router(orchestrator: Arc<TurnOrchestrator>) -> Router {
    Router::new()
        .route("/query/stream", post(query_stream))
        .route("/query/timing", post(query_timing))
        .with_state(ApiState { orchestrator })
}

fn sse_event(event: &StreamEvent) -> Result<Event, axum::Error> {
    match event {
        StreamEvent::Done => Ok(Event::default().data(DONE_SENTINEL)),
        other => Event::default().json_data(other),
    }
}

pub async fn query_stream(
    State(state): State<ApiState>,
    Json(request): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    info!(event_name = "http.query.stream", user_id = request.user_id, "streaming turn requested");
    let receiver =
        state.orchestrator.spawn_streaming(request, STREAM_BUFFER).map_err(ApiError::from_turn)?;

    // Dropping the receiver when the client goes away cancels the turn.
    let events = stream::unfold(receiver, |mut receiver| async move {
        let event = receiver.recv().await?;
        Some((sse_event(&event), receiver))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn query_timing(
    State(state): State<ApiState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TimingResponse>, ApiError> {
    info!(event_name = "http.query.timing", user_id = request.user_id, "timed turn requested");
    let report = state.orchestrator.run_collect(request).await.map_err(ApiError::from_turn)?;

    Ok(Json(TimingResponse {
        response: report.response,
        images: report.images,
        timings: report.timings.timings().clone(),
        degraded: report.timings.degraded().iter().cloned().collect(),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use aisle_agent::catalog::{CatalogClient, CatalogError, CatalogQuery};
    use aisle_agent::guardrails::{SafetyClassifier, SafetyError};
    use aisle_agent::llm::{ChatMessage, FragmentStream, LlmClient, LlmError, ToolCall, ToolSpec};
    use aisle_agent::TurnOrchestrator;
    use aisle_core::config::AppConfig;
    use aisle_core::domain::turn::{ProductHit, SafetyDirection, SafetyVerdict, UserId};
    use aisle_db::InMemoryContextRepository;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use futures_util::stream::{self, StreamExt};
    use tower::ServiceExt;

    use crate::api::router;

    struct GreetingLlm;

    #[async_trait]
    impl LlmClient for GreetingLlm {
        async fn complete(&self, _: &[ChatMessage], _: u32) -> Result<String, LlmError> {
            Ok("chatter".to_string())
        }

        async fn call_tool(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ToolCall, LlmError> {
            Err(LlmError::MissingToolCall)
        }

        async fn stream(&self, _: &[ChatMessage]) -> Result<FragmentStream, LlmError> {
            Ok(stream::iter(vec![Ok("Hello ".to_string()), Ok("there".to_string())]).boxed())
        }
    }

    struct EmptyCatalog;

    #[async_trait]
    impl CatalogClient for EmptyCatalog {
        async fn search(&self, _: &CatalogQuery) -> Result<Vec<ProductHit>, CatalogError> {
            Ok(Vec::new())
        }
    }

    struct AllowAll;

    #[async_trait]
    impl SafetyClassifier for AllowAll {
        async fn classify(
            &self,
            _: UserId,
            _: &str,
            _: SafetyDirection,
        ) -> Result<SafetyVerdict, SafetyError> {
            Ok(SafetyVerdict::allow())
        }
    }

    fn app() -> Router {
        let orchestrator = TurnOrchestrator::from_config(
            &AppConfig::default(),
            Arc::new(InMemoryContextRepository::new()),
            Arc::new(GreetingLlm),
            Arc::new(EmptyCatalog),
            Arc::new(AllowAll),
        )
        .expect("orchestrator builds");
        router(Arc::new(orchestrator))
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request builds")
    }

    #[tokio::test]
    async fn empty_turn_is_a_bad_request_with_safe_message() {
        let response = app()
            .oneshot(post("/query/timing", r#"{"user_id": 7, "query": "  "}"#))
            .await
            .expect("route responds");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body reads");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(payload["error"], "Please send a question or an image so I can help.");
        assert!(payload["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn stream_route_emits_json_events_and_done_sentinel() {
        let response = app()
            .oneshot(post("/query/stream", r#"{"user_id": 7, "query": "hi"}"#))
            .await
            .expect("route responds");

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body reads");
        let text = String::from_utf8(body.to_vec()).expect("utf8 body");
        let data: Vec<&str> =
            text.lines().filter_map(|line| line.strip_prefix("data: ")).collect();
        assert_eq!(
            data,
            vec![
                r#"{"type":"content","payload":"Hello "}"#,
                r#"{"type":"content","payload":"there"}"#,
                "[DONE]",
            ]
        );
    }

    #[tokio::test]
    async fn timing_route_reports_answer_and_stage_timings() {
        let response = app()
            .oneshot(post("/query/timing", r#"{"user_id": 7, "query": "hi"}"#))
            .await
            .expect("route responds");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body reads");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(payload["response"], "Hello there");
        assert_eq!(payload["images"], serde_json::json!({}));
        assert!(payload["timings"]["total"].is_number());
        assert!(payload["timings"]["memory"].is_number());
        assert_eq!(payload["degraded"], serde_json::json!([]));
    }
}
