use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::routes::{api_error, ApiError};
use super::AppState;
use crate::daemon::events::JobEvent;
use crate::errors::DjrError;

/// Logs when the client goes away and the stream is dropped.
struct SseDropGuard(Uuid);

impl Drop for SseDropGuard {
    fn drop(&mut self) {
        tracing::debug!("SSE client for job {} disconnected", self.0);
    }
}

fn to_sse(event: &JobEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Event::default().event(event.name()).data(data)),
        Err(e) => {
            tracing::warn!("Failed to encode {} event: {}", event.name(), e);
            None
        }
    }
}

/// GET /api/jobs/{id}/stream
///
/// Replays everything the job has produced so far, then follows it live.
/// The stream ends after the `finished` event or when the job is deleted.
pub async fn stream_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job_id = Uuid::parse_str(&id).map_err(|_| {
        api_error(DjrError::Validation(format!("'{}' is not a valid job id", id)))
    })?;
    let subscription = state.registry.subscribe(job_id).await.map_err(api_error)?;
    tracing::info!("SSE client connected to job {}", job_id);

    let guard = SseDropGuard(job_id);
    let stream = subscription.into_stream().filter_map(move |event| {
        let _ = &guard;
        to_sse(&event).map(Ok)
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::build_state;
    use crate::models::ServerConfig;
    use crate::process::MockSpawner;
    use crate::server::create_router;
    use crate::storage::memory::MemoryJobStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn state(tmp: &TempDir) -> Arc<AppState> {
        let config = Arc::new(ServerConfig {
            data_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        });
        build_state(
            config,
            Arc::new(MemoryJobStore::new()),
            Arc::new(MockSpawner::with_output_and_exit(&["one", "# skipped.jpg"], 0)),
        )
        .await
        .expect("state")
    }

    #[tokio::test]
    async fn test_stream_unknown_job_is_404() {
        let tmp = TempDir::new().expect("temp dir");
        let router = create_router(state(&tmp).await);
        let req = Request::builder()
            .uri(format!("/api/jobs/{}/stream", Uuid::now_v7()))
            .body(Body::empty())
            .expect("request");
        let resp = router.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_finished_job_replays_and_ends() {
        let tmp = TempDir::new().expect("temp dir");
        let state = state(&tmp).await;
        let result = state
            .orchestrator
            .start_batch(&["https://example.com/a".to_string()], &Default::default(), None)
            .await
            .expect("batch");
        let job_id = result.jobs[0].job_id;
        for _ in 0..200 {
            match state.registry.status(job_id).await {
                Some(status) if !status.is_terminal() => {
                    tokio::time::sleep(Duration::from_millis(10)).await
                }
                _ => break,
            }
        }

        let req = Request::builder()
            .uri(format!("/api/jobs/{}/stream", job_id))
            .body(Body::empty())
            .expect("request");
        let resp = create_router(Arc::clone(&state))
            .oneshot(req)
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        // The stream closes on its own after `finished`, so the body can be
        // collected in full.
        let body = tokio::time::timeout(Duration::from_secs(5), resp.into_body().collect())
            .await
            .expect("stream ended")
            .expect("body")
            .to_bytes();
        let text = String::from_utf8_lossy(&body);

        let one = text.find("\"text\":\"one\"").expect("first line");
        let skipped = text.find("skipped.jpg").expect("second line");
        let finished = text.find("event: finished").expect("finished");
        assert!(one < skipped && skipped < finished);
        assert!(text.contains("event: counts"));
        assert!(text.contains("\"skip_count\":1"));
    }
}
