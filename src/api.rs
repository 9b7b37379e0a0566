use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::pipeline::{self, DetectionReport};
use crate::runner::RunError;
use crate::state::{AppState, RunPhase, RunProgress};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/detect", post(start_detection))
        .route("/cancel", post(cancel_detection))
        .route("/status", get(get_status))
        .route("/result", get(get_result))
        .route("/catalog", get(get_catalog))
        .with_state(state)
}

fn check_auth(headers: &HeaderMap, expected_token: Option<&str>) -> Result<(), StatusCode> {
    let Some(expected_token) = expected_token else {
        return Ok(());
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if let Some(token) = auth.strip_prefix("Bearer ")
        && token == expected_token
    {
        return Ok(());
    }

    Err(StatusCode::UNAUTHORIZED)
}

#[derive(Deserialize)]
struct DetectRequest {
    /// Plain base64 or a `data:image/...;base64,` URL.
    image_base64: String,
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

/// Decode the request body into a screenshot: raw image bytes, or JSON
/// carrying base64.
fn screenshot_from_body(headers: &HeaderMap, body: &[u8]) -> Result<DynamicImage, StatusCode> {
    let decoded;
    let image_bytes = if is_json(headers) {
        let request: DetectRequest = serde_json::from_slice(body).map_err(|e| {
            tracing::warn!("bad detect request: {e}");
            StatusCode::BAD_REQUEST
        })?;
        let payload = match request.image_base64.split_once(";base64,") {
            Some((_, data)) => data,
            None => request.image_base64.as_str(),
        };
        decoded = STANDARD.decode(payload.trim()).map_err(|e| {
            tracing::warn!("bad base64 screenshot: {e}");
            StatusCode::BAD_REQUEST
        })?;
        decoded.as_slice()
    } else {
        body
    };

    pipeline::decode_screenshot(image_bytes).map_err(|e| {
        tracing::warn!("screenshot rejected: {e}");
        StatusCode::BAD_REQUEST
    })
}

/// Decode the body on the blocking pool.
async fn decode_body(headers: HeaderMap, body: Bytes) -> Result<DynamicImage, StatusCode> {
    tokio::task::spawn_blocking(move || screenshot_from_body(&headers, &body))
        .await
        .map_err(|e| {
            tracing::error!("screenshot decode task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
}

async fn start_detection(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let (auth_token, busy) = {
        let state = app.lock().await;
        (state.config.auth_token.clone(), state.runner.is_running())
    };
    check_auth(&headers, auth_token.as_deref())?;
    if busy {
        return Err(StatusCode::CONFLICT);
    }

    let screenshot = decode_body(headers, body).await?;
    let (width, height) = (screenshot.width(), screenshot.height());

    let mut state = app.lock().await;
    let mut handle = match state.runner.start(
        screenshot,
        state.catalog.clone(),
        state.detection.clone(),
    ) {
        Ok(handle) => handle,
        Err(RunError::AlreadyInProgress) => return Err(StatusCode::CONFLICT),
    };
    let run_id = state.begin_run();
    drop(state);

    let app_state = app.clone();
    tokio::spawn(async move {
        {
            let mut events = std::pin::pin!(handle.events());
            while let Some(event) = events.next().await {
                app_state.lock().await.apply_event(run_id, &event);
            }
        }
        let outcome = handle.finish().await;
        if let Err(e) = &outcome {
            tracing::warn!("run {run_id} ended without result: {e}");
        }
        app_state.lock().await.finish_run(run_id, outcome);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "started", "run_id": run_id, "width": width, "height": height})),
    ))
}

async fn cancel_detection(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let state = app.lock().await;
    check_auth(&headers, state.config.auth_token.as_deref())?;

    if state.runner.cancel() {
        Ok(Json(json!({"status": "cancelling"})))
    } else {
        Ok(Json(json!({"status": "idle"})))
    }
}

#[derive(Serialize)]
struct StatusResponse {
    phase: RunPhase,
    running: bool,
    run_id: u64,
    progress: Option<RunProgress>,
    message: Option<String>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    elapsed_secs: Option<f64>,
}

async fn get_status(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let state = app.lock().await;
    check_auth(&headers, state.config.auth_token.as_deref())?;

    Ok(Json(StatusResponse {
        phase: state.phase,
        running: state.runner.is_running(),
        run_id: state.run_id,
        progress: state.progress.clone(),
        message: state.last_status.clone(),
        error: state.last_error.clone(),
        started_at: state.started_at,
        finished_at: state.finished_at,
        elapsed_secs: state.elapsed_secs(),
    }))
}

async fn get_result(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DetectionReport>, StatusCode> {
    let state = app.lock().await;
    check_auth(&headers, state.config.auth_token.as_deref())?;

    state.last_report.clone().map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    id: String,
    name: String,
    short_name: Option<String>,
    wiki_link: Option<String>,
    has_icon: bool,
    is_square_icon: bool,
    icon_size: Option<(u32, u32)>,
}

async fn get_catalog(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let state = app.lock().await;
    check_auth(&headers, state.config.auth_token.as_deref())?;

    let entries: Vec<CatalogEntry> = state
        .catalog
        .items()
        .iter()
        .map(|item| CatalogEntry {
            id: item.item.id.clone(),
            name: item.item.name.clone(),
            short_name: item.item.short_name.clone(),
            wiki_link: item.item.wiki_link.clone(),
            has_icon: item.usable_icon().is_some(),
            is_square_icon: item.is_square_icon,
            icon_size: item.usable_icon().map(|icon| (icon.width(), icon.height())),
        })
        .collect();

    Ok(Json(entries))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use axum::http::HeaderValue;
    use image::imageops;
    use tokio::sync::Mutex;

    use super::*;
    use crate::catalog::Catalog;
    use crate::matcher::tests::{background, item_with_icon, textured_icon};
    use crate::state::tests::test_state;

    fn png_bytes(image: &image::GrayImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn app(token: Option<&str>) -> AppState {
        let icon = textured_icon(24, 24, 3);
        let catalog = Catalog::new(vec![item_with_icon("a", icon)]);
        Arc::new(Mutex::new(test_state(token, catalog)))
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_check_auth() {
        assert!(check_auth(&HeaderMap::new(), None).is_ok());
        assert_eq!(
            check_auth(&HeaderMap::new(), Some("secret")),
            Err(StatusCode::UNAUTHORIZED)
        );
        assert_eq!(
            check_auth(&bearer("wrong"), Some("secret")),
            Err(StatusCode::UNAUTHORIZED)
        );
        assert!(check_auth(&bearer("secret"), Some("secret")).is_ok());
    }

    #[test]
    fn test_screenshot_from_raw_and_json_body() {
        let png = png_bytes(&background(12, 9));

        let image = screenshot_from_body(&HeaderMap::new(), &png).unwrap();
        assert_eq!((image.width(), image.height()), (12, 9));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(&png));
        let body = json!({ "image_base64": data_url });
        let image = screenshot_from_body(&headers, body.to_string().as_bytes()).unwrap();
        assert_eq!((image.width(), image.height()), (12, 9));

        let body = json!({"image_base64": "!!!"});
        assert_eq!(
            screenshot_from_body(&headers, body.to_string().as_bytes()).unwrap_err(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            screenshot_from_body(&HeaderMap::new(), b"garbage").unwrap_err(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_detect_runs_and_stores_result() {
        let app = app(None);
        let icon = textured_icon(24, 24, 3);
        let mut screen = background(90, 70);
        imageops::replace(&mut screen, &icon, 30, 20);

        let response = start_detection(
            State(app.clone()),
            HeaderMap::new(),
            Bytes::from(png_bytes(&screen)),
        )
        .await;
        assert!(response.is_ok());

        let mut report = None;
        for _ in 0..200 {
            if let Some(r) = app.lock().await.last_report.clone() {
                report = Some(r);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let report = report.expect("run did not finish");
        assert_eq!(report.found_items.len(), 1);
        assert_eq!(app.lock().await.phase, RunPhase::Completed);

        let result = get_result(State(app.clone()), HeaderMap::new()).await.unwrap();
        assert_eq!(result.0, report);
    }

    #[tokio::test]
    async fn test_detect_conflicts_while_running() {
        let app = app(None);
        // hold the runner busy with a run that cannot finish quickly
        let items = (0..40)
            .map(|i| item_with_icon(&format!("slow{i}"), textured_icon(24, 24, 500 + i)))
            .collect();
        let handle = {
            let state = app.lock().await;
            state
                .runner
                .start(
                    DynamicImage::ImageLuma8(background(160, 120)),
                    Arc::new(Catalog::new(items)),
                    state.detection.clone(),
                )
                .unwrap()
        };

        let png = png_bytes(&background(20, 20));
        let response =
            start_detection(State(app.clone()), HeaderMap::new(), Bytes::from(png)).await;
        assert_eq!(response.err(), Some(StatusCode::CONFLICT));

        let response = cancel_detection(State(app.clone()), HeaderMap::new()).await;
        assert!(response.is_ok());
        assert!(handle.finish().await.is_err());
    }

    #[tokio::test]
    async fn test_body_decodes_without_state_lock() {
        let app = app(None);
        let _held = app.lock().await;

        let png = png_bytes(&background(30, 20));
        let image = decode_body(HeaderMap::new(), Bytes::from(png)).await.unwrap();
        assert_eq!((image.width(), image.height()), (30, 20));
    }

    #[tokio::test]
    async fn test_bad_body_leaves_state_idle() {
        let app = app(None);
        let body = Bytes::from_static(b"junk");
        let response = start_detection(State(app.clone()), HeaderMap::new(), body).await;
        assert_eq!(response.err(), Some(StatusCode::BAD_REQUEST));

        let state = app.lock().await;
        assert_eq!(state.phase, RunPhase::Idle);
        assert_eq!(state.run_id, 0);
        assert!(!state.runner.is_running());
    }

    #[tokio::test]
    async fn test_result_not_found_before_first_run() {
        let app = app(Some("t"));
        assert_eq!(
            get_result(State(app.clone()), HeaderMap::new()).await.unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            get_result(State(app), bearer("t")).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }
}
