use crate::error::AppError;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use media_backup::record::{BackupRecord, RecordStore};
use media_backup::{BackupOutcome, RestoreRequest, RestoreResponse};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(run_backup))
        .route("/{id}", get(get_backup))
        .route("/{id}/restore", post(restore_backup))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreBody {
    /// Falls back to `backup.passphrase` from the pipeline config
    pub passphrase: Option<String>,
    #[serde(flatten)]
    pub request: RestoreRequest,
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupRecord>>, AppError> {
    let records = state.records.list_records().await?;
    Ok(Json(records))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, AppError> {
    match state.records.get_record(&id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound(format!("Backup not found: {}", id))),
    }
}

async fn run_backup(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<BackupOutcome>), AppError> {
    let outcome = state
        .run_backup()
        .await
        .ok_or_else(|| AppError::Conflict("A backup is already running".into()))?;

    let status = if outcome.success {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<RestoreResponse>, AppError> {
    let body: RestoreBody = if body.is_empty() {
        RestoreBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("Invalid restore request: {}", e)))?
    };
    let passphrase = body.passphrase.or_else(|| state.pipeline.backup.passphrase.clone());

    let response = state
        .restorer()
        .restore_backup(state.records.as_ref(), &id, passphrase.as_deref(), body.request)
        .await;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use media_backup::FakeMediaStore;
    use serde_json::Value;
    use tower::ServiceExt;

    struct TestApp {
        state: Arc<AppState>,
        store: Arc<FakeMediaStore>,
        _root: tempfile::TempDir,
    }

    fn app() -> TestApp {
        let (state, store, root) = test_state();
        TestApp {
            state,
            store,
            _root: root,
        }
    }

    async fn call(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let router = crate::routes::create_router(app.state.clone());
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_backup_then_restore() {
        let app = app();

        let (status, outcome) = call(&app, "POST", "/api/backups", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(outcome["success"], true);
        assert_eq!(outcome["downloaded"], 2);
        let id = outcome["recordId"].as_str().unwrap().to_string();

        let (status, records) = call(&app, "GET", "/api/backups", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(records.as_array().unwrap().len(), 1);
        assert_eq!(records[0]["status"], "completed");

        app.store.clear();
        let (status, response) = call(&app, "POST", &format!("/api/backups/{}/restore", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["mediaResult"]["uploadedCount"], 2);
        assert_eq!(response["mediaResult"]["success"], true);
        assert!(app.store.contains("avatars/a1"));
    }

    #[tokio::test]
    async fn test_restore_media_disabled() {
        let app = app();
        let (status, response) = call(
            &app,
            "POST",
            "/api/backups/anything/restore",
            Some(serde_json::json!({ "restoreMedia": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(response["mediaResult"].is_null());
    }

    #[tokio::test]
    async fn test_restore_unknown_backup_is_aborted() {
        let app = app();
        let (status, response) = call(&app, "POST", "/api/backups/missing/restore", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["mediaResult"]["success"], false);
        assert_eq!(response["mediaResult"]["message"], "Backup not found: missing");
    }

    #[tokio::test]
    async fn test_get_missing_backup() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/backups/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Backup not found: missing");
    }
}
