//! Train archive intake.

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{debug, info};
use trainbuilder_core::ARCHIVE_EXTENSION;

use crate::AppState;
use crate::error::ApiError;

/// Multipart field carrying the archive.
pub const FILE_FIELD: &str = "file";

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

const NO_FILE_SELECTED: &str = "No file was selected";
const NOT_AN_ARCHIVE: &str = "No file was selected or file is not a .tar file.";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_train))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

/// Intake reply. Rejections are reported with status 201 and a message.
#[derive(Debug, Serialize)]
struct IntakeResponse {
    success: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<String>,
}

type IntakeReply = (StatusCode, Json<IntakeResponse>);

fn accepted() -> IntakeReply {
    (
        StatusCode::OK,
        Json(IntakeResponse {
            success: "true",
            msg: None,
        }),
    )
}

fn rejected(msg: impl Into<String>) -> IntakeReply {
    (
        StatusCode::CREATED,
        Json(IntakeResponse {
            success: "false",
            msg: Some(msg.into()),
        }),
    )
}

/// Whether the filename's last extension is `tar`, ignoring case.
pub fn has_archive_extension(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
}

async fn submit_train(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<IntakeReply, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            debug!(field = ?field.name(), "Ignoring multipart field");
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return Ok(rejected(NO_FILE_SELECTED));
        }
        if !has_archive_extension(&filename) {
            return Ok(rejected(NOT_AN_ARCHIVE));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let job = state.service.submit(&filename, &bytes).await?;
        info!(job_id = %job.id, filename = %filename, train = %job.canonical_name, "Train archive accepted");
        return Ok(accepted());
    }

    Ok(rejected(format!(
        "Field with name {} was not submitted",
        FILE_FIELD
    )))
}
