//! Errors surfaced to the user interface.
//!
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("camera unavailable: {0:#}")]
    Camera(anyhow::Error),

    #[error("no composite surface yet, the detector is still loading")]
    NoSurface,

    #[error("a recording is already running")]
    AlreadyRecording,

    #[error("no recording is running")]
    NotRecording,

    #[error("stop the recording before saving it")]
    StillRecording,

    #[error("the recording holds no data")]
    EmptyRecording,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("video encoder failed: {0:#}")]
    Encoder(anyhow::Error),

    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Camera(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NoSurface
            | AppError::AlreadyRecording
            | AppError::NotRecording
            | AppError::StillRecording
            | AppError::EmptyRecording => StatusCode::CONFLICT,
            AppError::Encode(_) | AppError::Encoder(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        log::warn!("Request failed: {self}");
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn misuse_maps_to_conflict() {
        assert_eq!(AppError::EmptyRecording.status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::AlreadyRecording.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::Camera(anyhow::anyhow!("permission denied")).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn camera_error_keeps_cause() {
        let err = AppError::Camera(anyhow::anyhow!("no device").context("opening /dev/video9"));
        assert_eq!(
            err.to_string(),
            "camera unavailable: opening /dev/video9: no device"
        );
    }
}
