use actix_web::error::{BlockingError, QueryPayloadError};
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::coins::AggregateError;
use crate::detector::DetectorError;
use crate::imaging::ImageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("File provided is not an image.")]
    InvalidContentType,
    #[error("No file provided.")]
    MissingFile,
    #[error("Uploaded file is too large.")]
    PayloadTooLarge,
    #[error("Invalid image format.")]
    UndecodableImage,
    #[error("Error fetching image from URL: {0}<n/>Please use /encode-url/ then paste here")]
    RemoteFetch(String),
    #[error("{0}")]
    Validation(String),
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("Aggregation failed: {0}")]
    Aggregation(#[from] AggregateError),
    #[error("Image encoding failed: {0}")]
    Encoding(String),
    #[error("Inference task was cancelled")]
    Blocking,
}

impl ApiError {
    /// Fetch and query failures answer with `detail`, everything else with `message`.
    fn body_key(&self) -> &'static str {
        match self {
            ApiError::RemoteFetch(_) | ApiError::Validation(_) => "detail",
            _ => "message",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidContentType
            | ApiError::MissingFile
            | ApiError::UndecodableImage
            | ApiError::RemoteFetch(_)
            | ApiError::Validation(_)
            | ApiError::Upload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Detection(_)
            | ApiError::Aggregation(_)
            | ApiError::Encoding(_)
            | ApiError::Blocking => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = serde_json::Map::new();
        body.insert(self.body_key().to_string(), json!(self.to_string()));
        HttpResponse::build(self.status_code()).json(body)
    }
}

impl From<ImageError> for ApiError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::Empty | ImageError::Decode(_) => ApiError::UndecodableImage,
            ImageError::Encode(e) => ApiError::Encoding(e.to_string()),
        }
    }
}

impl From<BlockingError> for ApiError {
    fn from(_: BlockingError) -> Self {
        ApiError::Blocking
    }
}

/// Turns query extraction failures (bad `probability`, missing `url`) into
/// 400 responses before any handler runs.
pub fn query_error(err: QueryPayloadError, req: &HttpRequest) -> actix_web::Error {
    log::warn!("rejected query for {}: {}", req.path(), err);
    ApiError::Validation(err.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    async fn body_of(err: ApiError) -> serde_json::Value {
        let bytes = to_bytes(err.error_response().into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[actix_web::test]
    async fn client_errors_keep_their_message_shape() {
        assert_eq!(ApiError::InvalidContentType.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_of(ApiError::InvalidContentType).await,
            json!({"message": "File provided is not an image."})
        );
        assert_eq!(
            body_of(ApiError::UndecodableImage).await,
            json!({"message": "Invalid image format."})
        );
    }

    #[actix_web::test]
    async fn fetch_errors_use_detail() {
        let err = ApiError::RemoteFetch("connection refused".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        let body = body_of(err).await;
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Error fetching image from URL: connection refused"));
    }

    #[test]
    fn server_side_failures_are_500() {
        let err = ApiError::from(AggregateError::NonNumericLabel("x".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::Blocking.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn image_errors_map_to_decode_failure() {
        assert!(matches!(ApiError::from(ImageError::Empty), ApiError::UndecodableImage));
    }
}
