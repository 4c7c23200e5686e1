use actix_multipart::Multipart;
use actix_web::{web, HttpResponse, Result};
use futures_util::StreamExt;
use image::DynamicImage;
use log::{debug, info, warn};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;

use crate::coins::coin_sum;
use crate::detector::{DetectOptions, Detection, Detector};
use crate::errors::{query_error, ApiError};
use crate::imaging::{self, ImageFetcher};
use crate::models::{
    EncodeUrlQuery, EncodedUrl, Greeting, InferenceSize, ModelInfo, PredictionQuery,
    PredictionResponse,
};

/// Everything except unreserved characters, so a whole URL fits in one path segment.
const URL_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct AppState {
    pub detector: Arc<dyn Detector>,
    pub fetcher: ImageFetcher,
    pub settings: InferenceSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct InferenceSettings {
    pub upload_size: InferenceSize,
    /// Input edge for the URL preview; smaller than `upload_size` by default.
    pub preview_size: InferenceSize,
    pub max_upload_bytes: usize,
}

struct Upload {
    filename: String,
    bytes: Vec<u8>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(query_error))
        .route("/", web::get().to(root))
        .route("/User/{name}", web::get().to(user_greeting))
        .route("/model-info/", web::get().to(model_info))
        .route("/Prediction/", web::post().to(predict))
        .route("/PredictionFromURL/{url_path:.*}", web::get().to(predict_from_url))
        .route("/encode-url/", web::get().to(encode_url));
}

pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(Greeting {
        message: "Hello. Go to http://127.0.0.1:8000/docs".to_string(),
    })
}

pub async fn user_greeting(name: web::Path<String>) -> HttpResponse {
    let today = chrono::Local::now().date_naive();
    HttpResponse::Ok().json(Greeting {
        message: format!("Hello {}, today is {}", name.into_inner(), today),
    })
}

pub async fn model_info() -> HttpResponse {
    HttpResponse::Ok().json(ModelInfo::coins())
}

pub async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(serde_json::json!({ "detail": "Not Found" }))
}

pub async fn predict(
    state: web::Data<AppState>,
    query: web::Query<PredictionQuery>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let upload = read_upload(&mut payload, state.settings.max_upload_bytes).await?;
    let image = imaging::decode_image(&upload.bytes).map_err(|e| {
        warn!("cannot decode upload {:?}: {}", upload.filename, e);
        ApiError::from(e)
    })?;

    let options = DetectOptions {
        confidence: query.probability,
        size: state.settings.upload_size,
    };
    let detections = run_detector(&state, image, options).await?;
    let summ = coin_sum(&detections)?;
    info!(
        "predicted {:?}: {} coins, sum {} (probability {})",
        upload.filename,
        detections.len(),
        summ,
        options.confidence
    );

    Ok(HttpResponse::Ok().json(PredictionResponse {
        filename: upload.filename,
        summ,
    }))
}

pub async fn predict_from_url(
    state: web::Data<AppState>,
    url_path: web::Path<String>,
    query: web::Query<PredictionQuery>,
) -> Result<HttpResponse, ApiError> {
    let image_url = percent_decode_str(&url_path).decode_utf8_lossy().into_owned();

    let bytes = state.fetcher.fetch(&image_url).await.map_err(|e| {
        warn!("cannot fetch {}: {}", image_url, e);
        ApiError::RemoteFetch(e.to_string())
    })?;

    let image = imaging::decode_image(&bytes).map_err(|e| {
        warn!("cannot decode image from {}: {}", image_url, e);
        ApiError::from(e)
    })?;
    let png = imaging::png_base64(&image)?;

    let options = DetectOptions {
        confidence: query.probability,
        size: state.settings.preview_size,
    };
    let detections = run_detector(&state, image, options).await?;
    let summ = coin_sum(&detections)?;
    info!(
        "predicted {}: {} coins, sum {} (probability {})",
        image_url,
        detections.len(),
        summ,
        options.confidence
    );

    Ok(HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_preview(summ, &png)))
}

pub async fn encode_url(query: web::Query<EncodeUrlQuery>) -> HttpResponse {
    let encoded = utf8_percent_encode(&query.url, URL_SEGMENT).to_string();
    HttpResponse::Ok().json(EncodedUrl {
        prediction_path: format!("/PredictionFromURL/{}", encoded),
        encoded_url: encoded,
    })
}

/// Picks the part named `file`, falling back to the first image part that
/// carries a file name. Other parts are drained.
async fn read_upload(payload: &mut Multipart, limit: usize) -> Result<Upload, ApiError> {
    let mut fallback: Option<Upload> = None;
    let mut skipped_non_image = false;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| ApiError::Upload(e.to_string()))?;
        let disposition = field.content_disposition();
        let is_file_field = disposition.get_name() == Some("file");
        let filename = disposition.get_filename().map(str::to_owned);
        // The declared type decides, whatever the body holds.
        let content_type = field.content_type().essence_str().to_owned();
        let is_image = content_type.starts_with("image/");

        if is_file_field && !is_image {
            warn!("rejected upload {:?} with content type {}", filename, content_type);
            return Err(ApiError::InvalidContentType);
        }
        if !is_file_field && filename.is_some() && !is_image {
            skipped_non_image = true;
        }

        if is_file_field || (fallback.is_none() && filename.is_some() && is_image) {
            let mut bytes = Vec::new();
            while let Some(chunk) = field.next().await {
                let chunk = chunk.map_err(|e| ApiError::Upload(e.to_string()))?;
                if bytes.len() + chunk.len() > limit {
                    return Err(ApiError::PayloadTooLarge);
                }
                bytes.extend_from_slice(&chunk);
            }
            let upload = Upload {
                filename: filename.unwrap_or_default(),
                bytes,
            };
            if is_file_field {
                return Ok(upload);
            }
            fallback = Some(upload);
        } else {
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| ApiError::Upload(e.to_string()))?;
            }
        }
    }

    match fallback {
        Some(upload) => Ok(upload),
        None if skipped_non_image => Err(ApiError::InvalidContentType),
        None => Err(ApiError::MissingFile),
    }
}

/// Inference is CPU bound; it runs on the blocking pool, not on the worker.
async fn run_detector(
    state: &web::Data<AppState>,
    image: DynamicImage,
    options: DetectOptions,
) -> Result<Vec<Detection>, ApiError> {
    let detector = Arc::clone(&state.detector);
    let detections = web::block(move || detector.detect(&image, &options)).await??;
    for d in &detections {
        debug!(
            "class {} label {} score {:.3} box ({:.0}, {:.0}, {:.0}, {:.0})",
            d.class_id, d.label, d.score, d.bbox.x1, d.bbox.y1, d.bbox.x2, d.bbox.y2
        );
    }
    Ok(detections)
}

fn render_preview(summ: u64, png_base64: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Predicted Image</title>
</head>
<body>
    <h1>Predicted Image</h1>
    <p>Sum of coins: {summ}</p>
    <img src="data:image/png;base64,{png_base64}" alt="Predicted Image"/>
</body>
</html>
"#
    )
}
