mod coins;
mod config;
mod detector;
mod errors;
mod handlers;
mod imaging;
mod models;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::info;
use std::sync::Arc;

use config::Config;
use detector::OnnxDetector;
use handlers::{AppState, InferenceSettings};
use imaging::ImageFetcher;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = Config::parse();
    config.validate()?;
    let settings = InferenceSettings {
        upload_size: config.upload_size()?,
        preview_size: config.preview_size()?,
        max_upload_bytes: config.max_upload_bytes,
    };

    let labels = detector::load_labels(&config.labels_path)?;
    let detector = OnnxDetector::load(
        &config.model_path,
        labels,
        &[settings.upload_size, settings.preview_size],
        config.iou_threshold,
    )
    .with_context(|| format!("loading model {}", config.model_path.display()))?;
    info!(
        "model {} loaded: {} labels, upload input {}, preview input {}",
        config.model_path.display(),
        detector.label_count(),
        settings.upload_size,
        settings.preview_size
    );

    let fetcher = ImageFetcher::new(config.fetch_timeout()).context("building HTTP client")?;
    let state = web::Data::new(AppState {
        detector: Arc::new(detector),
        fetcher,
        settings,
    });

    let bind_address = config.bind_address();
    info!("Server running at http://{}", bind_address);

    let app_state = state.clone();
    let mut server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(app_state.clone())
            .configure(handlers::configure)
            .default_service(web::route().to(handlers::not_found))
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }
    server
        .bind(&bind_address)
        .with_context(|| format!("binding {}", bind_address))?
        .run()
        .await?;

    drop(state);
    info!("server stopped, detector released");
    Ok(())
}
