//! HTTP surface: parameter validation, multipart intake, response shaping.
//! All real work happens in the orchestrator; handlers stay thin.

use std::convert::Infallible;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::upload;
use crate::error::ApiError;
use crate::notify::{parse_callbacks, CallbackSink};
use crate::service::{BatchAccepted, OptimizationService, OptimizeAccepted};
use crate::transform::{
    BlurPlaceholderOptions, OptimizationOptions, OutputFormat, WatermarkOptions,
};

#[derive(Clone)]
pub struct AppState {
    pub service: OptimizationService,
}

pub fn router(state: AppState) -> Router {
    // Leave headroom over the file limit for multipart framing.
    let body_limit = state.service.config().max_file_size + 1024 * 1024;
    Router::new()
        .route("/image-optimization/optimize", post(optimize))
        .route("/image-optimization/batch-optimize", post(batch_optimize))
        .route("/image-optimization/blur-placeholder", post(blur_placeholder))
        .route("/image-optimization/convert", post(convert))
        .route("/image-optimization/thumbnail", post(thumbnail))
        .route("/image-optimization/watermark", post(watermark))
        .route("/image-optimization/download/:filename", get(download))
        .route("/image-optimization-sse/subscribe/:id", get(subscribe))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptimizeQuery {
    width: Option<u32>,
    height: Option<u32>,
    quality: Option<u8>,
    format: Option<String>,
}

fn options_from(
    query: &OptimizeQuery,
    default_quality: u8,
) -> Result<OptimizationOptions, ApiError> {
    let format = match &query.format {
        Some(raw) => parse_format(raw)?,
        None => OutputFormat::Jpeg,
    };
    Ok(OptimizationOptions {
        width: Some(query.width.unwrap_or(800)),
        height: query.height,
        quality: query.quality.unwrap_or(default_quality),
        format,
        blur_radius: None,
        mobile_optimized: false,
    })
}

fn parse_format(raw: &str) -> Result<OutputFormat, ApiError> {
    OutputFormat::parse(raw).ok_or_else(|| ApiError::UnsupportedFormat {
        given: raw.to_string(),
        supported: OutputFormat::SUPPORTED.join(", "),
    })
}

fn callbacks_from(raw: Option<String>) -> Result<Vec<CallbackSink>, ApiError> {
    match raw {
        Some(raw) => parse_callbacks(&raw).map_err(|err| ApiError::BadCallbacks(err.to_string())),
        None => Ok(Vec::new()),
    }
}

async fn optimize(
    State(state): State<AppState>,
    Query(query): Query<OptimizeQuery>,
    mut multipart: Multipart,
) -> Result<Json<OptimizeAccepted>, ApiError> {
    let config = state.service.config().clone();
    let options = options_from(&query, config.default_quality)?;
    let parsed = upload::collect(
        &mut multipart,
        &config.upload_dir,
        &["image", "file"],
        "image",
        1,
        config.max_file_size,
    )
    .await?;
    let callbacks = callbacks_from(parsed.callbacks_raw)?;
    let file = parsed
        .files
        .into_iter()
        .next()
        .ok_or(ApiError::MissingFile("image"))?;
    let accepted = state.service.accept_single(file, callbacks, options).await?;
    Ok(Json(accepted))
}

async fn batch_optimize(
    State(state): State<AppState>,
    Query(query): Query<OptimizeQuery>,
    mut multipart: Multipart,
) -> Result<Json<BatchAccepted>, ApiError> {
    let config = state.service.config().clone();
    let options = options_from(&query, config.default_quality)?;
    let parsed = upload::collect(
        &mut multipart,
        &config.upload_dir,
        &["files", "file", "images"],
        "files",
        config.batch_max_files,
        config.batch_max_file_size,
    )
    .await?;
    let callbacks = callbacks_from(parsed.callbacks_raw)?;
    let accepted = state
        .service
        .accept_batch(parsed.files, callbacks, options)
        .await?;
    Ok(Json(accepted))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlurQuery {
    width: Option<u32>,
    height: Option<u32>,
    blur_radius: Option<u32>,
    quality: Option<u8>,
    mobile_optimized: Option<bool>,
}

async fn blur_placeholder(
    State(state): State<AppState>,
    Query(query): Query<BlurQuery>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    if let Some(width) = query.width {
        if !(10..=256).contains(&width) {
            return Err(ApiError::InvalidParameter(
                "width must be between 10 and 256".into(),
            ));
        }
    }
    if let Some(radius) = query.blur_radius {
        if !(1..=50).contains(&radius) {
            return Err(ApiError::InvalidParameter(
                "blurRadius must be between 1 and 50".into(),
            ));
        }
    }
    if let Some(quality) = query.quality {
        if !(1..=50).contains(&quality) {
            return Err(ApiError::InvalidParameter(
                "quality must be between 1 and 50".into(),
            ));
        }
    }

    let limit = state.service.config().max_file_size;
    let (bytes, _name) =
        upload::read_inline(&mut multipart, &["image", "file"], "image", limit).await?;
    let original_size = bytes.len();
    let options = BlurPlaceholderOptions {
        width: query.width,
        height: query.height,
        blur_radius: query.blur_radius.unwrap_or(15),
        quality: query.quality.unwrap_or(15),
        mobile_optimized: query.mobile_optimized.unwrap_or(true),
    };
    let placeholder = state.service.blur_placeholder(bytes, options).await?;
    Ok(Json(json!({
        "message": "Blur placeholder generated",
        "mimeType": "image/jpeg",
        "data": BASE64.encode(&placeholder),
        "originalSize": original_size,
        "placeholderSize": placeholder.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct ConvertQuery {
    format: String,
}

async fn convert(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let format = parse_format(&query.format)?;
    let limit = state.service.config().max_file_size;
    let (bytes, _name) =
        upload::read_inline(&mut multipart, &["image", "file"], "image", limit).await?;
    let converted = state.service.convert(bytes, format).await?;
    Ok(bytes_response(converted))
}

#[derive(Debug, Deserialize)]
struct ThumbnailQuery {
    width: Option<u32>,
    height: Option<u32>,
}

async fn thumbnail(
    State(state): State<AppState>,
    Query(query): Query<ThumbnailQuery>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let width = query
        .width
        .ok_or_else(|| ApiError::InvalidParameter("width is required".into()))?;
    if !(1..=8000).contains(&width) {
        return Err(ApiError::InvalidParameter(
            "width must be between 1 and 8000".into(),
        ));
    }
    if let Some(height) = query.height {
        if !(1..=8000).contains(&height) {
            return Err(ApiError::InvalidParameter(
                "height must be between 1 and 8000".into(),
            ));
        }
    }
    let limit = state.service.config().max_file_size;
    let (bytes, _name) =
        upload::read_inline(&mut multipart, &["image", "file"], "image", limit).await?;
    let thumb = state.service.thumbnail(bytes, width, query.height).await?;
    Ok(bytes_response(thumb))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatermarkQuery {
    text: String,
    font_size: Option<f32>,
    font_weight: Option<String>,
    color: Option<String>,
    opacity: Option<f32>,
}

async fn watermark(
    State(state): State<AppState>,
    Query(query): Query<WatermarkQuery>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let limit = state.service.config().max_file_size;
    let (bytes, _name) =
        upload::read_inline(&mut multipart, &["image", "file"], "image", limit).await?;
    let options = WatermarkOptions {
        font_size: query.font_size,
        font_weight: query.font_weight,
        color: query.color,
        opacity: query.opacity,
    };
    let marked = state.service.watermark(bytes, query.text, options).await?;
    Ok(bytes_response(marked))
}

async fn subscribe(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let rx = state
        .service
        .broker()
        .subscribe(&id)
        .await
        .map_err(|err| ApiError::InvalidParameter(err.to_string()))?;
    let stream = BroadcastStream::new(rx).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(SseEvent::default().event(event.kind()).data(data)))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !valid_download_name(&filename) {
        return Err(ApiError::InvalidParameter("invalid filename".into()));
    }
    let path = state.service.config().storage_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = filename
                .rsplit_once('.')
                .map(|(_, ext)| mime_for_extension(ext))
                .unwrap_or("application/octet-stream");
            Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
        }
        Err(_) => Err(ApiError::NotFound(filename)),
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().timestamp(),
        "service": "imgpress",
    }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "pool": state.service.pool_stats(),
        "contexts": state.service.contexts().len().await,
        "sseChannels": state.service.broker().channel_count(),
    }))
}

fn bytes_response(bytes: Vec<u8>) -> Response {
    let mime = image::guess_format(&bytes)
        .ok()
        .map(|f| match f {
            image::ImageFormat::Jpeg => "image/jpeg",
            image::ImageFormat::Png => "image/png",
            image::ImageFormat::WebP => "image/webp",
            image::ImageFormat::Gif => "image/gif",
            image::ImageFormat::Tiff => "image/tiff",
            image::ImageFormat::Avif => "image/avif",
            _ => "application/octet-stream",
        })
        .unwrap_or("application/octet-stream");
    ([(header::CONTENT_TYPE, mime)], bytes).into_response()
}

/// Legacy download names: `stem.ext` with a word-character stem and a short
/// alphabetic extension.
fn valid_download_name(name: &str) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        && (2..=4).contains(&ext.len())
        && ext.chars().all(|c| c.is_ascii_alphabetic())
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobSink;
    use crate::config::Config;
    use crate::events::EventBroker;
    use crate::transform::ImageTransformer;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use image::codecs::png::PngEncoder;
    use image::{ColorType, ImageEncoder, Rgba, RgbaImage};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "ImgPressTestBoundary";

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([90, 120, 200, 255]));
        let mut buf = Vec::new();
        PngEncoder::new(&mut buf)
            .write_image(img.as_raw(), width, height, ColorType::Rgba8)
            .unwrap();
        buf
    }

    fn multipart_file(field: &str, filename: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
                 filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
        body
    }

    fn finish_multipart(mut body: Vec<u8>) -> Vec<u8> {
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn test_app(dir: &std::path::Path) -> Router {
        let config = Config {
            upload_dir: dir.join("uploads"),
            storage_dir: dir.join("storage"),
            download_base_url: "https://cdn.example.com".to_string(),
            ..Default::default()
        };
        let storage = config.storage_dir.clone();
        let broker = Arc::new(EventBroker::new(
            Duration::from_secs(60),
            Duration::from_millis(50),
        ));
        let service = OptimizationService::new(
            config,
            Arc::new(ImageTransformer::new()),
            Arc::new(FsBlobSink::new(storage).unwrap()),
            broker,
        );
        router(AppState { service })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn optimize_returns_minted_key_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let body = finish_multipart(multipart_file(
            "image",
            "photo.png",
            "image/png",
            &png_bytes(64, 64),
        ));
        let response = app
            .oneshot(multipart_request(
                "/image-optimization/optimize?width=32&quality=80&format=jpeg",
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let data = json["data"].as_str().unwrap();
        assert!(data.starts_with("optimized/"));
        assert!(data.ends_with(".jpeg"));
        assert_eq!(json["callbacksScheduled"], 0);
        assert_eq!(
            json["downloadUrl"],
            format!("https://cdn.example.com/{data}")
        );
        assert_eq!(json["optimizationId"].as_str().unwrap().len(), 36);
    }

    #[tokio::test]
    async fn unsupported_format_is_a_400_listing_formats() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let body = finish_multipart(multipart_file(
            "image",
            "photo.png",
            "image/png",
            &png_bytes(16, 16),
        ));
        let response = app
            .oneshot(multipart_request(
                "/image-optimization/optimize?format=bmp",
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        let message = json["message"].as_str().unwrap();
        assert!(message.contains("webp"), "message should list formats");
    }

    #[tokio::test]
    async fn missing_file_is_a_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let body = finish_multipart(Vec::new());
        let response = app
            .oneshot(multipart_request("/image-optimization/optimize", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mangled_callbacks_object_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let mut body = multipart_file("image", "photo.png", "image/png", &png_bytes(16, 16));
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                 name=\"callbacks\"\r\n\r\n{{\"url\":\"http://x/y\"}}\r\n"
            )
            .as_bytes(),
        );
        let response = app
            .oneshot(multipart_request(
                "/image-optimization/optimize",
                finish_multipart(body),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["callbacksScheduled"], 1);
    }

    #[tokio::test]
    async fn batch_reports_count_and_ordered_results() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let mut body = Vec::new();
        for name in ["one.png", "two.png", "three.png"] {
            body.extend_from_slice(&multipart_file("files", name, "image/png", &png_bytes(16, 16)));
        }
        let response = app
            .oneshot(multipart_request(
                "/image-optimization/batch-optimize?format=webp",
                finish_multipart(body),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["count"], 3);
        let results = json["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["file"], "one.png");
        assert_eq!(results[2]["file"], "three.png");
    }

    #[tokio::test]
    async fn blur_placeholder_returns_base64_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let body = finish_multipart(multipart_file(
            "image",
            "photo.png",
            "image/png",
            &png_bytes(200, 100),
        ));
        let response = app
            .oneshot(multipart_request(
                "/image-optimization/blur-placeholder",
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let encoded = json["data"].as_str().unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        let img = image::load_from_memory(&decoded).unwrap();
        assert!(img.width() <= 40);
        assert!(json["placeholderSize"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn blur_placeholder_rejects_out_of_range_width() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let body = finish_multipart(multipart_file(
            "image",
            "photo.png",
            "image/png",
            &png_bytes(32, 32),
        ));
        let response = app
            .oneshot(multipart_request(
                "/image-optimization/blur-placeholder?width=300",
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn convert_responds_with_transformed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let body = finish_multipart(multipart_file(
            "image",
            "photo.png",
            "image/png",
            &png_bytes(32, 32),
        ));
        let response = app
            .oneshot(multipart_request(
                "/image-optimization/convert?format=webp",
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/webp");
    }

    #[tokio::test]
    async fn download_rejects_odd_names_and_404s_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/image-optimization/download/no-such-file.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/image-optimization/download/bad.name.exe.sh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[test]
    fn download_name_validation() {
        assert!(valid_download_name("abc_123-x.jpeg"));
        assert!(valid_download_name("a.png"));
        assert!(!valid_download_name("noext"));
        assert!(!valid_download_name("dots..png"));
        assert!(!valid_download_name("slash/name.png"));
        assert!(!valid_download_name("name.toolong5"));
        assert!(!valid_download_name("name.j2"));
    }
}
