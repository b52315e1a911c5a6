use crate::manager::StreamManager;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

pub async fn serve_hls_file(
    State(manager): State<Arc<StreamManager>>,
    Path((stream_id, file_name)): Path<(String, String)>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. Only registered streams are served
    let Some(record) = manager.get_stream(&stream_id) else {
        return Err((StatusCode::NOT_FOUND, "Unknown stream".to_string()));
    };

    // Reject anything that could escape the stream's output directory
    if file_name.contains("..") || file_name.contains('/') || file_name.contains('\\') {
        return Err((StatusCode::BAD_REQUEST, "Invalid file name".to_string()));
    }

    // 2. Construct the file path inside the stream's output directory
    let file_path = record.output_dir.join(&file_name);

    // 3. Smartly wait for the .m3u8 file to be generated (only applicable for .m3u8)
    if file_name.ends_with(".m3u8") {
        for i in 0..15 {
            if file_path.exists() {
                break;
            }
            if i == 0 {
                info!("Waiting for HLS generation: {:?}", file_path);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    // 4. Open the file for reading
    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // 5. Determine the Content-Type based on the file extension
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
