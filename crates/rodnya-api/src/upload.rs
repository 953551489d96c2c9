use axum::Json;
use axum::extract::{Multipart, State};
use chrono::Utc;
use tracing::{info, warn};

use rodnya_types::api::UploadResponse;

use crate::AppState;
use crate::error::ApiError;

/// Upload cap, enforced via `DefaultBodyLimit` on the route.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Filename prefix of the compressed image derivative stored next to the
/// original.
pub const COMPRESSED_PREFIX: &str = "compressed-";

const DERIVATIVE_MAX_DIM: u32 = 1280;
const DERIVATIVE_JPEG_QUALITY: u8 = 70;

/// Decode cap per axis; uploads claiming larger dimensions are not decoded
/// at all, so a crafted header cannot force a huge allocation.
const MAX_SOURCE_DIM: u32 = 8192;

/// POST /upload. Stores a multipart `file` field under the upload dir as
/// `{unix_millis}-{original name}`. Decodable images additionally get a
/// bounded JPEG derivative written alongside.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut uploaded = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let originalname = field
            .file_name()
            .map(sanitize_filename)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "file".to_string());
        let mimetype = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let data = field.bytes().await?;
        uploaded = Some((originalname, mimetype, data));
        break;
    }

    let (originalname, mimetype, data) = uploaded.ok_or(ApiError::MissingFile)?;

    let filename = format!("{}-{}", Utc::now().timestamp_millis(), originalname);
    let path = state.upload_dir.join(&filename);
    tokio::fs::write(&path, &data).await?;
    info!("Stored upload {} ({} bytes, {})", filename, data.len(), mimetype);

    if mimetype.starts_with("image/") {
        let variant_path = state
            .upload_dir
            .join(format!("{}{}", COMPRESSED_PREFIX, filename));
        let bytes = data.clone();
        // Image decoding and re-encoding is CPU-bound
        let derivative = tokio::task::spawn_blocking(move || build_derivative(&bytes))
            .await
            .map_err(|e| anyhow::anyhow!("derivative task panicked: {}", e))?;
        match derivative {
            Some(jpeg) => {
                tokio::fs::write(&variant_path, jpeg).await?;
                info!("Stored compressed derivative for {}", filename);
            }
            None => warn!("Could not decode {} as an image, no derivative", filename),
        }
    }

    Ok(Json(UploadResponse {
        url: format!("/uploads/{}", filename),
        size: data.len() as u64,
        filename,
        originalname,
        mimetype,
    }))
}

/// Re-encode an image as a bounded-size JPEG. Returns `None` when the input
/// does not decode or exceeds the decode limits.
fn build_derivative(data: &[u8]) -> Option<Vec<u8>> {
    let mut reader = image::ImageReader::new(std::io::Cursor::new(data))
        .with_guessed_format()
        .ok()?;
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(MAX_SOURCE_DIM);
    limits.max_image_height = Some(MAX_SOURCE_DIM);
    reader.limits(limits);
    let img = reader.decode().ok()?;
    let img = if img.width() > DERIVATIVE_MAX_DIM || img.height() > DERIVATIVE_MAX_DIM {
        img.thumbnail(DERIVATIVE_MAX_DIM, DERIVATIVE_MAX_DIM)
    } else {
        img
    };

    // JPEG has no alpha channel
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, DERIVATIVE_JPEG_QUALITY);
    rgb.write_with_encoder(encoder).ok()?;
    Some(out)
}

/// Keep only the final path component of a client-supplied filename and
/// strip control characters and leading dots.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    cleaned.trim_start_matches('.').to_string()
}
