use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::AppState;
use crate::error::ApiError;
use crate::upload::COMPRESSED_PREFIX;

#[derive(Debug, Deserialize)]
pub struct ServeQuery {
    /// Any value forces the stored original instead of the compressed
    /// image derivative.
    pub original: Option<String>,
}

/// GET /uploads/{filename}. Serves a stored file with Range support.
///
/// For images the compressed derivative is substituted on the fly when one
/// exists, unless `?original=1` is passed.
pub async fn serve_upload(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<ServeQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    if !is_safe_filename(&filename) {
        return Err(ApiError::BadFilename);
    }

    let (path, mimetype) = resolve_file(&state, &filename, query.original.is_some()).await;

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::NotFound),
        Err(e) => return Err(e.into()),
    };
    let file_size = metadata.len();

    let range = parse_range(&headers);
    let (start, end) = resolve_span(range, file_size)?;
    let content_length = if file_size == 0 { 0 } else { end - start + 1 };

    let body = Body::from_stream(stream_file(path, start, content_length));

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, mimetype.parse().unwrap());
    response_headers.insert(
        header::CONTENT_LENGTH,
        content_length.to_string().parse().unwrap(),
    );
    response_headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());

    if range.is_some() {
        response_headers.insert(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, file_size).parse().unwrap(),
        );
        Ok((StatusCode::PARTIAL_CONTENT, response_headers, body))
    } else {
        Ok((StatusCode::OK, response_headers, body))
    }
}

/// Pick the on-disk file to serve and its content type, substituting the
/// compressed derivative for images when present.
async fn resolve_file(
    state: &AppState,
    filename: &str,
    want_original: bool,
) -> (PathBuf, &'static str) {
    if is_image_ext(filename) && !want_original && !filename.starts_with(COMPRESSED_PREFIX) {
        let variant = state
            .upload_dir
            .join(format!("{}{}", COMPRESSED_PREFIX, filename));
        if tokio::fs::metadata(&variant).await.is_ok() {
            // Derivatives are always JPEG regardless of the source format
            return (variant, "image/jpeg");
        }
    }
    (state.upload_dir.join(filename), guess_mime(filename))
}

fn stream_file(
    path: PathBuf,
    start: u64,
    content_length: u64,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> {
    async_stream::stream! {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        if start > 0 {
            if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
                yield Err(e);
                return;
            }
        }

        let mut remaining = content_length;
        let mut buf = vec![0u8; 64 * 1024]; // 64 KB read buffer
        while remaining > 0 {
            let to_read = (remaining as usize).min(buf.len());
            match file.read(&mut buf[..to_read]).await {
                Ok(0) => break,
                Ok(n) => {
                    remaining -= n as u64;
                    yield Ok(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    }
}

/// Validate a parsed range against the file size, yielding the inclusive
/// byte span to serve. Ranges starting past the end or ending before their
/// start are unsatisfiable.
fn resolve_span(
    range: Option<(u64, Option<u64>)>,
    file_size: u64,
) -> Result<(u64, u64), ApiError> {
    match range {
        Some((start, end)) => {
            if start >= file_size {
                return Err(ApiError::BadRange);
            }
            let end = end.unwrap_or(file_size - 1).min(file_size - 1);
            if end < start {
                return Err(ApiError::BadRange);
            }
            Ok((start, end))
        }
        None => Ok((0, file_size.saturating_sub(1))),
    }
}

/// Parse `Range: bytes=START-[END]`. Multi-range requests are not supported;
/// only the first range is honored.
fn parse_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let range = headers.get(header::RANGE)?.to_str().ok()?;
    let range = range.strip_prefix("bytes=")?;
    let range = range.split(',').next()?;
    let mut parts = range.splitn(2, '-');
    let start: u64 = parts.next()?.trim().parse().ok()?;
    let end = parts.next().and_then(|s| {
        let s = s.trim();
        if s.is_empty() { None } else { s.parse::<u64>().ok() }
    });
    Some((start, end))
}

fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains('/')
        && !filename.contains('\\')
        && !filename.contains("..")
}

fn is_image_ext(filename: &str) -> bool {
    matches!(
        extension(filename).as_deref(),
        Some("jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp")
    )
}

fn guess_mime(filename: &str) -> &'static str {
    match extension(filename).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn extension(filename: &str) -> Option<String> {
    filename.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_range(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, value.parse().unwrap());
        headers
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range(&HeaderMap::new()), None);
        assert_eq!(
            parse_range(&headers_with_range("bytes=100-")),
            Some((100, None))
        );
        assert_eq!(
            parse_range(&headers_with_range("bytes=0-499")),
            Some((0, Some(499)))
        );
        assert_eq!(
            parse_range(&headers_with_range("bytes=5-9,20-29")),
            Some((5, Some(9)))
        );
        assert_eq!(parse_range(&headers_with_range("items=0-1")), None);
    }

    #[test]
    fn span_resolution_rejects_unsatisfiable_ranges() {
        // No header serves the whole file
        assert!(matches!(resolve_span(None, 1000), Ok((0, 999))));
        assert!(matches!(resolve_span(None, 0), Ok((0, 0))));

        // Open-ended and clamped ranges
        assert!(matches!(resolve_span(Some((100, None)), 1000), Ok((100, 999))));
        assert!(matches!(resolve_span(Some((0, Some(5000))), 1000), Ok((0, 999))));

        // Start past the end
        assert!(matches!(
            resolve_span(Some((1000, None)), 1000),
            Err(ApiError::BadRange)
        ));
        // Inverted range must not reach the length arithmetic
        assert!(matches!(
            resolve_span(Some((500, Some(100))), 1000),
            Err(ApiError::BadRange)
        ));
    }

    #[test]
    fn filename_safety() {
        assert!(is_safe_filename("1700000000-cat.png"));
        assert!(!is_safe_filename(""));
        assert!(!is_safe_filename("../secret"));
        assert!(!is_safe_filename("a/b.png"));
        assert!(!is_safe_filename("a\\b.png"));
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(guess_mime("photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime("clip.webm"), "video/webm");
        assert_eq!(guess_mime("notes.txt"), "text/plain; charset=utf-8");
        assert_eq!(guess_mime("archive.zip"), "application/octet-stream");
        assert_eq!(guess_mime("no-extension"), "application/octet-stream");
    }

    #[test]
    fn image_extension_detection() {
        assert!(is_image_ext("cat.png"));
        assert!(is_image_ext("cat.JPeG"));
        assert!(!is_image_ext("cat.mp4"));
        assert!(!is_image_ext("cat"));
    }
}
