use serde::{Deserialize, Serialize};

/// Response of `POST /upload`. The client forwards these fields in a
/// follow-up `send-file` / `send-private-file` socket command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub filename: String,
    pub originalname: String,
    pub mimetype: String,
    pub size: u64,
    pub url: String,
}
