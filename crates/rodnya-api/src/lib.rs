pub mod error;
pub mod files;
pub mod upload;

use std::path::PathBuf;

/// Shared state for the HTTP file routes.
#[derive(Clone)]
pub struct AppState {
    pub upload_dir: PathBuf,
}
