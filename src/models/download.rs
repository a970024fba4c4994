//! HTTP download of model files with progress reporting and SHA-1 verification.

use crate::error::{ModelhostError, Result};
use futures_util::StreamExt;
use sha1::{Digest, Sha1};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn download_error(message: String) -> ModelhostError {
    ModelhostError::Download { message }
}

/// Partial file written while a download is in progress.
fn partial_path(output_path: &Path) -> PathBuf {
    let mut name = output_path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    output_path.with_file_name(name)
}

/// Fetch `url` into `output_path`, verifying `sha1` when given.
///
/// `on_progress` receives the downloaded fraction in [0, 1] whenever the
/// server announced a content length. The file only appears at
/// `output_path` once the download completed and verified.
pub async fn download_to_path(
    url: &str,
    sha1: Option<&str>,
    output_path: &Path,
    on_progress: &mut (dyn FnMut(f32) + Send),
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| download_error(format!("Failed to create models directory: {e}")))?;
    }

    info!(url, path = %output_path.display(), "downloading model");

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| download_error(format!("Failed to start download: {e}")))?;

    if !response.status().is_success() {
        return Err(download_error(format!(
            "Download failed with status: {}",
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(0);
    let part_path = partial_path(output_path);

    let mut hasher = Sha1::new();
    let mut stream = response.bytes_stream();
    let mut file = fs::File::create(&part_path)
        .map_err(|e| download_error(format!("Failed to create output file: {e}")))?;
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| download_error(format!("Failed to read download chunk: {e}")))?;

        file.write_all(&chunk)
            .map_err(|e| download_error(format!("Failed to write to file: {e}")))?;

        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        if total_size > 0 {
            on_progress(downloaded as f32 / total_size as f32);
        }
    }
    drop(file);

    if let Some(expected) = sha1.filter(|s| !s.is_empty()) {
        let calculated = format!("{:x}", hasher.finalize());
        if !calculated.eq_ignore_ascii_case(expected) {
            if let Err(e) = fs::remove_file(&part_path) {
                warn!(error = %e, "failed to remove corrupted download");
            }
            return Err(download_error(format!(
                "SHA-1 checksum mismatch. Expected: {expected}, got: {calculated}"
            )));
        }
    }

    fs::rename(&part_path, output_path)
        .map_err(|e| download_error(format!("Failed to move download into place: {e}")))?;
    on_progress(1.0);
    info!(path = %output_path.display(), "model installed");

    Ok(())
}
