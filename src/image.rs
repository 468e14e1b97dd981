//! Staging of the machine's boot image.
//!
//! The configured image source is cached into the machine directory before
//! first boot: HTTP(S) sources are downloaded, anything else is treated as a
//! local path and copied. A previously staged image is reused as-is.

use camino::Utf8Path;
use thiserror::Error;

/// Errors raised while staging the boot image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// Raised when the image download fails.
    #[error("downloading boot image from {url}: {message}")]
    Download {
        /// Source URL.
        url: String,
        /// Underlying failure.
        message: String,
    },
    /// Raised when copying a local image fails.
    #[error("copying boot image from {origin}: {message}")]
    Copy {
        /// Source path.
        origin: String,
        /// Underlying failure.
        message: String,
    },
    /// Raised when the staged image cannot be written.
    #[error("writing boot image to {path}: {message}")]
    Write {
        /// Destination path.
        path: String,
        /// Underlying failure.
        message: String,
    },
}

/// Caches the boot image from `source` at `dest`, skipping the transfer when
/// `dest` already exists.
///
/// # Errors
///
/// Returns [`ImageError`] when the download, copy, or write fails.
pub async fn stage(source: &str, dest: &Utf8Path) -> Result<(), ImageError> {
    if dest.exists() {
        tracing::debug!(path = %dest, "boot image already staged");
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| ImageError::Write {
                path: dest.to_string(),
                message: err.to_string(),
            })?;
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        download(source, dest).await
    } else {
        copy_local(source, dest).await
    }
}

async fn download(url: &str, dest: &Utf8Path) -> Result<(), ImageError> {
    tracing::info!(%url, path = %dest, "downloading boot image");
    let fail = |message: String| ImageError::Download {
        url: url.to_owned(),
        message,
    };

    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|err| fail(err.to_string()))?;
    let body = response.bytes().await.map_err(|err| fail(err.to_string()))?;

    tokio::fs::write(dest, &body)
        .await
        .map_err(|err| ImageError::Write {
            path: dest.to_string(),
            message: err.to_string(),
        })
}

async fn copy_local(source: &str, dest: &Utf8Path) -> Result<(), ImageError> {
    tracing::debug!(%source, path = %dest, "copying boot image");
    tokio::fs::copy(source, dest)
        .await
        .map(|_| ())
        .map_err(|err| ImageError::Copy {
            origin: source.to_owned(),
            message: err.to_string(),
        })
}
