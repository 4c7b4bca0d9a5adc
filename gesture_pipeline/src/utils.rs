//! Utility functions
//!
use std::{
    fs::{self, File},
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use reqwest::Client;

use crate::error::ModelLoadError;

/// Download a file from a URL to a given filepath.
///
/// The content is written next to `filepath` first and moved into place once complete, so an
/// interrupted download never leaves a truncated file behind.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;

    let partial = filepath.with_extension("part");
    let mut file = File::create(&partial)
        .with_context(|| format!("failed to create {}", partial.display()))?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;
    fs::rename(&partial, filepath)?;

    Ok(())
}

fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Turn a configured model location into a local file.
///
/// URLs are downloaded once into the user's cache directory and reused afterwards.
pub async fn resolve_model_location(location: &str) -> Result<PathBuf, ModelLoadError> {
    if !is_url(location) {
        let path = PathBuf::from(location);
        if !path.is_file() {
            return Err(ModelLoadError::NotFound(path));
        }
        return Ok(path);
    }

    let cache_dir = dirs::cache_dir()
        .ok_or(ModelLoadError::NoCacheDir)?
        .join("gesture_cam");
    let filepath = cache_dir.join(cached_file_name(location));
    if filepath.is_file() {
        log::info!("Using cached model {}", filepath.display());
        return Ok(filepath);
    }

    fs::create_dir_all(&cache_dir)?;
    log::info!("Downloading model from {location}");
    download_file(&Client::new(), location, &filepath)
        .await
        .map_err(|err| ModelLoadError::Fetch {
            url: location.to_owned(),
            reason: format!("{err:#}"),
        })?;

    Ok(filepath)
}

/// Last path segment of the URL without query or fragment.
fn cached_file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && !name.contains(':') => name,
        _ => "model.onnx",
    }
}
