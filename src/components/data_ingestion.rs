//! Dataset download and extraction.

use futures::StreamExt;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::config::DataIngestionConfig;
use crate::error::IngestionError;

/// Human-readable file size, rounded to whole kilobytes
pub fn get_size(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::metadata(path)?.len();
    Ok(format!("~ {} KB", (bytes as f64 / 1024.0).round() as u64))
}

/// Rewrite a Google Drive share link (`.../file/d/<id>/view`) into its
/// direct-download form; other URLs are returned unchanged.
pub fn resolve_download_url(source_url: &str) -> String {
    let Ok(url) = url::Url::parse(source_url) else {
        return source_url.to_string();
    };
    if url.host_str() != Some("drive.google.com") {
        return source_url.to_string();
    }

    let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
    match segments.as_slice() {
        ["file", "d", id, ..] if !id.is_empty() => {
            format!("https://drive.google.com/uc?export=download&id={id}")
        }
        _ => source_url.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detect by extension, falling back to the magic bytes
    pub fn detect(path: &Path) -> Result<Self, IngestionError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            return Ok(ArchiveFormat::Zip);
        }
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Ok(ArchiveFormat::TarGz);
        }

        let mut magic = [0u8; 4];
        let read = File::open(path)?.read(&mut magic)?;
        match &magic[..read] {
            [0x50, 0x4b, 0x03, 0x04] => Ok(ArchiveFormat::Zip),
            [0x1f, 0x8b, ..] => Ok(ArchiveFormat::TarGz),
            _ => Err(IngestionError::UnsupportedArchive(path.to_path_buf())),
        }
    }
}

/// First component of an archive entry path, if it is a plain name
fn top_level(entry: &Path) -> Option<PathBuf> {
    match entry.components().next()? {
        Component::Normal(name) => Some(PathBuf::from(name)),
        _ => None,
    }
}

fn zip_error(path: &Path, source: zip::result::ZipError) -> IngestionError {
    match source {
        zip::result::ZipError::Io(e) => IngestionError::Io(e),
        source => IngestionError::Archive {
            path: path.to_path_buf(),
            source,
        },
    }
}

pub struct DataIngestion {
    config: DataIngestionConfig,
    client: reqwest::Client,
}

impl DataIngestion {
    pub fn new(config: DataIngestionConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: DataIngestionConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &DataIngestionConfig {
        &self.config
    }

    /// Download the dataset archive to `local_data_file`.
    ///
    /// The body is streamed into a `.part` file that replaces the target only
    /// once complete. An HTML page (such as the Google Drive virus-scan
    /// interstitial) is rejected instead of being saved as the archive.
    pub async fn download_file(&self) -> Result<PathBuf, IngestionError> {
        let target = &self.config.local_data_file;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = resolve_download_url(&self.config.source_url);
        tracing::info!("Downloading data from {} into file {}", url, target.display());

        let download_err = |source| IngestionError::Download {
            url: url.clone(),
            source,
        };
        let response = self.client.get(&url).send().await.map_err(download_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestionError::HttpStatus {
                url: url.clone(),
                status: status.as_u16(),
            });
        }

        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| value.starts_with("text/html"))
        {
            return Err(IngestionError::HtmlResponse {
                url: url.clone(),
                content_type: content_type.to_string(),
            });
        }

        let partial = target.with_extension("part");
        if let Err(err) = Self::stream_to(response, &partial, &url).await {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::warn!("Could not remove {}: {}", partial.display(), cleanup);
            }
            return Err(err);
        }
        tokio::fs::rename(&partial, target).await?;

        tracing::info!(
            "Downloaded data successfully: {} (size: {})",
            target.display(),
            get_size(target)?
        );
        Ok(target.clone())
    }

    async fn stream_to(response: reqwest::Response, path: &Path, url: &str) -> Result<(), IngestionError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| IngestionError::Download {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Extract the archive into `unzip_dir`.
    ///
    /// Top-level entries the archive is about to recreate are removed first,
    /// so a rerun replaces the previous extraction instead of merging into it.
    pub fn extract_zip_file(&self) -> Result<PathBuf, IngestionError> {
        let archive_path = &self.config.local_data_file;
        let unzip_dir = &self.config.unzip_dir;
        std::fs::create_dir_all(unzip_dir)?;

        let format = ArchiveFormat::detect(archive_path)?;
        tracing::info!("Extracting {:?} archive to: {}", format, unzip_dir.display());

        let roots = match format {
            ArchiveFormat::Zip => self.zip_roots()?,
            ArchiveFormat::TarGz => self.tar_roots()?,
        };
        self.clear_previous(&roots)?;

        match format {
            ArchiveFormat::Zip => {
                let mut archive = zip::ZipArchive::new(File::open(archive_path)?)
                    .map_err(|e| zip_error(archive_path, e))?;
                archive
                    .extract(unzip_dir)
                    .map_err(|e| zip_error(archive_path, e))?;
            }
            ArchiveFormat::TarGz => {
                let decoder = flate2::read::GzDecoder::new(File::open(archive_path)?);
                tar::Archive::new(decoder)
                    .unpack(unzip_dir)
                    .map_err(|source| IngestionError::TarArchive {
                        path: archive_path.clone(),
                        source,
                    })?;
            }
        }

        tracing::info!("Extraction completed successfully");
        Ok(unzip_dir.clone())
    }

    fn zip_roots(&self) -> Result<Vec<PathBuf>, IngestionError> {
        let path = &self.config.local_data_file;
        let mut archive =
            zip::ZipArchive::new(File::open(path)?).map_err(|e| zip_error(path, e))?;

        let mut roots = Vec::new();
        for i in 0..archive.len() {
            let entry = archive.by_index(i).map_err(|e| zip_error(path, e))?;
            if let Some(root) = entry.enclosed_name().as_deref().and_then(top_level) {
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }
        Ok(roots)
    }

    fn tar_roots(&self) -> Result<Vec<PathBuf>, IngestionError> {
        let path = &self.config.local_data_file;
        let tar_err = |source| IngestionError::TarArchive {
            path: path.clone(),
            source,
        };
        let decoder = flate2::read::GzDecoder::new(File::open(path)?);
        let mut archive = tar::Archive::new(decoder);

        let mut roots = Vec::new();
        for entry in archive.entries().map_err(tar_err)? {
            let entry = entry.map_err(tar_err)?;
            let entry_path = entry.path().map_err(tar_err)?;
            if let Some(root) = top_level(&entry_path) {
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }
        Ok(roots)
    }

    fn clear_previous(&self, roots: &[PathBuf]) -> Result<(), IngestionError> {
        let archive = std::fs::canonicalize(&self.config.local_data_file)?;
        for root in roots {
            let existing = self.config.unzip_dir.join(root);
            if !existing.exists() {
                continue;
            }
            let canonical = std::fs::canonicalize(&existing)?;
            if archive.starts_with(&canonical) {
                tracing::warn!(
                    "Not removing {}: it contains the archive being extracted",
                    existing.display()
                );
                continue;
            }
            if canonical.is_dir() {
                std::fs::remove_dir_all(&existing)?;
            } else {
                std::fs::remove_file(&existing)?;
            }
            tracing::info!("Removed previous extraction: {}", existing.display());
        }
        Ok(())
    }
}
