use crate::errors::{AppError, Result};
use std::path::Path;
use url::Url;

const DEFAULT_DOMAINS: [&str; 4] = ["youtube.com", "youtu.be", "youtube-nocookie.com", "music.youtube.com"];

/// Checks user input before it reaches the download manager.
pub struct InputValidator {
    supported_domains: Vec<String>,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl InputValidator {
    pub fn new() -> Self {
        Self {
            supported_domains: DEFAULT_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn with_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported_domains: domains.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate_url(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::Validation("URL cannot be empty".to_string()));
        }

        let parsed_url = Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

        if !matches!(parsed_url.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "Unsupported scheme: {}",
                parsed_url.scheme()
            )));
        }

        let host = parsed_url.host_str()
            .ok_or_else(|| AppError::Validation("URL must have a host".to_string()))?;

        let is_supported = self.supported_domains.iter().any(|domain| {
            host == domain.as_str() || host.ends_with(&format!(".{}", domain))
        });

        if !is_supported {
            return Err(AppError::Validation(format!(
                "Unsupported platform: {}. Supported: {}",
                host,
                self.supported_domains.join(", ")
            )));
        }

        Ok(())
    }

    pub fn validate_download_path(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(AppError::Validation("Download path cannot be empty".to_string()));
        }

        if path.to_string_lossy().contains('\0') {
            return Err(AppError::Validation("Null bytes not allowed in download path".to_string()));
        }

        // Missing directories are created later; an existing file is not usable.
        if path.exists() {
            if !path.is_dir() {
                return Err(AppError::Validation(format!(
                    "Download path is not a directory: {}",
                    path.display()
                )));
            }

            let readonly = path.metadata()?.permissions().readonly();
            if readonly {
                return Err(AppError::Validation("Download path is read-only".to_string()));
            }
        }

        Ok(())
    }
}
