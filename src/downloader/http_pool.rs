use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, ClientBuilder, Proxy};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::{AppConfig, NetworkConfig};
use crate::downloader::{Chunk, ResolvedStream};
use crate::errors::{DownloadError, Result};

/// Shared HTTP client used to open media streams.
pub struct HttpPool {
    client: Client,
    max_connections: usize,
    connect_timeout: Duration,
    user_agent: String,
}

impl HttpPool {
    pub fn new(max_connections: usize, connect_timeout_secs: u64, user_agent: &str) -> Result<Self> {
        let connect_timeout = Duration::from_secs(connect_timeout_secs);
        let client = Self::builder(max_connections, connect_timeout, user_agent).build()?;

        Ok(Self {
            client,
            max_connections,
            connect_timeout,
            user_agent: user_agent.to_string(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let NetworkConfig {
            max_connections,
            connect_timeout_secs,
            user_agent,
            ..
        } = &config.network;

        let pool = Self::new(*max_connections, *connect_timeout_secs, user_agent)?;
        match &config.proxy {
            Some(proxy_url) => pool.with_proxy(proxy_url),
            None => Ok(pool),
        }
    }

    pub fn with_proxy(mut self, proxy_url: &str) -> Result<Self> {
        let proxy = Proxy::all(proxy_url)?;
        self.client = Self::builder(self.max_connections, self.connect_timeout, &self.user_agent)
            .proxy(proxy)
            .build()?;
        log::info!("🌐 [HTTP] using proxy {}", proxy_url);
        Ok(self)
    }

    // No overall request timeout: a download may legitimately take hours.
    // Stalls are caught per chunk by the task instead.
    fn builder(max_connections: usize, connect_timeout: Duration, user_agent: &str) -> ClientBuilder {
        ClientBuilder::new()
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
    }

    /// Starts a GET request and wraps the body as a stream that writes each
    /// chunk to `output_path`.
    ///
    /// The total comes from `Content-Length`, falling back to `exact_size`,
    /// which must never be an estimate.
    pub async fn open_stream(
        &self,
        url: &str,
        title: &str,
        exact_size: Option<u64>,
        output_path: PathBuf,
    ) -> std::result::Result<HttpStream, DownloadError> {
        log::debug!("🌐 [HTTP] GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::resolution(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DownloadError::resolution(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let total = stream_total(response.content_length(), exact_size)?;
        let part_path = part_path(&output_path);
        let file = tokio::fs::File::create(&part_path).await.map_err(|e| {
            DownloadError::resolution(format!("cannot create {}: {}", part_path.display(), e))
        })?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| DownloadError::transfer(e.to_string())))
            .boxed();

        log::info!("🌐 [HTTP] streaming {} bytes into {:?}", total, output_path);
        Ok(HttpStream::new(title, total, body, file, output_path))
    }
}

/// Size a download is measured against: the server's `Content-Length`, or
/// an exact size known from metadata.
pub fn stream_total(
    content_length: Option<u64>,
    exact_size: Option<u64>,
) -> std::result::Result<u64, DownloadError> {
    content_length
        .filter(|len| *len > 0)
        .or(exact_size.filter(|len| *len > 0))
        .ok_or_else(|| DownloadError::resolution("stream size is unknown or zero"))
}

/// Where bytes land until the download is complete.
pub fn part_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    output_path.with_file_name(name)
}

/// A response body being written to disk chunk by chunk.
///
/// Bytes go to `<output>.part`, which is renamed to the output path once
/// exactly `total` bytes arrived and the body ended. A stream dropped before
/// that removes its partial file.
pub struct HttpStream {
    title: String,
    total: u64,
    remaining: u64,
    body: BoxStream<'static, std::result::Result<Bytes, DownloadError>>,
    file: tokio::fs::File,
    output_path: PathBuf,
    part_path: PathBuf,
    finished: bool,
}

impl HttpStream {
    pub fn new(
        title: &str,
        total: u64,
        body: BoxStream<'static, std::result::Result<Bytes, DownloadError>>,
        file: tokio::fs::File,
        output_path: PathBuf,
    ) -> Self {
        Self {
            title: title.to_string(),
            total,
            remaining: total,
            body,
            file,
            part_path: part_path(&output_path),
            output_path,
            finished: false,
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn write_error(&self, e: std::io::Error) -> DownloadError {
        DownloadError::transfer(format!("writing {} failed: {}", self.part_path.display(), e))
    }

    fn overflow_error(&self) -> DownloadError {
        DownloadError::transfer(format!(
            "server sent more than the expected {} bytes",
            self.total
        ))
    }

    /// Called once `total` bytes are on disk: the body must end here.
    async fn finish(&mut self) -> std::result::Result<(), DownloadError> {
        while let Some(extra) = self.body.next().await {
            if !extra?.is_empty() {
                return Err(self.overflow_error());
            }
        }
        if let Err(e) = self.file.flush().await {
            return Err(self.write_error(e));
        }
        if let Err(e) = tokio::fs::rename(&self.part_path, &self.output_path).await {
            return Err(DownloadError::transfer(format!(
                "cannot move {} into place: {}",
                self.part_path.display(),
                e
            )));
        }
        self.finished = true;
        log::debug!("🌐 [HTTP] saved {:?}", self.output_path);
        Ok(())
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = std::fs::remove_file(&self.part_path) {
                log::debug!("🌐 [HTTP] could not remove {:?}: {}", self.part_path, e);
            }
        }
    }
}

#[async_trait::async_trait]
impl ResolvedStream for HttpStream {
    fn total_size(&self) -> u64 {
        self.total
    }

    fn title(&self) -> &str {
        &self.title
    }

    async fn next_chunk(&mut self) -> std::result::Result<Chunk, DownloadError> {
        match self.body.next().await {
            Some(Ok(bytes)) => {
                let consumed = bytes.len() as u64;
                if consumed > self.remaining {
                    return Err(self.overflow_error());
                }
                if let Err(e) = self.file.write_all(&bytes).await {
                    return Err(self.write_error(e));
                }
                self.remaining -= consumed;
                if self.remaining == 0 {
                    self.finish().await?;
                }
                Ok(Chunk {
                    consumed,
                    remaining: self.remaining,
                })
            }
            Some(Err(e)) => Err(e),
            None => Err(DownloadError::transfer(format!(
                "connection closed with {} bytes missing",
                self.remaining
            ))),
        }
    }
}
