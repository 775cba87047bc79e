//! Concurrent media downloads with per-item progress, speed reporting and
//! cancellation.
//!
//! A [`DownloadManager`](downloader::DownloadManager) turns each submitted
//! item, or every item of an expanded collection, into its own task. Tasks
//! publish progress, speed and outcome events on a shared bus that any
//! number of [`EventSink`](downloader::EventSink)s can observe.

pub mod commands;
pub mod config;
pub mod downloader;
pub mod errors;
pub mod security;
pub mod utils;

pub use config::AppConfig;
pub use downloader::{
    CollectionExpander, DownloadEvent, DownloadManager, DownloadRequest, ManagerEvent, Quality,
    ResolvedStream, Resolver, SourceRef, TaskId, TaskState,
};
pub use errors::{AppError, DownloadError, FailureReason, Result};
