pub mod api;

pub use api::catalog::{CatalogClient, ChannelSource};
pub use api::config::Settings;
pub use api::downloader::{FfmpegTranscoder, TaskEvent, TaskManager, Transcoder};
pub use api::error::{ApiError, BrowseError, StoreError, TaskError};
pub use api::models::{Channel, DownloadStatus, DownloadTask, FavoriteChannel, Platform};
pub use api::remote::RemoteTaskGateway;
pub use api::store::EntityStore;
