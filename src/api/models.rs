//! Data models shared by the store, the catalog client and both download paths

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Anything stored in a keyed collection. Two values with the same key are the same entity.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// A single stream entry of a platform's catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub title: String,
    pub address: String,
}

impl Channel {
    pub fn new(title: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            address: address.into(),
        }
    }

    /// HLS and FLV addresses are live; everything else, `rtmp://` included, is a replay.
    pub fn is_live(&self) -> bool {
        let address = self.address.to_ascii_lowercase();
        address.contains(".m3u8") || address.contains(".flv")
    }
}

impl Keyed for Channel {
    fn key(&self) -> &str {
        &self.address
    }
}

/// A catalog entry grouping channels; `address` is relative to the catalog host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub title: String,
    pub address: String,
    #[serde(default)]
    pub xinimg: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub number: String,
}

// The catalog serves `number` both as a string and as a bare integer.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

impl Platform {
    pub fn new(title: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            address: address.into(),
            xinimg: String::new(),
            number: String::new(),
        }
    }
}

impl Keyed for Platform {
    fn key(&self) -> &str {
        &self.address
    }
}

/// A favorited channel remembers the platform listing it came from, which is
/// the listing that has to be re-queried to tell whether it is on air.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteChannel {
    pub channel: Channel,
    pub platform_url: String,
}

impl Keyed for FavoriteChannel {
    fn key(&self) -> &str {
        &self.channel.address
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Cancelled,
    Error,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DownloadStatus::Downloading)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Downloading => "DOWNLOADING",
            DownloadStatus::Completed => "COMPLETED",
            DownloadStatus::Cancelled => "CANCELLED",
            DownloadStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One recording attempt. `id` is the only stable reference to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub id: String,
    pub channel_title: String,
    pub stream_url: String,
    pub output_path: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: DownloadStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl DownloadTask {
    pub fn new(
        channel_title: impl Into<String>,
        stream_url: impl Into<String>,
        output_path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel_title: channel_title.into(),
            stream_url: stream_url.into(),
            output_path: output_path.into(),
            start_time: Utc::now(),
            end_time: None,
            status: DownloadStatus::Downloading,
            error_message: None,
        }
    }

    /// Replacement record for a status change. `end_time` is set iff the status is terminal.
    pub fn with_status(&self, status: DownloadStatus, error_message: Option<String>) -> Self {
        Self {
            end_time: status.is_terminal().then(Utc::now),
            status,
            error_message,
            ..self.clone()
        }
    }
}

impl Keyed for DownloadTask {
    fn key(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_detection_is_extension_based() {
        assert!(Channel::new("a", "http://h/x.M3U8").is_live());
        assert!(Channel::new("b", "http://h/live/cx_363373.flv").is_live());
        assert!(Channel::new("c", "http://h/x.m3u8?token=1").is_live());
        assert!(!Channel::new("d", "rtmp://h/stream").is_live());
        assert!(!Channel::new("e", "rtmp://xueli130.vihyvz.top/live/4516_1751345").is_live());
        assert!(!Channel::new("f", "http://h/video.mp4").is_live());
    }

    #[test]
    fn new_task_starts_downloading() {
        let task = DownloadTask::new("Alice", "http://h/a.m3u8", "/tmp/a.mp4");
        assert!(!task.id.is_empty());
        assert_eq!(task.status, DownloadStatus::Downloading);
        assert!(task.end_time.is_none());
        assert!(task.error_message.is_none());
    }

    #[test]
    fn task_ids_are_unique() {
        let a = DownloadTask::new("Alice", "http://h/a.m3u8", "/tmp/a.mp4");
        let b = DownloadTask::new("Alice", "http://h/a.m3u8", "/tmp/a.mp4");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn end_time_tracks_terminal_status() {
        let task = DownloadTask::new("Alice", "http://h/a.m3u8", "/tmp/a.mp4");

        let done = task.with_status(DownloadStatus::Completed, None);
        assert!(done.end_time.is_some());
        assert_eq!(done.id, task.id);
        assert_eq!(done.start_time, task.start_time);

        let failed = task.with_status(DownloadStatus::Error, Some("rc=1".into()));
        assert!(failed.end_time.is_some());
        assert_eq!(failed.error_message.as_deref(), Some("rc=1"));

        let back = done.with_status(DownloadStatus::Downloading, None);
        assert!(back.end_time.is_none());
    }

    #[test]
    fn persisted_layout_uses_camel_case() {
        let task = DownloadTask::new("Alice", "http://h/a.m3u8", "/tmp/a.mp4");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["channelTitle"], "Alice");
        assert_eq!(json["streamUrl"], "http://h/a.m3u8");
        assert_eq!(json["status"], "DOWNLOADING");

        let fav = FavoriteChannel {
            channel: Channel::new("Bob", "http://h/b.flv"),
            platform_url: "jsonbob.txt".into(),
        };
        let json = serde_json::to_value(&fav).unwrap();
        assert_eq!(json["platformUrl"], "jsonbob.txt");
        assert_eq!(json["channel"]["address"], "http://h/b.flv");
    }

    #[test]
    fn platform_tolerates_missing_display_fields() {
        let platform: Platform =
            serde_json::from_str(r#"{"title":"P","address":"jsonp.txt"}"#).unwrap();
        assert_eq!(platform.key(), "jsonp.txt");
        assert!(platform.xinimg.is_empty());

        let platform: Platform =
            serde_json::from_str(r#"{"title":"P","address":"a","xinimg":"i.png","number":42}"#)
                .unwrap();
        assert_eq!(platform.number, "42");
    }
}
