//! Remote download service: a user-configured HTTP backend that records streams
//! on its own and reports task state. Nothing here touches local tasks.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use reqwest::{header, Client, RequestBuilder};
use serde_json::{json, Map, Value};
use url::Url;

use crate::api::config::RemoteConfig;
use crate::api::error::ApiError;
use crate::api::models::{DownloadStatus, DownloadTask};
use crate::api::store::EntityStore;

// Historical field names, in lookup order.
const ID_FIELDS: &[&str] = &["id"];
const TITLE_FIELDS: &[&str] = &["title"];
const URL_FIELDS: &[&str] = &["url"];
const OUTPUT_FIELDS: &[&str] = &["file_path", "filePath"];
const START_FIELDS: &[&str] = &["created_at", "startTime"];
const END_FIELDS: &[&str] = &["updated_at", "endTime"];
const STATUS_FIELDS: &[&str] = &["status"];
const ERROR_FIELDS: &[&str] = &["errorMessage", "error"];
const MESSAGE_FIELDS: &[&str] = &["message"];
const TASK_ID_FIELDS: &[&str] = &["taskId"];

const EPOCH_MILLIS_THRESHOLD: i64 = 10_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Downloading,
    Completed,
    Cancelled,
    Error,
    /// A status string this client does not know, kept verbatim.
    Unknown(String),
}

impl RemoteStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "downloading" => Self::Downloading,
            "completed" => Self::Completed,
            "cancelled" | "canceled" => Self::Cancelled,
            "failed" | "error" => Self::Error,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    /// Status to act on. Unknown states are treated as still running so they get polled again.
    pub fn effective(&self) -> DownloadStatus {
        match self {
            Self::Downloading | Self::Unknown(_) => DownloadStatus::Downloading,
            Self::Completed => DownloadStatus::Completed,
            Self::Cancelled => DownloadStatus::Cancelled,
            Self::Error => DownloadStatus::Error,
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => f.pad(&format!("{} (unknown)", raw)),
            known => f.pad(known.effective().as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTask {
    pub id: String,
    pub channel_title: String,
    pub stream_url: String,
    pub output_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RemoteStatus,
    pub error_message: Option<String>,
}

impl RemoteTask {
    pub fn to_download_task(&self) -> DownloadTask {
        DownloadTask {
            id: self.id.clone(),
            channel_title: self.channel_title.clone(),
            stream_url: self.stream_url.clone(),
            output_path: self.output_path.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status.effective(),
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskPage {
    pub ok: bool,
    pub message: Option<String>,
    pub items: Vec<RemoteTask>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl TaskPage {
    fn failure(page: u32, page_size: u32, err: &ApiError) -> Self {
        Self {
            ok: false,
            message: Some(err.to_string()),
            items: Vec::new(),
            total: 0,
            page,
            page_size,
        }
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub ok: bool,
    pub message: Option<String>,
    pub task_id: Option<String>,
    pub id: Option<String>,
}

impl ApiResponse {
    /// Parses a command reply. Ids may arrive as strings or numbers.
    pub fn parse(body: &str) -> Result<Self, ApiError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| ApiError::MalformedResponse(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ApiError::MalformedResponse("reply is not an object".into()))?;
        Ok(Self {
            ok: obj.get("ok").and_then(Value::as_bool).unwrap_or(false),
            message: string_field(obj, MESSAGE_FIELDS),
            task_id: string_field(obj, TASK_ID_FIELDS),
            id: string_field(obj, ID_FIELDS),
        })
    }

    fn failure(err: &ApiError) -> Self {
        Self {
            ok: false,
            message: Some(err.to_string()),
            task_id: None,
            id: None,
        }
    }
}

/// How a remote task is addressed when cancelling it. The id wins when both are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    Id(String),
    Title(String),
}

impl TaskRef {
    pub fn from_parts(id: Option<&str>, title: Option<&str>) -> Option<Self> {
        let present = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        present(id)
            .map(Self::Id)
            .or_else(|| present(title).map(Self::Title))
    }

    fn body(&self) -> Value {
        match self {
            Self::Id(id) => json!({ "id": id }),
            Self::Title(title) => json!({ "title": title }),
        }
    }
}

/// First alias whose value is present, not null and not an empty string.
pub fn first_present<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|key| match obj.get(*key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(value) => Some(value),
    })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_field(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    first_present(obj, aliases).and_then(scalar_string)
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() > EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// Accepts RFC 3339, naive ISO or `YYYY-MM-DD HH:MM:SS` (read as UTC), or epoch
/// seconds/milliseconds as a number or numeric string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(epoch) = s.parse::<i64>() {
                return from_epoch(epoch);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

pub fn parse_remote_task(value: &Value) -> Result<RemoteTask, ApiError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ApiError::MalformedResponse("task item is not an object".into()))?;
    let id = string_field(obj, ID_FIELDS)
        .ok_or_else(|| ApiError::MalformedResponse("task item without id".into()))?;

    let stream_url = string_field(obj, URL_FIELDS)
        .map(|url| url.replace('`', "").trim().to_string())
        .unwrap_or_default();
    let start_time = first_present(obj, START_FIELDS)
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);
    let end_time = first_present(obj, END_FIELDS).and_then(parse_timestamp);
    let status = RemoteStatus::parse(&string_field(obj, STATUS_FIELDS).unwrap_or_default());

    Ok(RemoteTask {
        id,
        channel_title: string_field(obj, TITLE_FIELDS).unwrap_or_default(),
        stream_url,
        output_path: string_field(obj, OUTPUT_FIELDS).unwrap_or_default(),
        start_time,
        end_time,
        status,
        error_message: string_field(obj, ERROR_FIELDS),
    })
}

/// `page` and `page_size` are the requested values, used when the response omits them.
pub fn parse_task_page(body: &str, page: u32, page_size: u32) -> Result<TaskPage, ApiError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ApiError::MalformedResponse(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ApiError::MalformedResponse("task list is not an object".into()))?;

    let items = match obj.get("items") {
        Some(Value::Array(items)) => items
            .iter()
            .map(parse_remote_task)
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };
    let number = |key: &str| obj.get(key).and_then(Value::as_u64);

    Ok(TaskPage {
        ok: obj.get("ok").and_then(Value::as_bool).unwrap_or(false),
        message: obj.get("message").and_then(scalar_string),
        items,
        total: number("total").unwrap_or(0),
        page: number("page").map_or(page, |p| p as u32),
        page_size: number("pageSize").map_or(page_size, |p| p as u32),
    })
}

/// Reduces a configured endpoint to `scheme://host[:port]`.
pub fn base_url(configured: &str) -> Result<String, ApiError> {
    let configured = configured.trim();
    if configured.is_empty() {
        return Err(ApiError::NotConfigured);
    }
    let with_scheme = if configured.contains("://") {
        configured.to_string()
    } else {
        format!("http://{}", configured)
    };
    let url = Url::parse(&with_scheme)?;
    Ok(match url.host_str() {
        Some(host) => match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        },
        None => with_scheme.trim_end_matches('/').to_string(),
    })
}

pub struct RemoteTaskGateway {
    client: Client,
    store: Arc<EntityStore>,
}

impl RemoteTaskGateway {
    pub fn new(store: Arc<EntityStore>, config: &RemoteConfig) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, store })
    }

    async fn base(&self) -> Result<String, ApiError> {
        let configured = self
            .store
            .remote_download_url()
            .await?
            .ok_or(ApiError::NotConfigured)?;
        base_url(&configured)
    }

    async fn send(&self, request: RequestBuilder) -> Result<String, ApiError> {
        let mut request = request.header(header::ACCEPT, "application/json");
        if let Some(token) = self.store.remote_auth_token().await? {
            if !token.trim().is_empty() {
                request = request.bearer_auth(token.trim());
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await?;

        if !status.is_success() {
            debug!("Remote service answered {}: {}", status, body);
            return Err(ApiError::Http {
                status: status.as_u16(),
            });
        }
        if !content_type.contains("application/json") {
            return Err(ApiError::UnexpectedContentType(content_type));
        }
        Ok(body)
    }

    async fn post_command(&self, path: &str, body: Value) -> Result<ApiResponse, ApiError> {
        let url = format!("{}/{}", self.base().await?, path);
        let body = self.send(self.client.post(url).json(&body)).await?;
        ApiResponse::parse(&body)
    }

    async fn try_list_tasks(
        &self,
        status: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TaskPage, ApiError> {
        let mut url = Url::parse(&format!("{}/tasks", self.base().await?))?;
        url.query_pairs_mut()
            .append_pair("status", status)
            .append_pair("page", &page.to_string())
            .append_pair("pageSize", &page_size.to_string());
        let body = self.send(self.client.get(url.as_str())).await?;
        parse_task_page(&body, page, page_size)
    }

    /// One page of remote tasks in the given state. Failures come back as `ok: false`.
    pub async fn list_tasks(&self, status: &str, page: u32, page_size: u32) -> TaskPage {
        match self.try_list_tasks(status, page, page_size).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Listing remote tasks failed: {}", e);
                TaskPage::failure(page, page_size, &e)
            }
        }
    }

    pub async fn cancel_task(&self, task: &TaskRef) -> ApiResponse {
        match self.post_command("cancel", task.body()).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Cancelling remote task failed: {}", e);
                ApiResponse::failure(&e)
            }
        }
    }

    /// Only meaningful for tasks the service already reports as finished.
    pub async fn delete_completed_file(&self, id: &str) -> ApiResponse {
        match self.post_command("delete", json!({ "id": id })).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Deleting remote file failed: {}", e);
                ApiResponse::failure(&e)
            }
        }
    }

    /// Where a finished remote recording can be streamed from.
    pub async fn completed_file_url(&self, id: &str) -> Option<String> {
        let base = self.base().await.ok()?;
        let mut url = Url::parse(&format!("{}/file", base)).ok()?;
        url.query_pairs_mut().append_pair("id", id);
        Some(url.into())
    }
}
