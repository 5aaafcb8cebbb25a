//! Durable entity store: favorites, blocks, download tasks and a few singletons,
//! each kept as one JSON value under a fixed key of a string-keyed medium.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::RwLock;

use crate::api::error::StoreError;
use crate::api::models::{
    Channel, DownloadStatus, DownloadTask, FavoriteChannel, Keyed, Platform,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    FavoritePlatforms,
    FavoriteChannels,
    BlockedChannels,
    BlockedPlatforms,
    DownloadTasks,
    DownloadPath,
    LastPlayedChannel,
    RemoteDownloadUrl,
    RemoteAuthToken,
}

const KEY_COUNT: usize = 9;

impl StoreKey {
    pub const ALL: [StoreKey; KEY_COUNT] = [
        StoreKey::FavoritePlatforms,
        StoreKey::FavoriteChannels,
        StoreKey::BlockedChannels,
        StoreKey::BlockedPlatforms,
        StoreKey::DownloadTasks,
        StoreKey::DownloadPath,
        StoreKey::LastPlayedChannel,
        StoreKey::RemoteDownloadUrl,
        StoreKey::RemoteAuthToken,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreKey::FavoritePlatforms => "favorite_platforms",
            StoreKey::FavoriteChannels => "favorite_channels",
            StoreKey::BlockedChannels => "blocked_channels",
            StoreKey::BlockedPlatforms => "blocked_platforms",
            StoreKey::DownloadTasks => "download_tasks",
            StoreKey::DownloadPath => "download_path",
            StoreKey::LastPlayedChannel => "last_played_channel",
            StoreKey::RemoteDownloadUrl => "remote_download_url",
            StoreKey::RemoteAuthToken => "remote_auth_token",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// String-keyed persistent map the entity store is layered on.
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when the key was never written.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;
    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StoreError>>;
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// One `<key>.json` file per key. Values are replaced by rename so a reader
/// sees either the previous value or the new one.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        info!("Entity store directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        async move {
            match fs::read_to_string(self.path(key)).await {
                Ok(raw) => Ok(Some(raw)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            let tmp = self.dir.join(format!(".{}.json.tmp", key));
            fs::write(&tmp, value.as_bytes()).await?;
            fs::rename(&tmp, self.path(key)).await?;
            Ok(())
        }
        .boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            match fs::remove_file(self.path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        future::ready(Ok(self.values().get(key).cloned())).boxed()
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StoreError>> {
        self.values().insert(key.to_string(), value);
        future::ready(Ok(())).boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.values().remove(key);
        future::ready(Ok(())).boxed()
    }
}

/// Typed access to everything the application persists.
///
/// Open one per process and share it as `Arc<EntityStore>`. Every
/// read-modify-write of a key runs under that key's write lock, so concurrent
/// mutations of one collection are linearized while reads and writes of
/// different keys never wait on each other.
pub struct EntityStore {
    kv: Arc<dyn KeyValueStore>,
    locks: [RwLock<()>; KEY_COUNT],
}

impl EntityStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            locks: std::array::from_fn(|_| RwLock::new(())),
        }
    }

    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(FileKeyValueStore::open(dir).await?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    fn lock(&self, key: StoreKey) -> &RwLock<()> {
        &self.locks[key.index()]
    }

    async fn read_value<T: DeserializeOwned>(
        &self,
        key: StoreKey,
    ) -> Result<Option<T>, StoreError> {
        match self.kv.get(key.as_str()).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::CorruptState {
                    key: key.as_str(),
                    source,
                }),
        }
    }

    async fn write_value<T: Serialize + ?Sized>(
        &self,
        key: StoreKey,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Serialize {
            key: key.as_str(),
            source,
        })?;
        self.kv.put(key.as_str(), raw).await
    }

    async fn read_collection<T: DeserializeOwned>(
        &self,
        key: StoreKey,
    ) -> Result<Vec<T>, StoreError> {
        Ok(self.read_value(key).await?.unwrap_or_default())
    }

    /// Snapshot of a collection; empty if it was never written.
    pub async fn list<T: DeserializeOwned>(&self, key: StoreKey) -> Result<Vec<T>, StoreError> {
        let _guard = self.lock(key).read().await;
        self.read_collection(key).await
    }

    /// Appends `item` unless an element with the same key exists. Returns whether it was added.
    pub async fn add<T>(&self, key: StoreKey, item: T) -> Result<bool, StoreError>
    where
        T: Keyed + Serialize + DeserializeOwned,
    {
        let _guard = self.lock(key).write().await;
        let mut items: Vec<T> = self.read_collection(key).await?;
        if items.iter().any(|existing| existing.key() == item.key()) {
            return Ok(false);
        }
        debug!("{} += {}", key.as_str(), item.key());
        items.push(item);
        self.write_value(key, &items).await?;
        Ok(true)
    }

    /// Drops the element keyed `id`. Absence is not an error; the collection is left untouched.
    pub async fn remove<T>(&self, key: StoreKey, id: &str) -> Result<bool, StoreError>
    where
        T: Keyed + Serialize + DeserializeOwned,
    {
        let _guard = self.lock(key).write().await;
        let mut items: Vec<T> = self.read_collection(key).await?;
        let before = items.len();
        items.retain(|existing| existing.key() != id);
        if items.len() == before {
            return Ok(false);
        }
        debug!("{} -= {}", key.as_str(), id);
        self.write_value(key, &items).await?;
        Ok(true)
    }

    pub async fn contains<T>(&self, key: StoreKey, id: &str) -> Result<bool, StoreError>
    where
        T: Keyed + DeserializeOwned,
    {
        Ok(self.list::<T>(key).await?.iter().any(|item| item.key() == id))
    }

    /// Identity keys of a collection, for membership checks while rendering lists.
    pub async fn key_set<T>(&self, key: StoreKey) -> Result<HashSet<String>, StoreError>
    where
        T: Keyed + DeserializeOwned,
    {
        Ok(self
            .list::<T>(key)
            .await?
            .iter()
            .map(|item| item.key().to_string())
            .collect())
    }

    /// Forgets a stored value entirely, e.g. after a `CorruptState` error.
    pub async fn reset(&self, key: StoreKey) -> Result<(), StoreError> {
        let _guard = self.lock(key).write().await;
        info!("Resetting {}", key.as_str());
        self.kv.delete(key.as_str()).await
    }

    // Favorite platforms

    pub async fn add_favorite_platform(&self, platform: Platform) -> Result<bool, StoreError> {
        self.add(StoreKey::FavoritePlatforms, platform).await
    }

    pub async fn remove_favorite_platform(&self, address: &str) -> Result<bool, StoreError> {
        self.remove::<Platform>(StoreKey::FavoritePlatforms, address).await
    }

    pub async fn favorite_platforms(&self) -> Result<Vec<Platform>, StoreError> {
        self.list(StoreKey::FavoritePlatforms).await
    }

    pub async fn is_platform_favorite(&self, address: &str) -> Result<bool, StoreError> {
        self.contains::<Platform>(StoreKey::FavoritePlatforms, address).await
    }

    // Favorite channels

    pub async fn add_favorite_channel(
        &self,
        channel: Channel,
        platform_url: impl Into<String>,
    ) -> Result<bool, StoreError> {
        let favorite = FavoriteChannel {
            channel,
            platform_url: platform_url.into(),
        };
        self.add(StoreKey::FavoriteChannels, favorite).await
    }

    pub async fn remove_favorite_channel(&self, address: &str) -> Result<bool, StoreError> {
        self.remove::<FavoriteChannel>(StoreKey::FavoriteChannels, address).await
    }

    pub async fn favorite_channels(&self) -> Result<Vec<FavoriteChannel>, StoreError> {
        self.list(StoreKey::FavoriteChannels).await
    }

    pub async fn is_channel_favorite(&self, address: &str) -> Result<bool, StoreError> {
        self.contains::<FavoriteChannel>(StoreKey::FavoriteChannels, address).await
    }

    // Blocked channels

    pub async fn block_channel(&self, channel: Channel) -> Result<bool, StoreError> {
        self.add(StoreKey::BlockedChannels, channel).await
    }

    pub async fn unblock_channel(&self, address: &str) -> Result<bool, StoreError> {
        self.remove::<Channel>(StoreKey::BlockedChannels, address).await
    }

    pub async fn blocked_channels(&self) -> Result<Vec<Channel>, StoreError> {
        self.list(StoreKey::BlockedChannels).await
    }

    pub async fn is_channel_blocked(&self, address: &str) -> Result<bool, StoreError> {
        self.contains::<Channel>(StoreKey::BlockedChannels, address).await
    }

    // Blocked platforms

    pub async fn block_platform(&self, platform: Platform) -> Result<bool, StoreError> {
        self.add(StoreKey::BlockedPlatforms, platform).await
    }

    pub async fn unblock_platform(&self, address: &str) -> Result<bool, StoreError> {
        self.remove::<Platform>(StoreKey::BlockedPlatforms, address).await
    }

    pub async fn blocked_platforms(&self) -> Result<Vec<Platform>, StoreError> {
        self.list(StoreKey::BlockedPlatforms).await
    }

    pub async fn is_platform_blocked(&self, address: &str) -> Result<bool, StoreError> {
        self.contains::<Platform>(StoreKey::BlockedPlatforms, address).await
    }

    // Download tasks

    pub async fn add_download_task(&self, task: DownloadTask) -> Result<bool, StoreError> {
        self.add(StoreKey::DownloadTasks, task).await
    }

    pub async fn remove_download_task(&self, id: &str) -> Result<bool, StoreError> {
        self.remove::<DownloadTask>(StoreKey::DownloadTasks, id).await
    }

    pub async fn download_tasks(&self) -> Result<Vec<DownloadTask>, StoreError> {
        self.list(StoreKey::DownloadTasks).await
    }

    pub async fn download_task(&self, id: &str) -> Result<Option<DownloadTask>, StoreError> {
        Ok(self
            .download_tasks()
            .await?
            .into_iter()
            .find(|task| task.id == id))
    }

    /// Replaces the task keyed `id` with a record carrying the new status.
    /// Returns the stored record, or `None` (silently) for an unknown id.
    pub async fn update_task_status(
        &self,
        id: &str,
        status: DownloadStatus,
        error_message: Option<String>,
    ) -> Result<Option<DownloadTask>, StoreError> {
        let key = StoreKey::DownloadTasks;
        let _guard = self.lock(key).write().await;
        let mut tasks: Vec<DownloadTask> = self.read_collection(key).await?;
        let Some(slot) = tasks.iter_mut().find(|task| task.id == id) else {
            return Ok(None);
        };
        *slot = slot.with_status(status, error_message);
        let updated = slot.clone();
        self.write_value(key, &tasks).await?;
        debug!("task {} -> {}", id, status);
        Ok(Some(updated))
    }

    // Singletons

    async fn singleton<T: DeserializeOwned>(&self, key: StoreKey) -> Result<Option<T>, StoreError> {
        let _guard = self.lock(key).read().await;
        self.read_value(key).await
    }

    async fn set_singleton<T: Serialize>(
        &self,
        key: StoreKey,
        value: Option<&T>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(key).write().await;
        match value {
            Some(value) => self.write_value(key, value).await,
            None => self.kv.delete(key.as_str()).await,
        }
    }

    pub async fn download_dir(&self) -> Result<Option<PathBuf>, StoreError> {
        Ok(self
            .singleton::<String>(StoreKey::DownloadPath)
            .await?
            .filter(|path| !path.is_empty())
            .map(PathBuf::from))
    }

    pub async fn set_download_dir(&self, dir: Option<&Path>) -> Result<(), StoreError> {
        let value = dir.map(|dir| dir.to_string_lossy().into_owned());
        self.set_singleton(StoreKey::DownloadPath, value.as_ref()).await
    }

    pub async fn last_played_channel(&self) -> Result<Option<Channel>, StoreError> {
        self.singleton(StoreKey::LastPlayedChannel).await
    }

    pub async fn set_last_played_channel(
        &self,
        channel: Option<&Channel>,
    ) -> Result<(), StoreError> {
        self.set_singleton(StoreKey::LastPlayedChannel, channel).await
    }

    pub async fn remote_download_url(&self) -> Result<Option<String>, StoreError> {
        self.singleton(StoreKey::RemoteDownloadUrl).await
    }

    pub async fn set_remote_download_url(&self, url: Option<&str>) -> Result<(), StoreError> {
        self.set_singleton(StoreKey::RemoteDownloadUrl, url.as_ref()).await
    }

    pub async fn remote_auth_token(&self) -> Result<Option<String>, StoreError> {
        self.singleton(StoreKey::RemoteAuthToken).await
    }

    pub async fn set_remote_auth_token(&self, token: Option<&str>) -> Result<(), StoreError> {
        self.set_singleton(StoreKey::RemoteAuthToken, token.as_ref()).await
    }
}
