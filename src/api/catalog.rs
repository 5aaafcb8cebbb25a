//! Catalog client: the fixed backend listing platforms and, per platform, channels

use std::collections::{HashMap, HashSet};

use futures::future::{join_all, BoxFuture, FutureExt};
use log::{info, warn};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::api::config::CatalogConfig;
use crate::api::error::{ApiError, BrowseError, StoreError};
use crate::api::models::{Channel, FavoriteChannel, Keyed, Platform};
use crate::api::store::{EntityStore, StoreKey};

#[derive(Deserialize)]
struct PlatformList {
    #[serde(rename = "pingtai")]
    platforms: Vec<Platform>,
}

#[derive(Deserialize)]
struct ChannelList {
    #[serde(rename = "zhubo")]
    channels: Vec<Channel>,
}

/// Source of one platform's current channel list.
pub trait ChannelSource: Sync {
    fn fetch_channels<'a>(
        &'a self,
        platform_address: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Channel>, ApiError>>;
}

pub struct CatalogClient {
    client: Client,
    base: Url,
    platforms_path: String,
    channel_prefix: String,
}

impl CatalogClient {
    pub fn new(config: &CatalogConfig) -> Result<Self, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Ok(agent) = header::HeaderValue::from_str(&config.user_agent) {
            headers.insert(header::USER_AGENT, agent);
        }
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("*/*"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()?;

        let mut base = Url::parse(&config.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client,
            base,
            platforms_path: config.platforms_path.clone(),
            channel_prefix: config.channel_prefix.clone(),
        })
    }

    pub fn platforms_url(&self) -> Result<Url, ApiError> {
        Ok(self.base.join(&self.platforms_path)?)
    }

    /// Platform addresses are relative to the channel prefix unless they are absolute URLs.
    pub fn channels_url(&self, platform_address: &str) -> Result<Url, ApiError> {
        if platform_address.starts_with("http://") || platform_address.starts_with("https://") {
            return Ok(Url::parse(platform_address)?);
        }
        let relative = format!(
            "{}{}",
            self.channel_prefix,
            platform_address.trim_start_matches('/')
        );
        Ok(self.base.join(&relative)?)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let response = self.client.get(url.as_str()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::MalformedResponse(format!("{}: {}", url, e)))
    }

    pub async fn platforms(&self) -> Result<Vec<Platform>, ApiError> {
        let list: PlatformList = self.fetch_json(self.platforms_url()?).await?;
        info!("Catalog lists {} platforms", list.platforms.len());
        Ok(dedup_by_key(list.platforms))
    }

    pub async fn channels(&self, platform_address: &str) -> Result<Vec<Channel>, ApiError> {
        let list: ChannelList = self.fetch_json(self.channels_url(platform_address)?).await?;
        Ok(dedup_by_key(list.channels))
    }
}

impl ChannelSource for CatalogClient {
    fn fetch_channels<'a>(
        &'a self,
        platform_address: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Channel>, ApiError>> {
        self.channels(platform_address).boxed()
    }
}

/// Keeps the first entry for each identity key.
pub fn dedup_by_key<T: Keyed>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.key().to_string()))
        .collect()
}

/// Entries of a fetched listing that are not blocked. Re-run on the same
/// listing after an unblock to bring entries back without refetching.
pub fn visible<T: Keyed + Clone>(items: &[T], blocked: &HashSet<String>) -> Vec<T> {
    items
        .iter()
        .filter(|item| !blocked.contains(item.key()))
        .cloned()
        .collect()
}

pub async fn browse_platforms(
    client: &CatalogClient,
    store: &EntityStore,
) -> Result<Vec<Platform>, BrowseError> {
    let platforms = client.platforms().await?;
    let blocked = store.key_set::<Platform>(StoreKey::BlockedPlatforms).await?;
    Ok(visible(&platforms, &blocked))
}

pub async fn browse_channels<S: ChannelSource>(
    source: &S,
    store: &EntityStore,
    platform_address: &str,
) -> Result<Vec<Channel>, BrowseError> {
    let channels = source.fetch_channels(platform_address).await?;
    let blocked = store.key_set::<Channel>(StoreKey::BlockedChannels).await?;
    Ok(visible(&channels, &blocked))
}

/// Favorites that currently appear in their platform's listing.
///
/// Queries every distinct platform concurrently. A platform whose query
/// fails is logged and its favorites are left out of this round.
pub async fn live_favorites<S: ChannelSource>(
    store: &EntityStore,
    source: &S,
) -> Result<Vec<FavoriteChannel>, StoreError> {
    let favorites = store.favorite_channels().await?;
    let blocked = store.key_set::<Channel>(StoreKey::BlockedChannels).await?;

    let mut platforms: Vec<&str> = favorites.iter().map(|f| f.platform_url.as_str()).collect();
    platforms.sort_unstable();
    platforms.dedup();

    let lookups = platforms.iter().map(|platform| async move {
        (*platform, source.fetch_channels(platform).await)
    });
    let mut on_air: HashMap<&str, HashSet<String>> = HashMap::new();
    for (platform, result) in join_all(lookups).await {
        match result {
            Ok(channels) => {
                on_air.insert(platform, channels.into_iter().map(|c| c.address).collect());
            }
            Err(e) => warn!("Skipping favorites of {}: {}", platform, e),
        }
    }

    Ok(favorites
        .iter()
        .filter(|f| !blocked.contains(f.key()))
        .filter(|f| {
            on_air
                .get(f.platform_url.as_str())
                .is_some_and(|live| live.contains(&f.channel.address))
        })
        .cloned()
        .collect())
}
