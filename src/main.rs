use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use tokio::sync::broadcast;

use rust_lib_livestream_player::api::catalog::{self, CatalogClient};
use rust_lib_livestream_player::api::config::Settings;
use rust_lib_livestream_player::api::downloader::{self, FfmpegTranscoder, TaskEvent, TaskManager};
use rust_lib_livestream_player::api::logging;
use rust_lib_livestream_player::api::models::{Channel, DownloadStatus, Platform};
use rust_lib_livestream_player::api::remote::{ApiResponse, RemoteTaskGateway, TaskRef};
use rust_lib_livestream_player::api::store::EntityStore;

/// Browse live-stream platforms, keep favorites and block lists, record channels.
#[derive(Parser)]
#[command(name = "livestream", version)]
struct Cli {
    /// Settings file. Defaults to the user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the persisted store. Overrides the settings file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List platforms that are not blocked.
    Platforms,
    /// List the channels of one platform.
    Channels {
        /// Platform address as listed by `platforms`.
        address: String,
    },
    /// Favorite channels that are currently on air.
    LiveFavorites,
    /// Manage favorites.
    Favorite {
        #[command(subcommand)]
        target: Target,
    },
    /// Manage block lists.
    Block {
        #[command(subcommand)]
        target: Target,
    },
    /// Show or set the directory recordings are written to.
    DownloadDir {
        path: Option<PathBuf>,

        /// Forget the configured directory.
        #[arg(long, conflicts_with = "path")]
        clear: bool,
    },
    /// Record a stream until it ends or Ctrl+C is pressed.
    Record {
        /// Channel title, also used for the file name.
        title: String,
        /// Stream address (HLS, FLV or RTMP).
        url: String,
    },
    /// List local recording tasks.
    Tasks {
        /// Mark tasks left downloading by an earlier run as interrupted.
        #[arg(long)]
        reconcile: bool,
    },
    /// Forget a local recording task. The recorded file is kept.
    RemoveTask { id: String },
    /// List or delete recorded files in the download directory.
    Recordings {
        #[command(subcommand)]
        action: Option<RecordingsAction>,
    },
    /// Talk to a remote download service.
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },
}

#[derive(Subcommand)]
enum Target {
    Platform {
        #[command(subcommand)]
        action: Action,
    },
    Channel {
        #[command(subcommand)]
        action: Action,
    },
}

#[derive(Subcommand)]
enum Action {
    Add {
        title: String,
        address: String,
        /// Platform the channel belongs to. Required for favorite channels.
        #[arg(long)]
        platform: Option<String>,
    },
    Rm {
        address: String,
    },
    Ls,
}

#[derive(Subcommand)]
enum RecordingsAction {
    /// List recordings, newest first (the default).
    Ls,
    /// Delete one recording by file name.
    Rm { name: String },
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// Show or change the endpoint and token.
    Config {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
        /// Remove both endpoint and token.
        #[arg(long, conflicts_with_all = ["url", "token"])]
        clear: bool,
    },
    /// List remote tasks in one state.
    Tasks {
        #[arg(default_value = "downloading")]
        status: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },
    /// Cancel a remote task by id, or by title when the id is unknown.
    Cancel {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        title: Option<String>,
    },
    /// Delete the file of a finished remote task.
    Delete { id: String },
    /// Print the streaming URL of a finished remote task.
    FileUrl { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load(&config_path)?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }
    let store = Arc::new(
        EntityStore::open(&settings.data_dir)
            .await
            .with_context(|| format!("Failed to open store in {}", settings.data_dir.display()))?,
    );

    match cli.command {
        Command::Platforms => {
            let client = CatalogClient::new(&settings.catalog)?;
            for platform in catalog::browse_platforms(&client, &store).await? {
                println!("{:>6}  {}  {}", platform.number, platform.title, platform.address);
            }
        }
        Command::Channels { address } => {
            let client = CatalogClient::new(&settings.catalog)?;
            for channel in catalog::browse_channels(&client, &store, &address).await? {
                let marker = if channel.is_live() { "*" } else { " " };
                println!("{} {}  {}", marker, channel.title, channel.address);
            }
        }
        Command::LiveFavorites => {
            let client = CatalogClient::new(&settings.catalog)?;
            for favorite in catalog::live_favorites(&store, &client).await? {
                println!(
                    "{}  {}  ({})",
                    favorite.channel.title, favorite.channel.address, favorite.platform_url
                );
            }
        }
        Command::Favorite { target } => favorite(&store, target).await?,
        Command::Block { target } => block(&store, target).await?,
        Command::DownloadDir { path, clear } => {
            if clear {
                store.set_download_dir(None).await?;
            } else if let Some(path) = path {
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                let path = path.canonicalize()?;
                store.set_download_dir(Some(&path)).await?;
                println!("{}", path.display());
            } else {
                match store.download_dir().await? {
                    Some(dir) => println!("{}", dir.display()),
                    None => println!("(not configured)"),
                }
            }
        }
        Command::Record { title, url } => record(store, &settings, title, url).await?,
        Command::Tasks { reconcile } => {
            if reconcile {
                let (manager, _) = task_manager(&store, &settings);
                let interrupted = manager.reconcile_interrupted().await?;
                info!("Marked {} interrupted tasks", interrupted.len());
            }
            for task in store.download_tasks().await? {
                println!(
                    "{}  {:<11}  {}  {}",
                    task.id, task.status, task.channel_title, task.output_path
                );
                if let Some(message) = task.error_message {
                    println!("    {}", message);
                }
            }
        }
        Command::RemoveTask { id } => {
            let (manager, _) = task_manager(&store, &settings);
            if !manager.remove_task(&id).await? {
                println!("No task {}", id);
            }
        }
        Command::Recordings { action } => {
            let dir = store
                .download_dir()
                .await?
                .context("No download directory configured")?;
            match action.unwrap_or(RecordingsAction::Ls) {
                RecordingsAction::Ls => {
                    for file in downloader::recordings(&dir).await? {
                        let modified = file
                            .modified
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default();
                        println!("{:>12}  {}  {}", file.size, modified, file.name);
                    }
                }
                RecordingsAction::Rm { name } => downloader::delete_recording(&dir, &name).await?,
            }
        }
        Command::Remote { command } => remote(store, &settings, command).await?,
    }
    Ok(())
}

async fn favorite(store: &EntityStore, target: Target) -> Result<()> {
    match target {
        Target::Platform { action } => match action {
            Action::Add { title, address, .. } => {
                store.add_favorite_platform(Platform::new(title, address)).await?;
            }
            Action::Rm { address } => {
                store.remove_favorite_platform(&address).await?;
            }
            Action::Ls => {
                for platform in store.favorite_platforms().await? {
                    println!("{}  {}", platform.title, platform.address);
                }
            }
        },
        Target::Channel { action } => match action {
            Action::Add { title, address, platform } => {
                let platform = platform.context("--platform is required for favorite channels")?;
                store
                    .add_favorite_channel(Channel::new(title, address), &platform)
                    .await?;
            }
            Action::Rm { address } => {
                store.remove_favorite_channel(&address).await?;
            }
            Action::Ls => {
                for favorite in store.favorite_channels().await? {
                    println!(
                        "{}  {}  ({})",
                        favorite.channel.title, favorite.channel.address, favorite.platform_url
                    );
                }
            }
        },
    }
    Ok(())
}

async fn block(store: &EntityStore, target: Target) -> Result<()> {
    match target {
        Target::Platform { action } => match action {
            Action::Add { title, address, .. } => {
                store.block_platform(Platform::new(title, address)).await?;
            }
            Action::Rm { address } => {
                store.unblock_platform(&address).await?;
            }
            Action::Ls => {
                for platform in store.blocked_platforms().await? {
                    println!("{}  {}", platform.title, platform.address);
                }
            }
        },
        Target::Channel { action } => match action {
            Action::Add { title, address, .. } => {
                store.block_channel(Channel::new(title, address)).await?;
            }
            Action::Rm { address } => {
                store.unblock_channel(&address).await?;
            }
            Action::Ls => {
                for channel in store.blocked_channels().await? {
                    println!("{}  {}", channel.title, channel.address);
                }
            }
        },
    }
    Ok(())
}

async fn wait_for(events: &mut broadcast::Receiver<TaskEvent>, id: &str) -> Result<TaskEvent> {
    loop {
        match events.recv().await {
            Ok(event) if event.id == id => return Ok(event),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("task manager went away"),
        }
    }
}

fn task_manager(
    store: &Arc<EntityStore>,
    settings: &Settings,
) -> (TaskManager, Arc<FfmpegTranscoder>) {
    let transcoder = Arc::new(FfmpegTranscoder::new(&settings.ffmpeg_binary));
    let manager = TaskManager::new(Arc::clone(store), transcoder.clone());
    (manager, transcoder)
}

async fn record(
    store: Arc<EntityStore>,
    settings: &Settings,
    title: String,
    url: String,
) -> Result<()> {
    let (manager, transcoder) = task_manager(&store, settings);
    if !transcoder.is_available().await {
        bail!(
            "{} is not available; install ffmpeg or set ffmpeg_binary in the settings",
            settings.ffmpeg_binary
        );
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));

    let result = run_recording(&manager, &pb, &title, url).await;

    pb.set_message("Finalizing...");
    manager.shutdown().await;
    transcoder.wait_idle().await;

    match result {
        Ok(output_path) => {
            pb.finish_with_message(format!("Saved {}", output_path));
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Recording failed");
            Err(e)
        }
    }
}

async fn run_recording(
    manager: &TaskManager,
    pb: &ProgressBar,
    title: &str,
    url: String,
) -> Result<String> {
    let mut events = manager.subscribe();
    let task = manager.create_task(&Channel::new(title, url), title).await?;
    if !manager.start(&task).await? {
        bail!("Task {} could not be started", task.id);
    }
    pb.set_message(format!("Recording {} (Ctrl+C to stop)", title));

    let event = tokio::select! {
        event = wait_for(&mut events, &task.id) => event?,
        _ = tokio::signal::ctrl_c() => {
            pb.set_message("Stopping...");
            manager.stop(&task.id).await?;
            wait_for(&mut events, &task.id).await?
        }
    };

    match event.status {
        DownloadStatus::Completed | DownloadStatus::Cancelled => Ok(task.output_path),
        status => bail!(event.error_message.unwrap_or_else(|| status.to_string())),
    }
}

fn print_response(response: ApiResponse) -> Result<()> {
    let message = response.message.unwrap_or_default();
    if !response.ok {
        bail!("Remote service: {}", message);
    }
    match response.task_id.or(response.id) {
        Some(id) => println!("{} ({})", message, id),
        None => println!("{}", message),
    }
    Ok(())
}

async fn remote(
    store: Arc<EntityStore>,
    settings: &Settings,
    command: RemoteCommand,
) -> Result<()> {
    let gateway = RemoteTaskGateway::new(Arc::clone(&store), &settings.remote)?;
    match command {
        RemoteCommand::Config { url, token, clear } => {
            if clear {
                store.set_remote_download_url(None).await?;
                store.set_remote_auth_token(None).await?;
            }
            if let Some(url) = url {
                store.set_remote_download_url(Some(&url)).await?;
            }
            if let Some(token) = token {
                store.set_remote_auth_token(Some(&token)).await?;
            }
            let url = store.remote_download_url().await?;
            let has_token = store
                .remote_auth_token()
                .await?
                .is_some_and(|t| !t.trim().is_empty());
            println!("url:   {}", url.as_deref().unwrap_or("(not configured)"));
            println!("token: {}", if has_token { "set" } else { "none" });
        }
        RemoteCommand::Tasks { status, page, page_size } => {
            let page = gateway.list_tasks(&status, page, page_size).await;
            if !page.ok {
                bail!("Remote service: {}", page.message.unwrap_or_default());
            }
            for task in &page.items {
                println!(
                    "{}  {:<11}  {}  {}",
                    task.id, task.status, task.channel_title, task.stream_url
                );
                if let Some(message) = &task.error_message {
                    println!("    {}", message);
                }
            }
            println!("page {} ({} per page), {} total", page.page, page.page_size, page.total);
        }
        RemoteCommand::Cancel { id, title } => {
            let task = TaskRef::from_parts(id.as_deref(), title.as_deref())
                .context("Pass --id or --title")?;
            print_response(gateway.cancel_task(&task).await)?;
        }
        RemoteCommand::Delete { id } => print_response(gateway.delete_completed_file(&id).await)?,
        RemoteCommand::FileUrl { id } => match gateway.completed_file_url(&id).await {
            Some(url) => println!("{}", url),
            None => bail!("Remote download endpoint not configured"),
        },
    }
    Ok(())
}
