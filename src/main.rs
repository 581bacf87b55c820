use anyhow::{Context, Result};
use media_window::api::ServerApi;
use media_window::backend::HttpBackend;
use media_window::cache::{spawn_cache_cleanup, MediaCache};
use media_window::config::Settings;
use media_window::navigation::{Direction, NavigationController};
use media_window::preload::PreloadScheduler;
use media_window::realtime::spawn_realtime;
use media_window::sync::{SyncCoordinator, SyncRole};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// How often a guest asks the server for the host state while the channel is down.
const POLL_FALLBACK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("media_window=info")),
        )
        .init();

    let config_path = std::env::var_os("MEDIA_WINDOW_CONFIG").map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref()).context("failed to load settings")?;
    tracing::info!("Using media server at {}", settings.server.url);

    let api = ServerApi::new(&settings.server).context("failed to create API client")?;
    let device = settings.navigation.device;
    let cache = MediaCache::shared(settings.cache.capacity_for(device));
    let backend = Arc::new(HttpBackend::new(api.clone()));
    let preloader = PreloadScheduler::new(cache.clone(), backend.clone(), settings.preload.timeout());
    let preload_worker = preloader.spawn_worker();
    let cleanup = spawn_cache_cleanup(cache.clone(), settings.cache.cleanup_interval_for(device));

    let api = Arc::new(api);
    let mut nav = NavigationController::new(
        settings.clone(),
        api.clone(),
        backend,
        cache,
        preloader,
    );
    let mut sync = SyncCoordinator::new(api.clone(), api.session_id(), settings.sync.clone());
    let (realtime, mut sync_events) = spawn_realtime(
        api.base_url().to_string(),
        api.session_id().to_string(),
        &settings.sync,
    );
    sync.attach_channel(realtime.link());

    if let Err(e) = sync.refresh_status(&mut nav).await {
        tracing::warn!("Could not query sync status: {}", e);
    }
    if nav.category_id().is_none() {
        if let Some(category) = settings.navigation.start_category.as_deref() {
            if let Err(e) = nav.enter_category(category, None, 0).await {
                tracing::error!("Failed to open {}: {}", category, e);
            }
        }
    }
    print_status(&nav, &sync);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(POLL_FALLBACK);
    let mut channel_open = true;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match run_command(line.trim(), &mut nav, &mut sync).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {}", e),
                }
                if let Err(e) = sync.publish(&mut nav).await {
                    tracing::warn!("Failed to publish position: {}", e);
                }
            }
            Some(completion) = nav.next_completion() => {
                nav.apply_completion(completion).await;
                if let Err(e) = sync.publish(&mut nav).await {
                    tracing::warn!("Failed to publish position: {}", e);
                }
            }
            event = sync_events.recv(), if channel_open => {
                match event {
                    Some(event) => {
                        if let Err(e) = sync.handle_event(&mut nav, event).await {
                            tracing::warn!("Sync: {}", e);
                        }
                    }
                    None => channel_open = false,
                }
            }
            _ = poll.tick() => {
                if sync.role() == SyncRole::Guest && !sync.is_connected() {
                    if let Err(e) = sync.poll_current(&mut nav).await {
                        tracing::debug!("Sync poll failed: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    realtime.shutdown().await;
    nav.shutdown();
    preload_worker.abort();
    cleanup.abort();
    Ok(())
}

/// Execute one console command. Returns `false` on quit.
async fn run_command(
    line: &str,
    nav: &mut NavigationController,
    sync: &mut SyncCoordinator,
) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(true);
    };

    match command {
        "next" | "n" => report_move(nav.navigate(Direction::Next).await?),
        "prev" | "p" => report_move(nav.navigate(Direction::Prev).await?),
        "tap" | "t" => {
            nav.navigate(Direction::Toggle).await?;
        }
        "enter" | "e" => {
            let category = parts.next().context("usage: enter <category> [index]")?;
            let index = parts.next().map(str::parse).transpose().context("invalid index")?;
            report_move(nav.select_category(category, index.unwrap_or(0)).await?);
        }
        "jump" | "j" => {
            let index: usize = parts
                .next()
                .context("usage: jump <index>")?
                .parse()
                .context("invalid index")?;
            report_move(nav.select_index(index).await?);
        }
        "sync" => match parts.next() {
            Some("on") => {
                let role = sync.enable(nav).await?;
                println!("sync: {:?}", role);
            }
            Some("off") => sync.disable(nav).await?,
            _ => {
                let role = sync.refresh_status(nav).await?;
                println!("sync: {:?} (connected: {})", role, sync.is_connected());
            }
        },
        "pressure" => nav.relieve_memory_pressure().await,
        "status" | "s" => {}
        "quit" | "q" => return Ok(false),
        other => {
            println!("unknown command: {}", other);
            return Ok(true);
        }
    }
    print_status(nav, sync);
    Ok(true)
}

fn report_move(moved: bool) {
    if !moved {
        println!("(no move)");
    }
}

fn print_status(nav: &NavigationController, sync: &SyncCoordinator) {
    let snapshot = nav.snapshot();
    match snapshot.category_id {
        Some(category) => println!(
            "[{}] {}/{}{} {} {:?}{} sync={:?}",
            category,
            snapshot.index + 1,
            snapshot.len,
            if snapshot.has_more { "+" } else { "" },
            snapshot.url.unwrap_or_default(),
            snapshot.phase,
            if snapshot.locked { " (locked)" } else { "" },
            sync.role(),
        ),
        None => println!("no category, sync={:?}", sync.role()),
    }
}
