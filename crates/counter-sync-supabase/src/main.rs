use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use counter_sync_core::{AuthProvider, BackendConnector, ConnectorEvent};
use counter_sync_local::LocalDatabase;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use counter_sync_supabase::{
    Command, Config, GoTrueClient, PostgrestClient, SupabaseConnector, UploadScheduler,
};

/// Poll interval for `watch`, which also picks up writes from other processes.
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    let db_path = config.database_path();
    let session_path = config.session_path();
    for path in [&db_path, &session_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let gotrue = GoTrueClient::new(http.clone(), &config.supabase_url, &config.supabase_anon_key)
        .with_session_file(session_path);
    let auth: Arc<dyn AuthProvider> = Arc::new(gotrue);
    let remote = Arc::new(PostgrestClient::new(
        http,
        &config.supabase_url,
        &config.supabase_anon_key,
        auth.clone(),
    ));

    let connector = Arc::new(SupabaseConnector::new(
        config.powersync_url.clone(),
        auth,
        remote,
    ));
    connector.register_listener(|event| match event {
        ConnectorEvent::Initialized => debug!("Connector initialized"),
        ConnectorEvent::SessionStarted(session) => {
            info!("Session started for user {}", session.user.id)
        }
        ConnectorEvent::SessionEnded => info!("Session ended"),
    });
    connector.init().await;

    let db = Arc::new(LocalDatabase::open(&db_path)?);
    let scheduler = UploadScheduler::new(connector.clone(), db.clone(), config.retry_policy());

    match config.command {
        Command::Create => {
            let owner = ensure_user(&connector).await?;
            let counter = db.create_counter(&owner)?;
            println!("Created counter {} (count {})", counter.id, counter.count);
            upload_pending(&scheduler).await;
        }
        Command::Increment => {
            let owner = ensure_user(&connector).await?;
            let counter = db.increment_counter(&owner)?;
            println!("Counter {} is now {}", counter.id, counter.count);
            upload_pending(&scheduler).await;
        }
        Command::Delete => {
            let owner = ensure_user(&connector).await?;
            let Some(counter) = db.counter_for_owner(&owner)? else {
                bail!("User {} has no counter", owner);
            };
            db.delete_counter(&counter.id)?;
            println!("Deleted counter {}", counter.id);
            upload_pending(&scheduler).await;
        }
        Command::List => {
            let me = connector.user_id().await;
            for counter in db.counters()? {
                let marker = if me.as_deref() == Some(counter.owner_id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {}  {:>6}  owner {}  created {}",
                    marker, counter.id, counter.count, counter.owner_id, counter.created_at
                );
            }
        }
        Command::Upload => {
            let uploaded = scheduler.drain().await?;
            println!("Uploaded {} transaction(s)", uploaded);
        }
        Command::Status => {
            match connector.current_session().await {
                Some(session) => println!(
                    "User: {}{}",
                    session.user.id,
                    if session.user.is_anonymous { " (anonymous)" } else { "" }
                ),
                None => println!("User: signed out"),
            }
            match connector.fetch_credentials().await {
                Ok(creds) => println!("Sync endpoint: {}", creds.endpoint),
                Err(e) => println!("Sync endpoint: unavailable ({})", e),
            }
            println!("Pending uploads: {}", db.pending_count()?);
        }
        Command::Login { email, password } => {
            connector.login(&email, &password).await?;
            println!("Signed in as {}", email);
        }
        Command::Logout => {
            connector.logout().await;
            println!("Signed out");
        }
        Command::Watch => {
            info!("Watching {} for local changes", db_path.display());
            let changes = change_ticks(db.subscribe());
            let mut shutdown_rx = create_shutdown_signal();
            tokio::select! {
                _ = scheduler.run(changes) => {},
                _ = shutdown_rx.wait_for(|&v| v) => {},
            }
            info!("Stopped watching");
        }
    }

    Ok(())
}

/// Sign in anonymously unless a session exists, and return the user id.
async fn ensure_user(connector: &SupabaseConnector) -> anyhow::Result<String> {
    connector.sign_in_anonymously().await?;
    connector
        .user_id()
        .await
        .context("Sign-in finished without a session")
}

/// Local writes are already committed; an upload failure only delays them.
async fn upload_pending(scheduler: &UploadScheduler) {
    match scheduler.drain().await {
        Ok(n) => debug!("Uploaded {} transaction(s)", n),
        Err(e) => warn!("Change saved locally, upload will be retried: {}", e),
    }
}

/// Merge local commit notifications with a periodic tick.
fn change_ticks(mut commits: watch::Receiver<u64>) -> watch::Receiver<u64> {
    let (tx, rx) = watch::channel(0u64);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(WATCH_POLL_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                changed = commits.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {},
            }
            if tx.is_closed() {
                break;
            }
            tx.send_modify(|v| *v = v.wrapping_add(1));
        }
    });

    rx
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down"),
                Err(e) => {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, shutting down");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
