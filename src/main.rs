//! `boardsync-watch`: keeps one entity kind live and logs every change.
//!
//! Reads the `BOARDSYNC_*` variables of [`SyncConfig::from_env`] and
//! `BOARDSYNC_WATCH_KIND` (`ticket`, `project`, `bug` or `calendar`; default
//! `ticket`). Log output follows `RUST_LOG`.

use std::process::ExitCode;
use std::sync::Arc;

use boardsync::prelude::*;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_WATCH_KIND: &str = "ticket";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,boardsync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let kind = match std::env::var("BOARDSYNC_WATCH_KIND")
        .unwrap_or_else(|_| DEFAULT_WATCH_KIND.to_string())
        .parse::<EntityKind>()
    {
        Ok(kind) => kind,
        Err(error) => {
            tracing::error!(%error, "invalid BOARDSYNC_WATCH_KIND");
            return ExitCode::FAILURE;
        }
    };

    let session = Arc::new(SessionContext::init(Arc::new(FileCredentialStore::new(
        &config.credential_file,
    ))));
    match session.current_user() {
        Some(user) => tracing::info!(user = %user.id, "session restored"),
        None => tracing::info!("no stored credential, watching anonymously"),
    }
    tracing::info!(base_url = %config.base_url, %kind, "starting live feed");

    let core = SyncCore::new(config, Arc::clone(&session));
    let _observation = core.store().observe(kind, move |entities| {
        tracing::info!(%kind, count = entities.len(), "collection changed");
    });
    let feed = core.watch(LiveFeedSpec::new(kind).with_default_scopes(&session));
    for (filter, status) in feed.watch_statuses() {
        tokio::spawn(log_status(filter, status));
    }

    let mut session_state = session.watch();
    let exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("interrupted, shutting down");
                ExitCode::SUCCESS
            }
            Err(error) => {
                tracing::error!(%error, "cannot listen for Ctrl-C");
                ExitCode::FAILURE
            }
        },
        _ = session_state.wait_for(|state| *state == SessionState::Invalidated) => {
            tracing::error!("session invalidated, sign in again");
            ExitCode::FAILURE
        }
    };

    feed.cancel();
    exit
}

async fn log_status(filter: TopicFilter, mut status: watch::Receiver<ConnectionStatus>) {
    loop {
        let current = *status.borrow_and_update();
        tracing::info!(%filter, status = %current, "push connection");
        if current == ConnectionStatus::Closed || status.changed().await.is_err() {
            break;
        }
    }
}
