//! The daybreak engine daemon.
//!
//! Composition root: opens the store, wires the limiter, coordinator,
//! refresh loop and API server together, and runs until interrupted.

use std::env;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use daybreak_engine::api::server::{self, ApiState};
use daybreak_engine::calc::{CalcConfig, CalculationClient};
use daybreak_engine::coordinator::Coordinator;
use daybreak_engine::limiter::{LimiterConfig, RateLimiter};
use daybreak_engine::notify::{LocalNotificationScheduler, NotificationScheduler};
use daybreak_engine::profile::UserProfile;
use daybreak_engine::refresh::{RefreshConfig, RefreshLoop};
use daybreak_engine::store::AlarmStore;
use daybreak_engine::tracing::prelude::*;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7764";
const DEFAULT_DATA_DIR: &str = "daybreak-data";

fn profile_from_env() -> UserProfile {
    let mut profile = UserProfile::default();
    if let Ok(text) = env::var("DAYBREAK_PREP_MINUTES") {
        match text.parse() {
            Ok(minutes) => profile.preparation_minutes = minutes,
            Err(_) => warn!(value = %text, "Ignoring unparseable DAYBREAK_PREP_MINUTES"),
        }
    }
    if let Ok(text) = env::var("DAYBREAK_SNOOZE_COUNT") {
        match text.parse() {
            Ok(count) => profile.typical_snooze_count = count,
            Err(_) => warn!(value = %text, "Ignoring unparseable DAYBREAK_SNOOZE_COUNT"),
        }
    }
    profile
}

#[tokio::main]
async fn main() -> Result<()> {
    daybreak_engine::tracing::init();

    let data_dir = env::var("DAYBREAK_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.into());
    let listen_addr =
        env::var("DAYBREAK_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.into());
    let mut calc_config = CalcConfig::default();
    if let Ok(url) = env::var("DAYBREAK_CALC_URL") {
        calc_config.endpoint = url;
    }

    let store = Arc::new(AlarmStore::open(&data_dir));
    info!(alarms = store.len(), data_dir = %data_dir, "Alarm store loaded");

    let (limiter, batch_rx) = RateLimiter::new(LimiterConfig::default());
    let calc = Arc::new(
        CalculationClient::new(calc_config).context("configuring the calculation client")?,
    );
    let notifier = Arc::new(LocalNotificationScheduler::new());

    let (coordinator, coordinator_handle) = Coordinator::new(
        Arc::clone(&store),
        Arc::clone(&limiter),
        calc,
        Arc::clone(&notifier) as Arc<dyn NotificationScheduler>,
        profile_from_env(),
        batch_rx,
    );
    let (refresh, refresh_handle) = RefreshLoop::new(
        Arc::clone(&store),
        limiter,
        coordinator_handle.clone(),
        RefreshConfig::default(),
    );

    let cancellation = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(coordinator.run(cancellation.clone())),
        tokio::spawn(refresh.run(cancellation.clone())),
    ];

    let state = Arc::new(ApiState {
        store,
        coordinator: coordinator_handle,
        refresh: refresh_handle,
        notifier,
        started: Instant::now(),
    });
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    let api = tokio::spawn(server::serve(listener, state, cancellation.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    cancellation.cancel();

    futures::future::join_all(tasks).await;
    api.await.context("API server task")??;
    Ok(())
}
