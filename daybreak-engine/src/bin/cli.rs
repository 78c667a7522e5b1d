//! Command-line interface for the daybreak engine.
//!
//! This binary provides a CLI for inspecting and poking the engine
//! daemon via the HTTP API.

use std::env;

use anyhow::Result;

use daybreak_engine::api_client;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: daybreak-cli <command>");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  status     Show engine status");
        eprintln!("  list       List alarms");
        eprintln!("  refresh    Trigger a weather refresh sweep");
        eprintln!();
        eprintln!("Environment:");
        eprintln!(
            "  DAYBREAK_API_URL    API base URL (default: {})",
            api_client::DEFAULT_BASE_URL
        );
        std::process::exit(1);
    }

    let command = &args[1];

    match command.as_str() {
        "status" => cmd_status().await?,
        "list" => cmd_list().await?,
        "refresh" => cmd_refresh().await?,
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Build an API client, honoring DAYBREAK_API_URL if set.
fn make_client() -> api_client::Client {
    match env::var("DAYBREAK_API_URL") {
        Ok(url) => api_client::Client::with_base_url(url),
        Err(_) => api_client::Client::new(),
    }
}

/// Print a summary of the current engine state.
async fn cmd_status() -> Result<()> {
    let client = make_client();
    let state = client.get_status().await?;

    println!("Uptime:        {} s", state.uptime_secs);
    println!(
        "Alarms:        {} ({} smart)",
        state.alarm_count, state.smart_alarm_count
    );
    println!("Notifications: {} pending", state.pending_notifications);

    match state.next_alarm {
        Some(next) => println!(
            "Next alarm:    {} at {}",
            next.name,
            next.fire_at.with_timezone(&chrono::Local)
        ),
        None => println!("Next alarm:    (none)"),
    }

    Ok(())
}

/// Print every alarm, one per line.
async fn cmd_list() -> Result<()> {
    let client = make_client();
    let alarms = client.list_alarms().await?;

    if alarms.is_empty() {
        println!("No alarms.");
        return Ok(());
    }
    for alarm in &alarms {
        let flags = match (alarm.enabled, alarm.smart_enabled) {
            (true, true) => "enabled, smart",
            (true, false) => "enabled",
            (false, true) => "disabled, smart",
            (false, false) => "disabled",
        };
        let adjusted = match &alarm.current_adjustment {
            Some(adj) => format!("  [{:+} min]", -adj.adjustment_minutes),
            None => String::new(),
        };
        println!(
            "  {}  {}  ({flags}){adjusted}",
            alarm.display_time(),
            alarm.name
        );
    }

    Ok(())
}

/// Ask the daemon to sweep for weather refreshes.
async fn cmd_refresh() -> Result<()> {
    let client = make_client();
    client.trigger_refresh().await?;
    println!("Refresh requested.");
    Ok(())
}
