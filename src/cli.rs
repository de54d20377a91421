//! Terminal front end: run a monitoring session, review or export history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::history::{AnyHistoryStore, HistoryStore};
use crate::insights::{air_quality_trend, summarize};
use crate::monitor::{Monitor, MonitorNotice};
use crate::readings::{ChannelTable, Normalizer, SensorReading, AIR_QUALITY};
use crate::session::StopOutcome;
use crate::settings::{Settings, SettingsStore, SourceKind};
use crate::source::realtime::{EventStreamStore, LocalRealtimeHub, RealtimeStore};
use crate::source::simulated::{spawn_hub_feeder, SimulatedTransport, SIMULATED_PORT};
use crate::source::transport::{
    FixedPort, PortSelector, SerialTransport, StdinPortSelector, SystemSerialTransport,
};
use crate::source::{AnySource, ConnectionStatus, RemoteAdapter, SerialAdapter, SourceListener};

const SIMULATED_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "airwatch", version)]
#[command(about = "Record gas-sensor monitoring sessions and review their history")]
#[command(
    after_help = "Environment:\n  AIRWATCH_SETTINGS  Settings file (default ./airwatch.json)\n  AIRWATCH_PORT      Serial port override\n  AIRWATCH_OWNER     History owner override\n  AIRWATCH_DEBUG     Log every frame\n  RUST_LOG           Log filter"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Connect, record one session, save it on exit.
    Monitor {
        #[arg(long)]
        port: Option<String>,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
        #[arg(long, value_enum)]
        source: Option<SourceKind>,
    },
    /// Saved sessions for the current owner (lists them by default).
    History {
        #[command(subcommand)]
        command: Option<HistoryCommand>,
    },
    /// Set the owner key history is stored under.
    Owner {
        #[arg(value_parser = non_blank)]
        key: String,
    },
    /// Set the data source `monitor` uses by default.
    Source {
        #[arg(value_enum)]
        kind: SourceKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum HistoryCommand {
    /// Newest first, with averages and the air-quality trend.
    List,
    /// Print one session (or all of them) as JSON.
    Export { id: Option<String> },
    /// Delete every saved session.
    Clear,
}

fn non_blank(value: &str) -> Result<String, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    Ok(value.to_string())
}

pub async fn execute(command: Option<Commands>, settings: &SettingsStore) -> Result<()> {
    let Some(command) = command else {
        Cli::command().print_long_help()?;
        return Ok(());
    };

    match command {
        Commands::Owner { key } => {
            settings.update_owner_key(&key)?;
            println!("history owner set to {key}");
            Ok(())
        }
        Commands::Source { kind } => {
            settings.update_source(kind)?;
            println!("default source set to {}", kind_name(kind));
            Ok(())
        }
        Commands::Monitor {
            port,
            seconds,
            source,
        } => {
            let mut effective = settings.effective();
            if let Some(port) = port {
                effective.serial.port = Some(port);
            }
            if let Some(source) = source {
                effective.source = source;
            }
            monitor(effective, seconds.map(Duration::from_secs)).await
        }
        Commands::History { command } => {
            let effective = settings.effective();
            let store = AnyHistoryStore::open(&effective.history)?;
            match command.unwrap_or(HistoryCommand::List) {
                HistoryCommand::List => list_history(&store, &effective.owner_key).await,
                HistoryCommand::Export { id } => {
                    export_history(&store, &effective.owner_key, id.as_deref()).await
                }
                HistoryCommand::Clear => {
                    store.clear(&effective.owner_key).await?;
                    println!("history cleared for {}", effective.owner_key);
                    Ok(())
                }
            }
        }
    }
}

fn kind_name(kind: SourceKind) -> String {
    kind.to_possible_value()
        .map(|value| value.get_name().to_string())
        .unwrap_or_else(|| format!("{kind:?}"))
}

/// Keeps the in-process station running for the simulated remote mode.
struct HubFeed {
    cancel_token: CancellationToken,
}

impl Drop for HubFeed {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn build_source(
    settings: &Settings,
    listener: Arc<dyn SourceListener>,
    feed: &mut Option<HubFeed>,
) -> AnySource {
    let normalizer = Arc::new(Normalizer::new(ChannelTable::for_schema(
        settings.channel_schema,
    )));

    match settings.source {
        SourceKind::Serial | SourceKind::Simulated => {
            let transport: Arc<dyn SerialTransport> = if settings.source == SourceKind::Simulated {
                Arc::new(SimulatedTransport::new(SIMULATED_INTERVAL))
            } else {
                Arc::new(SystemSerialTransport::new())
            };
            let selector: Arc<dyn PortSelector> = if settings.source == SourceKind::Simulated {
                Arc::new(FixedPort(SIMULATED_PORT.into()))
            } else if let Some(port) = &settings.serial.port {
                Arc::new(FixedPort(port.clone()))
            } else {
                Arc::new(StdinPortSelector)
            };
            AnySource::Serial(
                SerialAdapter::new(transport, selector, normalizer, listener)
                    .with_baud_rate(settings.serial.baud_rate),
            )
        }
        SourceKind::Remote => {
            let remote = &settings.remote;
            let store: Arc<dyn RealtimeStore> = match &remote.base_url {
                Some(base_url) => Arc::new(EventStreamStore::new(
                    base_url.clone(),
                    remote.liveness_path.clone(),
                )),
                None => {
                    let hub = LocalRealtimeHub::new();
                    let cancel_token = CancellationToken::new();
                    spawn_hub_feeder(
                        hub.clone(),
                        remote.readings_path.clone(),
                        remote.liveness_path.clone(),
                        SIMULATED_INTERVAL,
                        cancel_token.clone(),
                    );
                    *feed = Some(HubFeed { cancel_token });
                    Arc::new(hub)
                }
            };
            AnySource::Remote(
                RemoteAdapter::new(store, normalizer, listener)
                    .with_paths(remote.readings_path.clone(), remote.liveness_path.clone()),
            )
        }
    }
}

async fn monitor(settings: Settings, limit: Option<Duration>) -> Result<()> {
    let store = Arc::new(AnyHistoryStore::open(&settings.history)?);
    log::info!("history: {}", store.describe());

    let mut feed = None;
    let mut monitor = Monitor::new(
        |listener| build_source(&settings, listener, &mut feed),
        store,
        settings.owner_key.clone(),
    );
    let mut notices = monitor.notices();

    if let Err(err) = monitor.connect().await {
        if err.is_benign() {
            println!("no device selected");
            return Ok(());
        }
        return Err(err).context("failed to connect data source");
    }
    let description = monitor.describe_source().await;
    if monitor.wait_for_connection().await != ConnectionStatus::Connected {
        bail!("{description} did not come up");
    }
    println!("connected: {description}");

    let id = monitor.start().await?;
    println!("session {id} recording (Ctrl-C to stop)");

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            notice = notices.recv() => match notice {
                Ok(MonitorNotice::Reading(reading)) => println!("{}", format_reading(&reading)),
                Ok(MonitorNotice::StatusChanged(status)) => println!("source {status}"),
                Ok(MonitorNotice::SessionFinished(outcome)) => {
                    print_outcome(&outcome);
                    monitor.disconnect().await;
                    return Ok(());
                }
                Ok(MonitorNotice::SessionLost { id, reason }) => {
                    bail!("session {id} was not saved: {reason}");
                }
                Ok(MonitorNotice::SessionStarted { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("display fell behind; {skipped} updates skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let outcome = monitor.shutdown().await?;
    print_outcome(&outcome);
    drop(feed);
    Ok(())
}

fn format_reading(reading: &SensorReading) -> String {
    let channels: Vec<String> = reading
        .channels
        .iter()
        .map(|(name, value)| format!("{name}={value:.1}"))
        .collect();
    format!("{}  {}", reading.timestamp.format("%H:%M:%S"), channels.join("  "))
}

fn print_outcome(outcome: &StopOutcome) {
    match outcome {
        StopOutcome::Idle => println!("no session was running"),
        StopOutcome::Discarded { id } => println!("session {id} had no readings; discarded"),
        StopOutcome::Persisted { id, readings } => {
            println!("session {id} saved with {readings} readings")
        }
    }
}

async fn list_history<S: HistoryStore>(store: &S, owner_key: &str) -> Result<()> {
    let sessions = store.list(owner_key).await?;
    if sessions.is_empty() {
        println!("no sessions recorded for {owner_key}");
        return Ok(());
    }

    for session in &sessions {
        let summary = summarize(session);
        let duration = summary
            .duration_secs
            .map(|secs| format!("{secs}s"))
            .unwrap_or_else(|| "open".to_string());
        let air_quality = summary
            .averages
            .get(AIR_QUALITY)
            .copied()
            .unwrap_or(0.0);
        println!(
            "{}  {}  {:>6}  {:>4} readings  aq {:>6.1}  {:>5.1}%  {}",
            summary.id,
            summary.start_time.format("%Y-%m-%d %H:%M"),
            duration,
            summary.reading_count,
            air_quality,
            summary.breath_quality_index,
            summary.air_quality_band,
        );
    }

    let trend: Vec<String> = air_quality_trend(&sessions)
        .iter()
        .map(|point| format!("{:.0}", point.air_quality))
        .collect();
    println!("air quality trend: {}", trend.join(" -> "));
    Ok(())
}

async fn export_history<S: HistoryStore>(
    store: &S,
    owner_key: &str,
    id: Option<&str>,
) -> Result<()> {
    let json = match id {
        Some(id) => {
            let session = store
                .get(owner_key, id)
                .await?
                .ok_or_else(|| anyhow!("no session {id} for {owner_key}"))?;
            serde_json::to_string_pretty(&session)?
        }
        None => serde_json::to_string_pretty(&store.list(owner_key).await?)?,
    };
    println!("{json}");
    Ok(())
}
