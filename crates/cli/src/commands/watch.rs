use anyhow::{bail, Result};
use chrono::Local;
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use checkin_client::config::ClientConfig;
use checkin_client::relay::{ConnectionState, RealtimeRelay, WsTransport};
use checkin_common::notice::Notice;
use checkin_common::protocol::events::InboundEvent;

use crate::output::{print_output, print_warning, OutputFormat};

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Stop after this many events
    #[arg(long)]
    pub count: Option<u64>,
}

/// One printed line of the event stream.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WatchLine {
    ViewerCount { count: u64, event: Value },
    Notice { notice: Notice, event: Value },
    Event { event: Value },
    State { state: &'static str },
}

impl WatchLine {
    fn from_event(event: &InboundEvent) -> Self {
        match event {
            InboundEvent::ViewerCount { count, raw } => Self::ViewerCount { count: *count, event: raw.clone() },
            other => match other.action().and_then(Notice::for_action) {
                Some(notice) => Self::Notice { notice, event: other.to_value() },
                None => Self::Event { event: other.to_value() },
            },
        }
    }

    fn from_state(state: ConnectionState) -> Self {
        let state = match state {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        Self::State { state }
    }

    fn render_human(&self) -> String {
        let time = Local::now().format("%H:%M:%S");
        match self {
            Self::ViewerCount { count, .. } => format!("{time}  viewers: {count}"),
            Self::Notice { notice, .. } => match &notice.detail {
                Some(detail) => format!("{time}  [{}] {}: {detail}", notice.severity.as_str(), notice.summary),
                None => format!("{time}  [{}] {}", notice.severity.as_str(), notice.summary),
            },
            Self::Event { event } => format!("{time}  event: {event}"),
            Self::State { state } => format!("{time}  -- {state}"),
        }
    }
}

pub async fn run(args: WatchArgs, config: &ClientConfig, format: OutputFormat) -> Result<()> {
    let relay_config = config.relay_config()?;
    if !relay_config.enabled {
        print_warning(
            format,
            "REALTIME_DISABLED",
            "real-time events are disabled; set CHECKIN_USE_WEBSOCKET=true or realtime.enabled in config.toml",
        );
        return Ok(());
    }

    let relay = RealtimeRelay::new(relay_config, WsTransport);
    let mut events = relay.subscribe();
    let mut state_rx = relay.watch_state();
    relay.connect();

    let mut seen: u64 = 0;
    loop {
        if args.count.is_some_and(|limit| seen >= limit) {
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if format == OutputFormat::Human {
                    let line = WatchLine::from_state(state);
                    print_output(format, &line, WatchLine::render_human)?;
                }
                if state == ConnectionState::Disconnected && !relay.has_connection() {
                    relay.shutdown().await;
                    bail!("event stream closed by {}", relay.config().ws_url);
                }
            }
            received = events.recv() => match received {
                Ok(event) => {
                    seen += 1;
                    let line = WatchLine::from_event(&event);
                    print_output(format, &line, WatchLine::render_human)?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "output fell behind the event stream");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    relay.shutdown().await;
    Ok(())
}
