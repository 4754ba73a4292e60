mod render;
mod settings;
mod snapshot;

use anyhow::{Context, Result};
use aoc_stream::{
    millis_u64, Connector, DisconnectNotice, FullRefreshSignal, SseConnector, StreamClient,
    StreamError, StreamEvent, WsConnector,
};
use clap::Parser;
use std::io::{self, Write};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::render::{render_json, render_line, render_snapshot};
use crate::settings::{load_settings, Args, TailOptions, TransportKind};
use crate::snapshot::CommandSnapshotFetcher;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file = load_settings(args.config.as_deref())?;
    let options = TailOptions::resolve(args, file)?;
    init_logging(options.debug);

    match options.transport {
        TransportKind::Sse => {
            let connector = SseConnector::new().context("build sse client")?;
            tail(connector, options).await
        }
        TransportKind::Ws => tail(WsConnector::new(), options).await,
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("AOC_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

async fn tail<C: Connector>(connector: C, options: TailOptions) -> Result<()> {
    let fetcher = match options.snapshot_command.as_deref() {
        Some(command) => {
            let fetcher = CommandSnapshotFetcher::new(command)?;
            Some(match options.snapshot_timeout {
                Some(timeout) => fetcher.with_timeout(timeout),
                None => fetcher,
            })
        }
        None => None,
    };

    let mut client = StreamClient::new(options.url.clone(), options.reconnect.clone(), connector)
        .resume_from(options.last_event_id.clone());
    let json = options.json;
    for topic in &options.topics {
        client
            .dispatcher_mut()
            .subscribe(topic.as_str(), move |event: &StreamEvent| print_event(event, json));
    }
    let url = options.url.clone();
    client.dispatcher_mut().on_connect(move || {
        info!(event = "tail_connected", url = %url);
    });
    client
        .dispatcher_mut()
        .on_disconnect(|notice: &DisconnectNotice| match &notice.error {
            Some(err) => warn!(event = "tail_disconnected", reason = ?notice.reason, error = %err),
            None => info!(event = "tail_disconnected", reason = ?notice.reason),
        });
    client.dispatcher_mut().on_error(|err: &StreamError| {
        error!(event = "tail_stream_error", kind = err.error_kind(), error = %err);
    });
    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
    client.on_full_refresh(move |signal: &FullRefreshSignal| {
        let _ = refresh_tx.send(signal.clone());
    });

    let handle = client.spawn();
    if let Some(fetcher) = &fetcher {
        print_snapshot(fetcher, json).await;
    }
    handle.connect().await.context("start stream")?;
    info!(
        event = "tail_started",
        url = %options.url,
        transport = ?options.transport,
        topics = %options.topics.join(",")
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!(event = "tail_interrupted");
                break;
            }
            Some(signal) = refresh_rx.recv() => {
                warn!(
                    event = "tail_full_refresh",
                    outage_ms = millis_u64(signal.outage),
                    last_event_id = signal.last_event_id.as_deref().unwrap_or("")
                );
                match &fetcher {
                    Some(fetcher) => print_snapshot(fetcher, json).await,
                    None => warn!(event = "tail_snapshot_unconfigured"),
                }
            }
        }
    }

    handle.disconnect().await?;
    handle.shutdown().await?;
    Ok(())
}

fn print_event(event: &StreamEvent, json: bool) -> Result<()> {
    let line = if json {
        render_json(event)?
    } else {
        render_line(event)
    };
    let mut out = io::stdout().lock();
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(())
}

async fn print_snapshot(fetcher: &CommandSnapshotFetcher, json: bool) {
    match fetcher.fetch().await {
        Ok(snapshot) => {
            let mut out = io::stdout().lock();
            if let Err(err) = writeln!(out, "{}", render_snapshot(&snapshot, json)) {
                warn!(event = "tail_write_error", error = %err);
            }
        }
        Err(err) => warn!(
            event = "tail_snapshot_error",
            command = fetcher.command(),
            error = %err
        ),
    }
}
