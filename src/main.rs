use std::io::{self, BufRead};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};

use niura_rs::btle::BtleCentral;
use niura_rs::config::AppConfig;
use niura_rs::coordinator::EegBudsService;
use niura_rs::monitor::BackgroundMonitor;
use niura_rs::parse::decode_base64_frame;
use niura_rs::protocol::encode_command;
use niura_rs::types::Side;
use niura_rs::uploader::HttpUploader;

enum Mode {
    Buds,
    Background,
    Decode(Side),
}

fn parse_args() -> Result<Mode> {
    let mut mode = Mode::Buds;
    let mut side = Side::Left;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--background" => mode = Mode::Background,
            "--decode" => mode = Mode::Decode(side),
            "--side" => {
                side = match args.next().as_deref() {
                    Some("left") => Side::Left,
                    Some("right") => Side::Right,
                    other => bail!("--side expects left or right, got {other:?}"),
                };
            }
            "-h" | "--help" => {
                println!("usage: niura [--background | --decode [--side left|right]]");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    if let Mode::Decode(_) = mode {
        mode = Mode::Decode(side);
    }
    Ok(mode)
}

fn load_config() -> Result<AppConfig> {
    let mut config = match std::env::var("NIURA_CONFIG") {
        Ok(path) => AppConfig::load(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => AppConfig::default(),
    };
    if let Ok(url) = std::env::var("NIURA_BACKEND_URL") {
        config.buds.backend_url = url;
    }
    Ok(config)
}

/// Lines typed on stdin, read on a dedicated OS thread so no `StdinLock` is
/// held across an await.
fn stdin_lines() -> tokio::sync::mpsc::UnboundedReceiver<String> {
    let (line_tx, line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    line_rx
}

/// Resolve on `q` + Enter, Ctrl-C, or end of input.
async fn wait_for_quit() {
    let mut lines = stdin_lines();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received."),
        _ = async {
            while let Some(line) = lines.recv().await {
                if line == "q" {
                    break;
                }
            }
        } => info!("Quit requested."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=niura_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mode = parse_args()?;
    let config = load_config()?;

    match mode {
        Mode::Decode(side) => decode_stdin(side),
        Mode::Background => run_background(config).await,
        Mode::Buds => run_buds(config).await,
    }
}

async fn run_buds(config: AppConfig) -> Result<()> {
    let sink = HttpUploader::new(config.buds.backend_url.clone());
    info!("Posting batches to {}", sink.endpoint());

    let central = BtleCentral::new().await?;
    let service = EegBudsService::new(central, sink, config.buds);

    service.set_on_connection_status_changed(|status| {
        if status.is_connected {
            info!("Connected to both earbuds.");
        } else {
            info!(
                "Earbuds disconnected (left: {}, right: {}).",
                status.left_connected, status.right_connected
            );
        }
    });
    service.set_on_error(|msg| error!("{msg}"));

    info!("Connecting to Niura earbuds …");
    service.connect().await?;
    info!("Streaming started. Press Ctrl-C or type 'q' + Enter to quit.");
    info!("Commands (type + Enter):");
    info!("  q  – quit");
    info!("  b  – start streaming");
    info!("  s  – stop streaming");
    info!("  <any other letter> – send to both earbuds");

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received.");
                break;
            }
            line = lines.recv() => {
                let Some(line) = line else { break };
                let mut chars = line.chars();
                match (chars.next(), chars.next()) {
                    (Some('q'), None) => {
                        info!("Quit requested.");
                        break;
                    }
                    (Some(cmd), None) => {
                        info!("Sending command: '{cmd}'");
                        if let Err(e) = service.send_command(&encode_command(cmd)).await {
                            error!("Command error: {e}");
                        }
                    }
                    (None, _) => {}
                    _ => warn!("Commands are a single letter, got '{line}'"),
                }
            }
        }
    }

    service.disconnect().await?;
    info!("Disconnected – exiting.");
    Ok(())
}

async fn run_background(config: AppConfig) -> Result<()> {
    let central = BtleCentral::new().await?;
    let monitor = BackgroundMonitor::new(central, config.monitor);
    monitor.set_data_callback(|value| println!("[DATA] {value}"));
    monitor.start()?;
    info!("Background monitor running. Press Ctrl-C or type 'q' + Enter to quit.");

    wait_for_quit().await;
    monitor.cleanup().await;
    Ok(())
}

/// Decode base64 notification values, one per line, as captured from a
/// BLE sniffer or a mobile debug log.
fn decode_stdin(side: Side) -> Result<()> {
    let stdin = io::stdin();
    let (mut ok, mut bad) = (0usize, 0usize);
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_base64_frame(line, side) {
            Some(s) => {
                ok += 1;
                println!(
                    "[{}] seq={:3}  ts={}  ch={:+9} {:+9} {:+9}",
                    s.side, s.sequence, s.timestamp, s.channels[0], s.channels[1], s.channels[2]
                );
            }
            None => {
                bad += 1;
                warn!("Not a valid frame: {line}");
            }
        }
    }
    info!("Decoded {ok} frame(s), skipped {bad}.");
    Ok(())
}
