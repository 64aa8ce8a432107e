use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use narrator::{Narrator, NarratorConfig};

const HELP: &str = "commands: p pause | r resume | s stop | c cancel | + faster | - slower | \
f skip forward | b skip back | g <n> go to segment | v <x> volume | q quit";

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    let mut args = std::env::args().skip(1);
    let chapter = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: narrator <chapter.txt> [config.json]"))?;
    let config = match args.next() {
        Some(path) => NarratorConfig::load(&PathBuf::from(path))?,
        None => NarratorConfig::default(),
    }
    .with_env_overrides()?;

    let text = std::fs::read_to_string(&chapter).with_context(|| format!("reading {}", chapter.display()))?;

    // Reactor, poll and fetch tasks all share this one thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, text))
}

async fn run(config: NarratorConfig, text: String) -> Result<()> {
    let narrator = Narrator::connect(&config)?;
    match narrator.backend_health().await {
        Ok(health) if health.is_healthy() => tracing::info!(status = %health.status, "Backend healthy"),
        Ok(health) => tracing::warn!(status = %health.status, "Backend reports degraded health"),
        Err(e) => tracing::warn!(error = %e, "Health probe failed"),
    }

    narrator.play(&text).await?;
    println!("{}", HELP);

    let mut status = narrator.subscribe_status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&narrator, line.trim()).await? {
                    break;
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if let Some(message) = &current.message {
                    println!("[notice] {}", message);
                }
                if current.session.is_none() && current.outcome.is_some() {
                    println!("[done] {:?}", current.outcome);
                    break;
                }
            }
        }
    }

    narrator.shutdown().await;
    Ok(())
}

async fn handle_line(narrator: &Narrator, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let status = match (parts.next(), parts.next()) {
        (None, _) => return Ok(true),
        (Some("q"), _) => return Ok(false),
        (Some("p"), _) => narrator.pause().await?,
        (Some("r"), _) => narrator.resume().await?,
        (Some("s"), _) => narrator.stop().await?,
        (Some("c"), _) => narrator.cancel().await?,
        (Some("+"), _) => {
            let speed = narrator.status().speed + 0.25;
            narrator.set_speed(speed).await?
        }
        (Some("-"), _) => {
            let speed = narrator.status().speed - 0.25;
            narrator.set_speed(speed).await?
        }
        (Some("f"), _) => narrator.skip_forward(1).await?,
        (Some("b"), _) => narrator.skip_backward(1).await?,
        (Some("g"), Some(n)) => narrator.skip_to_segment(n.parse()?).await?,
        (Some("v"), Some(x)) => narrator.set_volume(x.parse()?).await?,
        _ => {
            println!("{}", HELP);
            return Ok(true);
        }
    };
    println!(
        "[{:?}] segment {:?}/{} speed {:.2} volume {:.2}",
        status.state, status.current_index, status.total_segments, status.speed, status.volume
    );
    Ok(true)
}
