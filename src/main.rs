//! Pulse CLI - run the live city pulse, simulate it offline, or inspect geometry.

use anyhow::{Context, Result};
use clap::Parser;
use pulse::aggregator::{Aggregator, PollOutcome};
use pulse::config::PulseConfig;
use pulse::curve::CurveSet;
use pulse::engine::Visualizer;
use pulse::feed::{HttpFeedClient, ScriptedFeed};
use pulse::field::AnchorLayout;
use pulse::runtime::{RunOptions, Runtime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "pulse")]
#[command(about = "Render a city's live pulse as particles flowing along curves")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "pulse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Poll the live feeds and animate until Ctrl-C
    Live {
        /// Poll only this road, at the faster focus cadence
        #[arg(short, long)]
        focus: Option<String>,

        /// Seconds between status lines
        #[arg(long)]
        log_every: Option<u64>,

        /// Seed for particle phases and oscillator jitter
        #[arg(short = 'S', long)]
        seed: Option<u64>,
    },

    /// Run against a seeded synthetic feed and write a JSON summary
    Simulate {
        /// Seed for the synthetic feed and the animation
        #[arg(short = 'S', long, default_value = "42")]
        seed: u64,

        /// Number of poll cycles
        #[arg(short, long, default_value = "10")]
        cycles: usize,

        /// Frames rendered between cycles
        #[arg(long, default_value = "120")]
        frames: usize,

        /// Output file path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a curve file and print its curves and anchors
    Curves {
        /// Curve file (defaults to geometry.curves)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pulse=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PulseConfig::load(Path::new(&cli.config))?;

    match cli.command {
        Commands::Live {
            focus,
            log_every,
            seed,
        } => {
            if let Some(secs) = log_every {
                config.frame.status_every = secs;
            }
            let curves = load_curves(&config, None)?;
            let client = HttpFeedClient::new(&config.feeds.base_url, config.feeds.fetch_timeout())
                .context("building HTTP client")?;
            let seed = seed.unwrap_or_else(rand::random);

            println!("Polling {} every {}s...", config.feeds.base_url, config.feeds.interval);
            if let Some(road) = &focus {
                println!("Focused on {} ({}s cadence)", road, config.feeds.focus_interval);
            }

            let runtime = Runtime::start(config, Arc::new(client), curves, RunOptions { focus, seed })?;
            tokio::signal::ctrl_c().await?;
            info!("interrupt received, shutting down");
            runtime.shutdown().await;
        }

        Commands::Simulate {
            seed,
            cycles,
            frames,
            output,
        } => {
            let curves = load_curves(&config, None)?;
            let summary = simulate(&config, curves, seed, cycles, frames).await?;
            let text = serde_json::to_string_pretty(&summary)?;
            match output {
                Some(path) => {
                    fs::write(&path, text)?;
                    println!("Saved simulation to {}", path.display());
                }
                None => println!("{}", text),
            }
        }

        Commands::Curves { path } => {
            let curves = load_curves(&config, path.as_deref())?;
            let layout = AnchorLayout::resolve(&config.anchors, &curves)?;

            println!("{} curves", curves.len());
            for (i, curve) in curves.iter().enumerate() {
                println!(
                    "  [{:2}] {:3} control points, length {:.3}",
                    i,
                    curve.control_points().len(),
                    curve.length()
                );
            }
            println!("{} anchors", layout.len());
            for anchor in layout.anchors(&Default::default()) {
                let p = anchor.position;
                println!(
                    "  {:<12} ({:+.3}, {:+.3}, {:+.3})",
                    anchor.key, p.x, p.y, p.z
                );
            }
        }
    }

    Ok(())
}

fn load_curves(config: &PulseConfig, path: Option<&Path>) -> Result<CurveSet> {
    let path = path.unwrap_or_else(|| Path::new(&config.geometry.curves));
    CurveSet::load(path, config.particles.resample_points)
        .with_context(|| format!("loading curves from {}", path.display()))
}

/// Script one synthetic reading per source, drawn fresh every cycle so the
/// blend has something to smooth.
fn script_cycle(feed: &ScriptedFeed, config: &PulseConfig, rng: &mut StdRng, cycle: usize) {
    for road in &config.feeds.roads {
        // Roughly one failure in twelve.
        if rng.gen_ratio(1, 12) {
            feed.fail(&road.path, "simulated outage");
            continue;
        }
        feed.respond(
            &road.path,
            json!({
                "score": rng.gen_range(5.0..95.0),
                "current_speed": rng.gen_range(2.0..40.0),
            }),
        );
    }

    let buses = rng.gen_range(0..90);
    let trams = rng.gen_range(0..20);
    let vehicles: Vec<_> = (0..buses + trams)
        .map(|i| json!({"vehicle_type": if i < buses { "bus" } else { "tram" }}))
        .collect();
    feed.respond(&config.feeds.vehicles_path, json!({ "raw": vehicles }));

    let descriptions = ["Clear sky", "Partly cloudy", "Overcast", "Light rain", "Fog"];
    feed.respond(
        &config.feeds.weather_path,
        json!({
            "temperature": rng.gen_range(-2.0..24.0),
            "description": descriptions[cycle % descriptions.len()],
        }),
    );
    feed.respond(
        &config.feeds.energy_path,
        json!({
            "carbon_intensity": rng.gen_range(40.0..480.0),
            "dominant_fuel": "gas",
        }),
    );
}

async fn simulate(
    config: &PulseConfig,
    curves: CurveSet,
    seed: u64,
    cycles: usize,
    frames: usize,
) -> Result<serde_json::Value> {
    let feed = Arc::new(ScriptedFeed::new());
    let mut aggregator = Aggregator::new(feed.clone(), config.feeds.clone());
    let handle = aggregator.handle();
    let mut visualizer = Visualizer::new(config.clone(), curves, seed)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let dt = 1.0 / config.frame.fps as f32;
    let mut clock_ms: i64 = 0;
    let mut time = 0.0f32;
    let mut stale = 0;

    for cycle in 0..cycles {
        script_cycle(&feed, config, &mut rng, cycle);
        clock_ms += config.feeds.interval as i64 * 1000;
        if aggregator.poll(clock_ms).await == PollOutcome::Stale {
            stale += 1;
        }

        let snapshot = handle.current();
        for _ in 0..frames {
            visualizer.frame(dt, time, &snapshot);
            time += dt;
        }
        visualizer.record_sample(clock_ms);
    }

    info!(cycles, stale, "simulation finished");
    Ok(json!({
        "seed": seed,
        "cycles": cycles,
        "stale_cycles": stale,
        "snapshot": handle.current().as_ref(),
        "visual": visualizer.summary(),
    }))
}
