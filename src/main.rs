use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{Duration, NaiveDateTime};
use clap::{Parser, Subcommand};
use irrigation_advisor::{
    Clock, Database, FeatureBuilder, ModelContext, ModelStore, SimulatedSensors, SystemClock,
    config::AppConfig, export_feature_matrix, predict, simulate_history, train,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "irrigation-advisor")]
#[command(about = "Predict next-hour irrigation needs from sector sensor history")]
struct Args {
    /// Print results as JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the classifier on a sector's history and save it
    Train {
        #[arg(long)]
        sector: String,
    },
    /// Recommend whether to irrigate a sector in the next hour
    Predict {
        #[arg(long)]
        sector: String,
        /// Sensor value as Name=value (e.g. Humidity=42.5); prompted if omitted
        #[arg(long = "reading", value_parser = parse_reading)]
        readings: Vec<(String, f64)>,
        /// Prediction time as "YYYY-MM-DD HH:MM"; defaults to one hour from now
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<NaiveDateTime>,
    },
    /// Generate hourly readings and irrigations for the last N days
    Simulate {
        #[arg(long)]
        sector: String,
        #[arg(long)]
        humidity_sensor: String,
        #[arg(long)]
        ph_sensor: String,
        #[arg(long)]
        phosphorus_sensor: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// Seed for reproducible histories; random when omitted
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Write a sector's hourly feature matrix to CSV
    Export {
        #[arg(long)]
        sector: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Show the saved model
    ModelInfo,
}

fn parse_reading(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected Name=value, got '{}'", s))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number", value.trim()))?;
    Ok((name.trim().to_string(), value))
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("irrigation_advisor=debug");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    rt.block_on(run(args.command, args.json, config))
}

async fn run(command: Command, json: bool, config: AppConfig) -> Result<()> {
    let model_store = ModelStore::new(&config.model.path);
    let features = FeatureBuilder::new(config.features.fill_policy);

    match command {
        Command::Train { sector } => {
            let database = Database::new(&config.database.url).await?;
            let mut ctx = ModelContext::new();

            let outcome = train(
                &database,
                &SystemClock,
                &model_store,
                &mut ctx,
                &sector,
                &features,
                &config.training,
            )
            .await
            .with_context(|| format!("Training failed for sector {}", sector))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }

            println!(
                "Model trained for sector {} on {} rows ({} held out).",
                sector, outcome.train_samples, outcome.test_samples
            );
            println!("Features: {}", outcome.feature_names.join(", "));
            match &outcome.report {
                Some(report) => {
                    println!("Accuracy: {:.2}", report.accuracy);
                    println!("{}", report);
                }
                None => println!("Not enough rows to hold out an evaluation set."),
            }
            println!("Saved to {}", model_store.path().display());
        }

        Command::Predict {
            sector,
            readings,
            at,
        } => {
            let mut ctx = ModelContext::new();
            if !ctx.reload(&model_store)? {
                bail!(
                    "No trained model at {}; run `train` first",
                    model_store.path().display()
                );
            }

            let mut current: HashMap<String, f64> = readings.into_iter().collect();
            for name in ctx.sensor_feature_names() {
                if !current.contains_key(&name) {
                    let value = prompt_value(&name)?;
                    current.insert(name, value);
                }
            }

            let at = at.unwrap_or_else(|| default_prediction_time(&SystemClock));
            let prediction = predict(&ctx, &sector, &current, at)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&prediction)?);
                return Ok(());
            }

            println!("{}", prediction.label());
            println!("Probability of irrigation: {:.2}", prediction.probability);
        }

        Command::Simulate {
            sector,
            humidity_sensor,
            ph_sensor,
            phosphorus_sensor,
            days,
            seed,
        } => {
            let database = Database::new(&config.database.url).await?;
            database.insert_sector(&sector, None, None).await?;
            database.insert_sensor(&humidity_sensor, "humidity", &sector).await?;
            database.insert_sensor(&ph_sensor, "ph", &sector).await?;
            database
                .insert_sensor(&phosphorus_sensor, "phosphorus", &sector)
                .await?;

            let sensors = SimulatedSensors {
                humidity: humidity_sensor,
                ph: ph_sensor,
                phosphorus: phosphorus_sensor,
            };
            let summary = simulate_history(
                &database,
                &SystemClock,
                &sector,
                &sensors,
                days,
                seed.unwrap_or_else(rand::random),
            )
            .await?;

            println!(
                "Simulated {} hours for sector {}: {} readings, {} irrigations.",
                summary.hours, sector, summary.readings, summary.irrigations
            );
        }

        Command::Export { sector, out } => {
            let database = Database::new(&config.database.url).await?;
            let path = export_feature_matrix(&database, &SystemClock, &features, &sector, &out).await?;
            println!("Saved to {}", path.display());
        }

        Command::ModelInfo => {
            let mut ctx = ModelContext::new();
            ctx.reload(&model_store)?;
            let Some(artifact) = ctx.artifact() else {
                println!("No model saved at {}", model_store.path().display());
                return Ok(());
            };

            println!("{}", artifact.summary());
            let importances = artifact.classifier.feature_importances();
            for (name, importance) in artifact.feature_names.iter().zip(importances) {
                println!("  {:<14} {:.3}", name, importance);
            }
        }
    }

    Ok(())
}

/// One hour from the clock's local time.
fn default_prediction_time<C: Clock>(clock: &C) -> NaiveDateTime {
    clock.now_local().naive_local() + Duration::hours(1)
}

/// Ask for one sensor value on stdin until a number is entered.
fn prompt_value(name: &str) -> Result<f64> {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("Current value of '{}': ", name);
        io::stdout().flush().context("Failed to flush stdout")?;

        line.clear();
        if stdin.lock().read_line(&mut line).context("Failed to read input")? == 0 {
            bail!("No value entered for '{}'", name);
        }
        match line.trim().replace(',', ".").parse::<f64>() {
            Ok(value) => return Ok(value),
            Err(_) => println!("'{}' is not a number, try again.", line.trim()),
        }
    }
}
