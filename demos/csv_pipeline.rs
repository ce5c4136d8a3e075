//! Generates a handful of synthetic sensor readings, takes the first
//! `--count` of them, and writes the result to a CSV file.
//!
//! Run with: `cargo run --features demos --example csv_pipeline -- --count 5 --out readings.csv`

use anyhow::Context;
use clap::Parser;
use sensorflow::adapters::csv::{CsvWriter, SensorEvent, SensorEventMapping};
use sensorflow::operators::take;
use sensorflow::sources::IterableSource;
use sensorflow::Scheduler;
use std::sync::{Arc, Mutex};

#[derive(Parser)]
struct Args {
    /// How many readings to keep.
    #[arg(long, default_value_t = 5)]
    count: i64,

    /// Output CSV path.
    #[arg(long, default_value = "readings.csv")]
    out: std::path::PathBuf,
}

fn synthetic_readings() -> impl Iterator<Item = SensorEvent> {
    (0..20).map(|i| SensorEvent {
        sensor_id: "demo-sensor".to_string(),
        ts: 1_700_000_000.0 + i as f64 * 60.0,
        val: 20.0 + (i as f64 * 0.3).sin() * 2.0,
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut source = IterableSource::new(synthetic_readings());
    let upstream = source.publisher();
    let limited = take(&upstream, args.count).context("building take() stage")?;

    let writer = CsvWriter::new(&args.out, SensorEventMapping).context("opening csv writer")?;
    let writer = Arc::new(Mutex::new(writer));
    limited.subscribe(writer, None).context("subscribing csv writer")?;

    let mut scheduler = Scheduler::new();
    scheduler.schedule_recurring(source);
    scheduler.run_forever().context("running scheduler")?;

    log::info!("wrote {} readings to {}", args.count, args.out.display());
    Ok(())
}
