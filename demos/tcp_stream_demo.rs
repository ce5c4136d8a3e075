//! Streams synthetic sensor readings to a TCP listener, one line of JSON
//! per event, via a [`BlockingSubscriberBridge`] so the socket write never
//! stalls the scheduler's main loop.
//!
//! Run with: `cargo run --features demos --example tcp_stream_demo -- --port 2991`

use anyhow::Context;
use clap::Parser;
use sensorflow::adapters::csv::SensorEvent;
use sensorflow::bridge::{BlockingSubscriber, BlockingSubscriberBridge};
use sensorflow::error::Result;
use sensorflow::sources::IterableSource;
use sensorflow::Scheduler;
use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = 2991)]
    port: u16,

    /// How many readings to stream before stopping.
    #[arg(long, default_value_t = 10)]
    count: usize,
}

/// Writes one JSON line per event to a TCP socket, matching the original's
/// `TcpStreamObserver` (connect once, write-and-flush per event).
struct TcpLineSubscriber {
    stream: TcpStream,
}

impl TcpLineSubscriber {
    fn connect(host: &str, port: u16) -> anyhow::Result<Self> {
        let stream = TcpStream::connect((host, port))
            .with_context(|| format!("connecting to {host}:{port}"))?;
        Ok(TcpLineSubscriber { stream })
    }
}

impl BlockingSubscriber<SensorEvent> for TcpLineSubscriber {
    fn handle_next(&mut self, _sub_topic: &str, event: SensorEvent) -> Result<()> {
        let line = format!(
            "{{\"sensor_id\":\"{}\",\"ts\":{},\"val\":{}}}\n",
            event.sensor_id, event.ts, event.val
        );
        self.stream.write_all(line.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

fn synthetic_readings(count: usize) -> impl Iterator<Item = SensorEvent> {
    (0..count).map(|i| SensorEvent {
        sensor_id: "tcp-demo-sensor".to_string(),
        ts: 1_700_000_000.0 + i as f64 * 2.0,
        val: 20.0 + (i as f64 * 0.3).sin() * 2.0,
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let tcp_sub = TcpLineSubscriber::connect(&args.host, args.port)?;
    let mut scheduler = Scheduler::new();
    let bridge = Arc::new(Mutex::new(BlockingSubscriberBridge::new(
        &mut scheduler,
        tcp_sub,
    )));

    let mut source = IterableSource::new(synthetic_readings(args.count));
    source
        .publisher()
        .subscribe(Arc::clone(&bridge), None)
        .context("subscribing tcp bridge")?;

    scheduler.schedule_periodic(source, Duration::from_secs(2));
    scheduler.run_forever().context("running scheduler")?;

    bridge.lock().unwrap().join();
    Ok(())
}
