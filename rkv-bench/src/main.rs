//! # Client Benchmark Harness
//!
//! Purpose: Drive a running server through one resilient client connection
//! and report throughput for pipelined and one-at-a-time traffic.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Keys are picked by a fixed-seed PRNG so runs
//!    are comparable.
//! 2. **Allocation Control**: Keys and values are built before the clock
//!    starts; values are `Bytes` so requeueing never copies them.
//! 3. **Config Parity**: The client is configured from a URL, or from the
//!    same JSON shape the library deserializes.
//!
//! ## Usage
//!
//! ```text
//! rkv-bench [url] [ops] [pipeline] [value_size]
//! RKV_BENCH_CONFIG=client.json rkv-bench
//! ```

use std::env;
use std::fs::File;
use std::hint::black_box;
use std::io::BufReader;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use rkv_client::{Client, ClientConfig, ClientFactory};
use rkv_proto::{Command, CommandArg};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_PIPELINE: usize = 64;
const DEFAULT_VALUE_SIZE: usize = 128;
const KEY_COUNT: usize = 1 << 12;

struct BenchConfig {
    client: ClientConfig,
    op_count: usize,
    pipeline: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> anyhow::Result<Self> {
        let mut args = env::args().skip(1);
        let url = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let pipeline = parse_usize(args.next(), DEFAULT_PIPELINE).max(1);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        let client = match env::var_os("RKV_BENCH_CONFIG") {
            Some(path) => {
                let file = File::open(&path)
                    .with_context(|| format!("opening {}", path.to_string_lossy()))?;
                serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("parsing {}", path.to_string_lossy()))?
            }
            None => ClientConfig::from_url(&url)?,
        };

        Ok(BenchConfig {
            client,
            op_count,
            pipeline,
            value_size,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_index(&mut self, len: usize) -> usize {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x as usize) % len
    }
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)");
}

/// Sends `ops` commands in pipelines of `depth` and fails on the first error.
async fn pipelined<F>(client: &Client, ops: usize, depth: usize, mut next: F) -> anyhow::Result<()>
where
    F: FnMut() -> Command,
{
    let mut sent = 0;
    while sent < ops {
        let batch = depth.min(ops - sent);
        let mut pipeline = client.pipeline();
        for _ in 0..batch {
            pipeline.add(next());
        }
        for reply in pipeline.execute().await {
            black_box(reply?);
        }
        sent += batch;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BenchConfig::from_args()?;
    if config.op_count == 0 {
        bail!("ops must be greater than zero");
    }
    let client = ClientFactory::new().create(config.client.clone())?;
    client.wait_ready().await?;
    info!(
        address = client.address(),
        ops = config.op_count,
        pipeline = config.pipeline,
        value_size = config.value_size,
        "connected"
    );

    let keys: Vec<String> = (0..KEY_COUNT).map(|idx| format!("rkv-bench:{idx:05}")).collect();
    let value = Bytes::from(vec![b'v'; config.value_size]);

    let mut rng = XorShift64::new(0xA5A5_A5A5_A5A5_A5A5);
    let start = Instant::now();
    pipelined(&client, config.op_count, config.pipeline, || {
        let key = &keys[rng.next_index(KEY_COUNT)];
        Command::new("SET")
            .arg(key)
            .arg(CommandArg::Bytes(value.clone()))
    })
    .await?;
    report("SET (pipelined)", config.op_count, start.elapsed());

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    pipelined(&client, config.op_count, config.pipeline, || {
        Command::new("GET").arg(&keys[rng.next_index(KEY_COUNT)])
    })
    .await?;
    report("GET (pipelined)", config.op_count, start.elapsed());

    let serial_ops = (config.op_count / config.pipeline).max(1);
    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let start = Instant::now();
    for _ in 0..serial_ops {
        let reply = client
            .send(Command::new("GET").arg(&keys[rng.next_index(KEY_COUNT)]))
            .await?;
        black_box(reply);
    }
    report("GET (serial)", serial_ops, start.elapsed());

    client.quit().await?;
    Ok(())
}
