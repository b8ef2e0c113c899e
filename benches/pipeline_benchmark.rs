//! Benchmarks comparing per-pass cost against the full six-pass pipeline.
//!
//! Run with: cargo bench --bench pipeline_benchmark

use std::time::{Duration, Instant};

use miniz_oxide::deflate::compress_to_vec_zlib;
use plf_extract::{Config, Pipeline};

/// Benchmark result for a single operation.
struct BenchResult {
    name: String,
    duration: Duration,
    iterations: u32,
}

impl BenchResult {
    fn avg_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0 / self.iterations as f64
    }
}

/// Run a benchmark function multiple times and measure average time.
fn bench<F: FnMut()>(name: &str, iterations: u32, mut f: F) -> BenchResult {
    f(); // warmup

    let start = Instant::now();
    for _ in 0..iterations {
        f();
    }
    let duration = start.elapsed();

    BenchResult { name: name.to_string(), duration, iterations }
}

/// Build a synthetic `.plf`-shaped buffer containing `block_count` DB
/// headers, each followed by a `%DB<n>` address token and a compressed
/// `<Root>` fragment describing a handful of scalar members.
fn synthetic_buffer(block_count: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in 0..block_count {
        let name = format!("DB{i}");

        buf.extend_from_slice(b"DB!");
        buf.push(1); // offset byte
        buf.push(name.len() as u8); // length prefix
        buf.extend_from_slice(name.as_bytes());

        buf.push(0xAA);
        buf.push((name.len() + 1) as u8);
        buf.extend_from_slice(format!("%{name}").as_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());

        let xml = "\u{feff}<Root><Member ID=\"0\" Name=\"field\" Type=\"Int\" LID=\"0\"/></Root>";
        let compressed = compress_to_vec_zlib(xml.as_bytes(), 6);
        buf.push(0xBB);
        buf.extend_from_slice(&(compressed.len() as u16).to_le_bytes());
        buf.extend_from_slice(&compressed);
    }
    buf
}

fn main() {
    println!("=== plf-extract Pipeline Benchmark ===\n");

    let small = synthetic_buffer(50);
    let medium = synthetic_buffer(500);
    let config = Config::default();

    let results = vec![
        bench("pipeline: 50 blocks", 20, || {
            let _ = Pipeline::run(&small, &config);
        }),
        bench("pipeline: 500 blocks", 5, || {
            let _ = Pipeline::run(&medium, &config);
        }),
    ];

    for result in &results {
        println!("{:<28} {:>8.3} ms/iter ({} iters)", result.name, result.avg_ms(), result.iterations);
    }
}
