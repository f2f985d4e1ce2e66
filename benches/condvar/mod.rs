// Copyright (c) 2020 kprotty
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt,
    ops::Div,
    sync::{Arc, Barrier},
    time::{Duration, Instant},
};

mod monitors;

fn bench_all(b: &Benchmarker) {
    b.bench::<monitors::HandoffMonitor>();
    b.bench::<monitors::ResumeMonitor>();
    b.bench::<monitors::ParkingLotMonitor>();
    b.bench::<monitors::StdMonitor>();
}

/// Threads take turns in a ring: thread `id` may only advance the ticket when
/// `ticket % threads == id`, so every advance must wake exactly the right waiter.
pub struct Turn {
    ticket: u64,
    threads: usize,
    stopped: bool,
}

impl Turn {
    fn new(threads: usize) -> Self {
        Self {
            ticket: 0,
            threads,
            stopped: false,
        }
    }

    fn ready(&self, id: usize) -> bool {
        self.stopped || (self.ticket % (self.threads as u64)) == (id as u64)
    }

    fn advance(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.ticket += 1;
        true
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Notify {
    One,
    All,
}

pub trait Monitor: Send + Sync + 'static {
    const NAME: &'static str;

    fn new(threads: usize) -> Self;

    /// Waits for thread `id`'s turn, passes it on, and notifies. Returns false once stopped.
    fn take_turn(&self, id: usize, notify: Notify) -> bool;

    fn stop(&self);
}

struct ArgParser;
impl ArgParser {
    fn parse() -> (Vec<Duration>, Vec<usize>) {
        let mut args = std::env::args();
        let _exe = args.next();

        let measure = args
            .next()
            .unwrap_or_else(|| Self::error("no arguments supplied"))
            .split(',')
            .map(Self::parse_time)
            .collect::<Vec<_>>();

        let threads = args
            .next()
            .unwrap_or_else(|| Self::error("missing thread counts"))
            .split(',')
            .flat_map(|item| {
                let mut bounds = item.splitn(2, '-').map(|count| {
                    count
                        .parse::<usize>()
                        .ok()
                        .filter(|&count| count >= 2)
                        .unwrap_or_else(|| Self::error("threads take in a usize of at least 2"))
                });
                let first = bounds.next().unwrap_or_else(|| Self::error("invalid value"));
                let second = bounds.next().unwrap_or(first);
                if second < first {
                    Self::error("invalid range of threads");
                }
                first..=second
            })
            .collect::<Vec<_>>();

        (measure, threads)
    }

    fn parse_time(input: &str) -> Duration {
        let split = input
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or_else(|| Self::error("measure requires time unit"));
        let (value, unit) = input.split_at(split);
        let value = value
            .parse::<u64>()
            .unwrap_or_else(|_| Self::error("invalid value"));

        let mult = match unit {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            _ => Self::error("invalid time unit"),
        };

        Duration::from_nanos(value * mult)
    }

    fn error(message: &str) -> ! {
        eprintln!("Error: {:?}\n", message);
        Self::print_help(std::env::args().next().unwrap_or_default());
        std::process::exit(1)
    }

    fn print_help(exe: String) {
        println!("Usage: {} [measure] [threads]", exe);
        println!("where:");

        println!();
        println!(" [measure]: [csv:time]\t\t\\\\ List of time spent measuring for each condvar benchmark");
        println!(" [threads]: [csv-ranged:count]\t\\\\ List of thread counts (>= 2) for each benchmark");

        println!();
        println!(" [count]: {{usize}}");
        println!(" [time]: {{u64}}[time_unit]");
        println!(" [time_unit]: \"ns\" | \"us\" | \"ms\" | \"s\"");
        println!();
    }
}

#[derive(Default)]
struct BenchmarkResult {
    name: Option<&'static str>,
    mean: Option<f64>,
    stdev: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    sum: Option<f64>,
}

impl BenchmarkResult {
    fn lower(value: f64) -> String {
        if value <= 1_000f64 {
            format!("{}", value.round())
        } else if value <= 1_000_000f64 {
            format!("{}k", (value / 1_000f64).round())
        } else if value <= 1_000_000_000f64 {
            format!("{:.2}m", value / 1_000_000f64)
        } else {
            format!("{:.2}b", value / 1_000_000_000f64)
        }
    }

    fn column(value: Option<f64>, header: &str) -> String {
        value.map(Self::lower).unwrap_or_else(|| header.to_string())
    }
}

impl fmt::Debug for BenchmarkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<20} |", self.name.unwrap_or("name"))?;
        write!(f, " {:>7} |", Self::column(self.mean, "mean"))?;
        write!(f, " {:>7} |", Self::column(self.stdev, "stdev"))?;
        write!(f, " {:>7} |", Self::column(self.min, "min"))?;
        write!(f, " {:>7} |", Self::column(self.max, "max"))?;
        write!(f, " {:>7} |", Self::column(self.sum, "sum"))?;
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct Benchmarker {
    measure: Duration,
    threads: usize,
    notify: Notify,
}

impl Benchmarker {
    fn bench<M: Monitor>(&self) {
        struct Context<M> {
            monitor: M,
            barrier: Barrier,
        }

        let context = Arc::new(Context {
            monitor: M::new(self.threads),
            barrier: Barrier::new(self.threads + 1),
        });

        let notify = self.notify;
        let threads = (0..self.threads)
            .map(|id| {
                let context = context.clone();
                std::thread::spawn(move || {
                    let mut turns = 0u64;
                    context.barrier.wait();
                    while context.monitor.take_turn(id, notify) {
                        turns += 1;
                    }
                    turns
                })
            })
            .collect::<Vec<_>>();

        context.barrier.wait();
        let started = Instant::now();
        std::thread::sleep(self.measure);
        context.monitor.stop();

        let mut results = threads
            .into_iter()
            .map(|t| t.join().expect("failed to join OS thread"))
            .collect::<Vec<_>>();
        let elapsed = started.elapsed().as_secs_f64();

        // Report turns per second for each thread.
        let per_sec = |turns: u64| (turns as f64) / elapsed;
        let sum = results.iter().fold(0f64, |sum, &turns| sum + per_sec(turns));

        let mean = sum.div(results.len() as f64);
        let mut stdev = results.iter().fold(0f64, |stdev, &turns| {
            let r = per_sec(turns) - mean;
            stdev + (r * r)
        });
        if results.len() > 1 {
            stdev /= (results.len() - 1) as f64;
            stdev = stdev.sqrt();
        }

        results.sort();
        let min = per_sec(results[0]);
        let max = per_sec(results[results.len() - 1]);

        println!(
            "{:?}",
            BenchmarkResult {
                name: Some(M::NAME),
                mean: Some(mean),
                stdev: Some(stdev),
                min: Some(min),
                max: Some(max),
                sum: Some(sum),
            }
        );
    }
}

pub fn main() {
    let (measure, threads) = ArgParser::parse();

    for &threads in threads.iter() {
        // notify_one() can only pick the right thread when there's a single other one.
        let notify = if threads == 2 { Notify::One } else { Notify::All };

        for &measure in measure.iter() {
            let b = Benchmarker {
                measure,
                threads,
                notify,
            };

            println!(
                "measure={:?} threads={:?} notify={:?}\n{}\n{:?}",
                measure,
                threads,
                notify,
                "-".repeat(70),
                BenchmarkResult::default(),
            );

            bench_all(&b);
            println!();
        }
    }
}
