//! Process wiring: builds every subsystem named in spec.md §5's thread model
//! from a loaded [`Config`] and runs until [`signal::should_exit`] (§5
//! "Every long-running thread respects a process-wide exit flag").
//!
//! Mirrors `vector`'s `main.rs`/`app.rs` split: `main.rs` only parses the
//! CLI and installs the `tracing` subscriber; everything that actually
//! starts threads lives here.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;

use auoms_collector::{parser, stdin_source, Accumulator, AccumulatorConfig, NetlinkCollector, NetlinkConfig, SpscQueue};
use auoms_common::kernel_info::KernelInfo;
use auoms_common::limits::apply_self_limits;
use auoms_common::proc_metrics::{run_sampler_loop, ProcLimits};
use auoms_common::redactor::NullRedactor;
use auoms_common::resolver::PasswdNameResolver;
use auoms_common::sync::GateState;
use auoms_common::{Config, Gate};
use auoms_event::{ConfigPrioritizer, EventBuilder};
use auoms_output::{MaxPriorityFilter, NullFilter, Output, OutputConfig, OutputFilter, RawEventWriter};
use auoms_queue::{Queue, QueueAllocator, QueueConfig};

use crate::signal::{self, InterruptRegistry};

/// Parsed command-line arguments (spec.md §1.4 of SPEC_FULL.md).
pub struct Args {
    pub config_path: PathBuf,
    pub data_dir_override: Option<String>,
    pub foreground: bool,
}

/// SPSC hand-off queue sizing (spec.md §4.2); not named in spec.md §6's
/// config table, so we size it generously and leave it overridable rather
/// than inventing a whole tuning surface for it.
const DEFAULT_SPSC_SEGMENTS: usize = 10;
const DEFAULT_SPSC_SEGMENT_SIZE: usize = 1024 * 1024;

/// How often the proc-metrics sampler thread (spec.md §5 "1 metrics/proc-
/// metrics sampler") re-checks RSS/VIRT against the configured limits.
const PROC_METRICS_PERIOD: Duration = Duration::from_secs(5);

/// One configured output (spec.md §6: `output_format`, `output_socket`,
/// `enable_ack_mode`, `ack_queue_size` are "per-output"). Multiple outputs
/// are driven by a JSON array under the `outputs` key; absent that key we
/// fall back to a single output built from the unscoped global keys.
#[derive(Debug, Deserialize)]
struct OutputSpec {
    #[serde(default = "default_output_name")]
    name: String,
    #[serde(default)]
    socket: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    ack_mode: Option<bool>,
    #[serde(default)]
    ack_queue_size: Option<usize>,
    #[serde(default)]
    max_priority: Option<u16>,
}

fn default_output_name() -> String {
    "default".to_string()
}

fn output_specs(cfg: &Config) -> Vec<OutputSpec> {
    match cfg.get_json::<Vec<OutputSpec>>("outputs") {
        Ok(Some(specs)) if !specs.is_empty() => specs,
        Ok(_) => vec![OutputSpec {
            name: default_output_name(),
            socket: None,
            format: None,
            ack_mode: None,
            ack_queue_size: None,
            max_priority: None,
        }],
        Err(err) => {
            tracing::warn!(%err, "malformed `outputs` config key, falling back to the single default output");
            vec![OutputSpec {
                name: default_output_name(),
                socket: None,
                format: None,
                ack_mode: None,
                ack_queue_size: None,
                max_priority: None,
            }]
        }
    }
}

fn build_output_config(cfg: &Config, spec: &OutputSpec) -> OutputConfig {
    let mut config = OutputConfig::from_config(cfg, spec.name.clone());
    if let Some(socket) = &spec.socket {
        config.socket_path = PathBuf::from(socket);
    }
    if let Some(ack_mode) = spec.ack_mode {
        config.ack_mode = ack_mode;
    }
    if let Some(size) = spec.ack_queue_size {
        config.ack_queue_size = size;
    }
    config
}

fn build_output_filter(spec: &OutputSpec) -> Box<dyn OutputFilter> {
    match spec.max_priority {
        Some(max_priority) => Box::new(MaxPriorityFilter { max_priority }),
        None => Box::new(NullFilter),
    }
}

/// Loads config, wires every subsystem together, and blocks until
/// `signal::should_exit()` is observed, then joins everything down in
/// reverse-dependency order (collector → parser → queue saver/outputs).
pub fn run(args: Args) -> io::Result<()> {
    signal::install().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let mut cfg = Config::load(&args.config_path).unwrap_or_else(|err| {
        tracing::warn!(path = %args.config_path.display(), %err, "failed to load config file, using built-in defaults");
        Config::empty()
    });
    if let Some(data_dir) = &args.data_dir_override {
        cfg = cfg.with_override("data_dir", data_dir);
    }

    if let Err(err) = apply_self_limits(&cfg) {
        tracing::warn!(%err, "failed to apply process nice/cgroup limits");
    }

    let kernel_info = KernelInfo::probe();
    if !kernel_info.audit_supported {
        tracing::warn!(release = %kernel_info.release, "kernel does not appear to expose AUDIT support");
    }

    let queue_dir = cfg.queue_dir();
    let queue_config = QueueConfig::from_config(&cfg);
    let queue = Arc::new(
        Queue::open(&queue_dir, queue_config.clone())
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?,
    );

    let shutdown_gate = Arc::new(Gate::new(GateState::Closed));
    let interrupts = Arc::new(InterruptRegistry::new());

    let spsc = Arc::new(SpscQueue::new(
        cfg.get_u64("spsc_num_segments", DEFAULT_SPSC_SEGMENTS as u64) as usize,
        cfg.get_u64("spsc_segment_size", DEFAULT_SPSC_SEGMENT_SIZE as u64) as usize,
    ));

    let saver_handle = spawn_saver(queue.clone(), queue_config.save_delay, shutdown_gate.clone());
    let proc_metrics_handle = spawn_proc_metrics_sampler(&cfg, queue.clone());
    let collector_handle = spawn_collector(&cfg, spsc.clone());
    let parser_handle = spawn_parser(cfg.clone(), queue.clone(), spsc.clone());

    let mut outputs = Vec::new();
    for spec in output_specs(&cfg) {
        let format = spec.format.clone().unwrap_or_else(|| "raw".to_string());
        if format != "raw" {
            tracing::warn!(name = %spec.name, format = %format, "unsupported output format, only \"raw\" is built in; skipping output");
            continue;
        }
        let output_config = build_output_config(&cfg, &spec);
        let filter = build_output_filter(&spec);
        let writer = Box::new(RawEventWriter::new());
        match Output::with_filter(queue.clone(), output_config, writer, filter) {
            Ok(mut output) => {
                let handle = output.handle();
                let interrupts = interrupts.clone();
                let join = thread::Builder::new()
                    .name(format!("output-{}", spec.name))
                    .spawn(move || {
                        let _ = signal::unblock_sigquit_on_current_thread();
                        interrupts.register_current_thread();
                        output.run();
                        output.close();
                    })
                    .expect("failed to spawn output thread");
                outputs.push((handle, join));
            }
            Err(err) => {
                tracing::error!(name = %spec.name, %err, "failed to start output");
            }
        }
    }

    while !signal::should_exit() {
        let _ = shutdown_gate.wait(GateState::Open, Duration::from_millis(250));
    }

    tracing::info!("shutdown signal received, stopping subsystems");
    shutdown_gate.open();
    interrupts.interrupt_all();

    queue.close();
    for (handle, join) in outputs {
        handle.request_stop();
        let _ = join.join();
    }
    let _ = collector_handle.join();
    let _ = parser_handle.join();
    let _ = saver_handle.join();
    let _ = proc_metrics_handle.join();

    tracing::info!(
        queue_bytes_dropped = queue.bytes_dropped(),
        spsc_lost_bytes = spsc.metrics.lost_bytes.load(std::sync::atomic::Ordering::Relaxed),
        spsc_lost_segments = spsc.metrics.lost_segments.load(std::sync::atomic::Ordering::Relaxed),
        "shutdown complete"
    );
    Ok(())
}

fn spawn_saver(queue: Arc<Queue>, delay: Duration, shutdown_gate: Arc<Gate>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("queue-saver".to_string())
        .spawn(move || queue.run_saver(delay, &shutdown_gate))
        .expect("failed to spawn queue saver thread")
}

fn spawn_proc_metrics_sampler(cfg: &Config, queue: Arc<Queue>) -> thread::JoinHandle<()> {
    let limits = ProcLimits::from_config(cfg);
    thread::Builder::new()
        .name("proc-metrics".to_string())
        .spawn(move || {
            run_sampler_loop(limits, PROC_METRICS_PERIOD, signal::exit_flag(), |exceeded| {
                tracing::error!(limit = exceeded, "self resource limit exceeded, closing the queue and requesting shutdown");
                queue.close();
                signal::request_exit();
            });
        })
        .expect("failed to spawn proc-metrics sampler thread")
}

fn spawn_collector(cfg: &Config, spsc: Arc<SpscQueue>) -> thread::JoinHandle<()> {
    let mode = cfg.get_string("collector_mode", "netlink");
    match mode.as_str() {
        "stdin" => thread::Builder::new()
            .name("collector-stdin".to_string())
            .spawn(move || {
                stdin_source::run(io::stdin(), &spsc, signal::should_exit);
            })
            .expect("failed to spawn stdin collector thread"),
        _ => {
            let netlink_config = NetlinkConfig::from_config(cfg);
            thread::Builder::new()
                .name("collector-netlink".to_string())
                .spawn(move || {
                    let mut collector = NetlinkCollector::new(netlink_config);
                    if let Err(err) = collector.run(&spsc, signal::should_exit) {
                        tracing::error!(%err, "netlink collector stopped");
                    }
                })
                .expect("failed to spawn netlink collector thread")
        }
    }
}

fn spawn_parser(cfg: Config, queue: Arc<Queue>, spsc: Arc<SpscQueue>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("parser".to_string())
        .spawn(move || {
            let accumulator_config = AccumulatorConfig::from_config(&cfg);
            let default_priority = cfg.get_u64("default_event_priority", 4) as u16;
            let prioritizer = ConfigPrioritizer::from_config(&cfg, default_priority);
            let mut accumulator = Accumulator::new(accumulator_config, PasswdNameResolver::new(), NullRedactor);

            let mut allocator = QueueAllocator::new(&queue);
            let mut builder = EventBuilder::new(&mut allocator, prioritizer);
            parser::run(&spsc, &mut accumulator, &mut builder, signal::should_exit);
        })
        .expect("failed to spawn parser thread")
}
