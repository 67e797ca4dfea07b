//! Self RSS/VIRT sampling, grounded in `ProcMetrics.cpp`. Enforces
//! `rss_limit`, `virt_limit`, `rss_pct_limit` (spec.md §5, §6) by invoking a
//! fatal callback when any limit is exceeded; the callback terminates the
//! process (spec.md §7 `Fatal` errors).

use std::time::Duration;

use procfs::process::Process;
use procfs::Meminfo;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcLimits {
    pub rss_limit_bytes: Option<u64>,
    pub virt_limit_bytes: Option<u64>,
    pub rss_pct_limit: Option<f64>,
}

impl ProcLimits {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        ProcLimits {
            rss_limit_bytes: nonzero(cfg.get_u64("rss_limit", 0)),
            virt_limit_bytes: nonzero(cfg.get_u64("virt_limit", 0)),
            rss_pct_limit: nonzero_f(cfg.get_f64("rss_pct_limit", 0.0)),
        }
    }
}

fn nonzero(v: u64) -> Option<u64> {
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

fn nonzero_f(v: f64) -> Option<f64> {
    if v <= 0.0 {
        None
    } else {
        Some(v)
    }
}

/// A single RSS/VIRT reading for the current process.
#[derive(Debug, Clone, Copy)]
pub struct ProcSample {
    pub rss_bytes: u64,
    pub virt_bytes: u64,
    pub rss_pct: f64,
}

fn sample_self() -> Result<ProcSample, procfs::ProcError> {
    let me = Process::myself()?;
    let stat = me.stat()?;
    let page_size = procfs::page_size().unwrap_or(4096);
    let rss_bytes = stat.rss as u64 * page_size;
    let virt_bytes = stat.vsize;

    let rss_pct = Meminfo::new()
        .ok()
        .and_then(|mi| {
            let total = mi.mem_total;
            if total == 0 {
                None
            } else {
                Some(100.0 * rss_bytes as f64 / total as f64)
            }
        })
        .unwrap_or(0.0);

    Ok(ProcSample {
        rss_bytes,
        virt_bytes,
        rss_pct,
    })
}

/// Checks `sample` against `limits`, returning the name of the first limit
/// exceeded, if any.
pub fn check_limits(sample: &ProcSample, limits: &ProcLimits) -> Option<&'static str> {
    if let Some(limit) = limits.rss_limit_bytes {
        if sample.rss_bytes > limit {
            return Some("rss_limit");
        }
    }
    if let Some(limit) = limits.virt_limit_bytes {
        if sample.virt_bytes > limit {
            return Some("virt_limit");
        }
    }
    if let Some(limit) = limits.rss_pct_limit {
        if sample.rss_pct > limit {
            return Some("rss_pct_limit");
        }
    }
    None
}

/// Runs the process-metrics sampler loop (spec.md §5 "1 metrics/proc-metrics
/// sampler" thread) until `exit_flag` is observed set. Calls `on_fatal` with
/// the name of the exceeded limit and stops.
pub fn run_sampler_loop(
    limits: ProcLimits,
    period: Duration,
    exit_flag: &std::sync::atomic::AtomicBool,
    mut on_fatal: impl FnMut(&'static str),
) {
    use std::sync::atomic::Ordering;

    while !exit_flag.load(Ordering::Relaxed) {
        match sample_self() {
            Ok(sample) => {
                if let Some(exceeded) = check_limits(&sample, &limits) {
                    tracing::error!(limit = exceeded, rss = sample.rss_bytes, virt = sample.virt_bytes, "resource limit exceeded");
                    on_fatal(exceeded);
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to sample process metrics");
            }
        }
        std::thread::sleep(period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_limits_flags_rss_over_limit() {
        let sample = ProcSample {
            rss_bytes: 200,
            virt_bytes: 100,
            rss_pct: 1.0,
        };
        let limits = ProcLimits {
            rss_limit_bytes: Some(100),
            virt_limit_bytes: None,
            rss_pct_limit: None,
        };
        assert_eq!(check_limits(&sample, &limits), Some("rss_limit"));
    }

    #[test]
    fn check_limits_passes_when_under_all_limits() {
        let sample = ProcSample {
            rss_bytes: 10,
            virt_bytes: 10,
            rss_pct: 1.0,
        };
        let limits = ProcLimits {
            rss_limit_bytes: Some(100),
            virt_limit_bytes: Some(100),
            rss_pct_limit: Some(50.0),
        };
        assert_eq!(check_limits(&sample, &limits), None);
    }
}
