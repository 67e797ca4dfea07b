//! Self-limiting: applies the `nice` priority and optional cgroup limits to
//! the running process, grounded in `CGroups.cpp`/`CPULimits.cpp`. spec.md
//! §1 states this interface as out of scope for redesign ("the cgroup/nice
//! setters"); this implements the stated interface without inventing new
//! limit semantics.

use std::fs;
use std::path::Path;

use snafu::{ResultExt, Snafu};

use crate::config::Config;

#[derive(Debug, Snafu)]
pub enum SystemError {
    #[snafu(display("failed to set process niceness to {}: {}", value, source))]
    SetNice { value: i32, source: nix::Error },

    #[snafu(display("failed to write cgroup limit file {}: {}", path.display(), source))]
    CgroupWrite {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

/// Applies `nice` and cgroup CPU/memory caps to the current process per
/// configuration. Disabled entirely when `disable_cgroups` is set.
pub fn apply_self_limits(cfg: &Config) -> Result<(), SystemError> {
    if cfg.get_bool("disable_cgroups", false) {
        tracing::debug!("cgroup/nice limits disabled by configuration");
        return Ok(());
    }

    let nice_value = cfg.get_i64("process_nice", 0) as i32;
    if nice_value != 0 {
        set_nice(nice_value)?;
    }

    if let Some(cpu_max) = nonempty(cfg.get_string("cgroup_cpu_max", "")) {
        write_cgroup_file("/sys/fs/cgroup/auoms/cpu.max", &cpu_max)?;
    }
    if let Some(mem_max) = nonempty(cfg.get_string("cgroup_memory_max", "")) {
        write_cgroup_file("/sys/fs/cgroup/auoms/memory.max", &mem_max)?;
    }

    Ok(())
}

fn nonempty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn set_nice(value: i32) -> Result<(), SystemError> {
    // SAFETY: `nice(2)` with PRIO_PROCESS/0 adjusts the calling process only.
    let result = unsafe { libc::nice(value) };
    if result == -1 && std::io::Error::last_os_error().raw_os_error() != Some(0) {
        // `nice()` legitimately returns -1 on success when requesting -1; only
        // treat it as an error when errno is actually set.
        let err = std::io::Error::last_os_error();
        if let Some(code) = err.raw_os_error() {
            if code != 0 {
                return Err(SystemError::SetNice {
                    value,
                    source: nix::Error::from_i32(code),
                });
            }
        }
    }
    Ok(())
}

fn write_cgroup_file(path: &str, value: &str) -> Result<(), SystemError> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    fs::write(path, value).context(CgroupWriteSnafu { path })
}
