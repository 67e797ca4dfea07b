//! Priority assignment for events under construction (spec.md §4.1
//! "the builder consults a pluggable `Prioritizer`").
//!
//! The builder doesn't know syscall names or record-type categories; it
//! only knows the bytes it has written so far. [`EventDraftSummary`] is the
//! small, incrementally-built fact sheet the builder hands to a
//! [`Prioritizer`] at `end_event` time, standing in for the original's
//! practice of inspecting the half-built `Event` object directly.

use std::collections::HashMap;

use auoms_common::config::Config;

/// What the builder has observed about the event under construction, as of
/// `end_event`. Extended as records/fields are added; never re-derived by
/// re-parsing the buffer.
#[derive(Debug, Clone, Default)]
pub struct EventDraftSummary {
    pub record_types: Vec<u32>,
    pub syscall_name: Option<String>,
}

pub trait Prioritizer {
    fn prioritize(&self, summary: &EventDraftSummary) -> u16;
}

/// Assigns the same priority to every event.
pub struct DefaultPrioritizer {
    priority: u16,
}

impl DefaultPrioritizer {
    pub fn new(priority: u16) -> Self {
        DefaultPrioritizer { priority }
    }
}

impl Prioritizer for DefaultPrioritizer {
    fn prioritize(&self, _summary: &EventDraftSummary) -> u16 {
        self.priority
    }
}

/// Maps known audit record-type numbers to a broad category name, for the
/// `event_priority_by_record_type_category` config key. Unrecognized types
/// don't match any category; they fall through to the default priority.
fn record_type_category(record_type: u32) -> Option<&'static str> {
    match record_type {
        1300 => Some("syscall"),           // SYSCALL
        1309 | 11309 => Some("execve"),    // EXECVE, AUOMS_EXECVE_FRAGMENT
        14688 => Some("execve"),           // AUOMS_EXECVE
        1106 | 1108 | 1112 => Some("login"), // USER_LOGIN, USER_START, USER_END
        1130..=1134 => Some("selinux"),
        10000 => Some("inventory"), // AUOMS_PROCESS_INVENTORY
        _ => None,
    }
}

/// Reads `event_priority_by_syscall`, `event_priority_by_record_type`, and
/// `event_priority_by_record_type_category` from a [`Config`] (spec.md §6)
/// and takes the *minimum* (highest-priority) match across all three, all
/// record types in the event, and the syscall name if present. Falls back
/// to a configured default when nothing matches.
pub struct ConfigPrioritizer {
    default_priority: u16,
    by_syscall: HashMap<String, u16>,
    by_record_type: HashMap<u32, u16>,
    by_category: HashMap<String, u16>,
}

impl ConfigPrioritizer {
    pub fn from_config(config: &Config, default_priority: u16) -> Self {
        let by_syscall = config
            .get_json("event_priority_by_syscall")
            .ok()
            .flatten()
            .unwrap_or_default();
        let by_record_type: HashMap<String, u16> = config
            .get_json("event_priority_by_record_type")
            .ok()
            .flatten()
            .unwrap_or_default();
        let by_record_type = by_record_type
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|k| (k, v)))
            .collect();
        let by_category = config
            .get_json("event_priority_by_record_type_category")
            .ok()
            .flatten()
            .unwrap_or_default();

        ConfigPrioritizer {
            default_priority,
            by_syscall,
            by_record_type,
            by_category,
        }
    }
}

impl Prioritizer for ConfigPrioritizer {
    fn prioritize(&self, summary: &EventDraftSummary) -> u16 {
        let mut best: Option<u16> = None;
        let mut consider = |p: u16| {
            best = Some(best.map_or(p, |b| b.min(p)));
        };

        if let Some(name) = &summary.syscall_name {
            if let Some(&p) = self.by_syscall.get(name) {
                consider(p);
            }
        }
        for record_type in &summary.record_types {
            if let Some(&p) = self.by_record_type.get(record_type) {
                consider(p);
            }
            if let Some(category) = record_type_category(*record_type) {
                if let Some(&p) = self.by_category.get(category) {
                    consider(p);
                }
            }
        }

        best.unwrap_or(self.default_priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prioritizer_always_returns_configured_priority() {
        let p = DefaultPrioritizer::new(4);
        assert_eq!(p.prioritize(&EventDraftSummary::default()), 4);
    }

    #[test]
    fn config_prioritizer_takes_the_minimum_across_matches() {
        let cfg = Config::parse(
            r#"event_priority_by_syscall = {"execve": 2}
event_priority_by_record_type_category = {"execve": 5}
"#,
        );
        let p = ConfigPrioritizer::from_config(&cfg, 9);
        let summary = EventDraftSummary {
            record_types: vec![1309],
            syscall_name: Some("execve".to_string()),
        };
        assert_eq!(p.prioritize(&summary), 2);
    }

    #[test]
    fn config_prioritizer_falls_back_to_default_when_nothing_matches() {
        let cfg = Config::empty();
        let p = ConfigPrioritizer::from_config(&cfg, 9);
        assert_eq!(p.prioritize(&EventDraftSummary::default()), 9);
    }
}
