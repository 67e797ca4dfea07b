//! Audit Record Accumulator (spec.md §4.3).
//!
//! Groups raw `(record_type, text)` items sharing an event id into one
//! [`auoms_event::EventBuilder`] event, assembling the `SYSCALL`+`EXECVE`
//! family into a single synthetic `AUOMS_EXECVE`/`AUOMS_EXECVE_FRAGMENT`
//! record along the way. `EOE` carries no fields of its own; it is the
//! trigger that closes out a group.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use auoms_common::config::Config;
use auoms_common::redactor::CmdlineRedactor;
use auoms_common::resolver::NameResolver;
use auoms_event::allocator::EventAllocator;
use auoms_event::builder::{BuilderError, EventBuilder};
use auoms_event::prioritizer::Prioritizer;
use auoms_event::unescape::{bash_escape, unescape_raw_field, UnescapeResult};
use auoms_event::{event_flags, FieldType, RECORD_TYPE_AUOMS_EXECVE, RECORD_TYPE_AUOMS_EXECVE_FRAGMENT, RECORD_TYPE_AUOMS_PROCESS_INVENTORY};

use crate::audit_line;

const SYSCALL_RECORD_TYPE: u32 = 1300;
const PATH_RECORD_TYPE: u32 = 1302;
const CWD_RECORD_TYPE: u32 = 1307;
const EXECVE_RECORD_TYPE: u32 = 1309;
const EOE_RECORD_TYPE: u32 = 1320;

/// `cmdline` is truncated to this many bytes before `cmdline_truncated` is
/// appended (spec.md §4.3).
pub const MAX_CMDLINE_LEN: usize = 65534;

type Key = (u64, u32, u64);

#[derive(Debug, snafu::Snafu)]
pub enum AccumulatorError {
    #[snafu(display("the queue has been closed"))]
    QueueClosed,
}

#[derive(Debug, Clone)]
struct RawRecord {
    record_type: u32,
    name: String,
    text: String,
    fields: Vec<(String, String)>,
}

struct Group {
    sec: u64,
    msec: u32,
    serial: u64,
    records: Vec<RawRecord>,
}

/// Tunables for grouping and the process-inventory side channel, read from
/// the same flat [`Config`] every other component uses.
pub struct AccumulatorConfig {
    pub flush_threshold_secs: u64,
    pub max_in_flight: usize,
    pub process_inventory_scan_interval: Duration,
    pub process_inventory_emit_interval: Duration,
}

impl AccumulatorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        AccumulatorConfig {
            flush_threshold_secs: cfg.get_u64("accumulator_flush_threshold_secs", 1),
            max_in_flight: cfg.get_u64("accumulator_max_in_flight", 4096) as usize,
            process_inventory_scan_interval: cfg.get_duration_ms("process_inventory_scan_interval_ms", 300_000),
            process_inventory_emit_interval: cfg.get_duration_ms("process_inventory_emit_interval_ms", 3_600_000),
        }
    }
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        AccumulatorConfig::from_config(&Config::empty())
    }
}

/// Grouping and synthesis state machine, plus the `/proc` inventory side
/// channel. Generic over the resolver/redactor seams so a caller can plug in
/// the null implementations in tests.
pub struct Accumulator<R, C> {
    config: AccumulatorConfig,
    resolver: R,
    redactor: C,
    groups: BTreeMap<Key, Group>,
    max_sec_seen: u64,
    process_filter: HashMap<i32, i32>,
    last_inventory_scan: Option<Instant>,
    last_inventory_emit: Option<Instant>,
}

impl<R, C> Accumulator<R, C>
where
    R: NameResolver,
    C: CmdlineRedactor,
{
    pub fn new(config: AccumulatorConfig, resolver: R, redactor: C) -> Self {
        Accumulator {
            config,
            resolver,
            redactor,
            groups: BTreeMap::new(),
            max_sec_seen: 0,
            process_filter: HashMap::new(),
            last_inventory_scan: None,
            last_inventory_emit: None,
        }
    }

    /// Feeds one raw record into the accumulator, possibly flushing the
    /// event it completes or events it makes stale (spec.md §4.3 "State").
    pub fn process_record<A, P>(
        &mut self,
        record_type: u32,
        text: &str,
        builder: &mut EventBuilder<'_, A, P>,
    ) -> Result<(), AccumulatorError>
    where
        A: EventAllocator,
        P: Prioritizer,
    {
        let parsed = match audit_line::parse(text) {
            Some(p) => p,
            None => {
                tracing::debug!(record_type, "dropping unparsable audit line");
                return Ok(());
            }
        };
        let id: Key = (parsed.id.seconds, parsed.id.milliseconds, parsed.id.serial);
        self.max_sec_seen = self.max_sec_seen.max(parsed.id.seconds);

        if record_type == EOE_RECORD_TYPE {
            // No group means every record for this id was itself ignorable
            // (or this is a bare EOE with nothing preceding it); either way
            // there is nothing to emit, matching "events that contain only
            // EOE are cancelled".
            return self.flush_one(id, builder);
        }

        let entry = self.groups.entry(id).or_insert_with(|| Group {
            sec: parsed.id.seconds,
            msec: parsed.id.milliseconds,
            serial: parsed.id.serial,
            records: Vec::new(),
        });
        entry.records.push(RawRecord {
            record_type,
            name: record_type_name(record_type),
            text: text.to_string(),
            fields: parsed.fields,
        });

        self.flush_stale(builder)?;
        self.enforce_capacity(builder)?;
        Ok(())
    }

    /// Scans `/proc`, always refreshing the process filter, and emits a
    /// synthetic inventory event at most once per
    /// `process_inventory_emit_interval` (spec.md §4.3 "Process inventory
    /// side-channel").
    pub fn run_process_inventory<A, P>(&mut self, builder: &mut EventBuilder<'_, A, P>) -> Result<(), AccumulatorError>
    where
        A: EventAllocator,
        P: Prioritizer,
    {
        let now = Instant::now();
        let due_scan = self
            .last_inventory_scan
            .map_or(true, |t| now.duration_since(t) >= self.config.process_inventory_scan_interval);
        if !due_scan {
            return Ok(());
        }
        self.last_inventory_scan = Some(now);

        let processes = match procfs::process::all_processes() {
            Ok(iter) => iter,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate /proc for process inventory");
                return Ok(());
            }
        };

        let mut entries: Vec<(i32, i32, String)> = Vec::new();
        for proc in processes {
            let proc = match proc {
                Ok(p) => p,
                Err(_) => continue,
            };
            let stat = match proc.stat() {
                Ok(s) => s,
                Err(_) => continue,
            };
            self.process_filter.insert(stat.pid, stat.ppid);
            entries.push((stat.pid, stat.ppid, stat.comm.clone()));
        }

        let due_emit = self
            .last_inventory_emit
            .map_or(true, |t| now.duration_since(t) >= self.config.process_inventory_emit_interval);
        if !due_emit || entries.is_empty() {
            return Ok(());
        }
        self.last_inventory_emit = Some(now);

        let records: Vec<RawRecord> = entries
            .into_iter()
            .map(|(pid, ppid, comm)| RawRecord {
                record_type: RECORD_TYPE_AUOMS_PROCESS_INVENTORY,
                name: "AUOMS_PROCESS_INVENTORY".to_string(),
                text: String::new(),
                fields: vec![
                    ("pid".to_string(), pid.to_string()),
                    ("ppid".to_string(), ppid.to_string()),
                    ("comm".to_string(), comm),
                ],
            })
            .collect();

        let (sec, msec) = unix_time_now();
        self.emit_records(sec, msec, 0, &records, true, builder)
    }

    fn flush_one<A, P>(&mut self, id: Key, builder: &mut EventBuilder<'_, A, P>) -> Result<(), AccumulatorError>
    where
        A: EventAllocator,
        P: Prioritizer,
    {
        let group = match self.groups.remove(&id) {
            Some(g) => g,
            None => return Ok(()),
        };
        self.emit_group(group, builder)
    }

    fn flush_stale<A, P>(&mut self, builder: &mut EventBuilder<'_, A, P>) -> Result<(), AccumulatorError>
    where
        A: EventAllocator,
        P: Prioritizer,
    {
        if self.max_sec_seen < self.config.flush_threshold_secs {
            return Ok(());
        }
        let cutoff = self.max_sec_seen - self.config.flush_threshold_secs;
        let stale: Vec<Key> = self
            .groups
            .range(..=(cutoff, u32::MAX, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            self.flush_one(key, builder)?;
        }
        Ok(())
    }

    fn enforce_capacity<A, P>(&mut self, builder: &mut EventBuilder<'_, A, P>) -> Result<(), AccumulatorError>
    where
        A: EventAllocator,
        P: Prioritizer,
    {
        while self.groups.len() > self.config.max_in_flight {
            match self.groups.keys().next().copied() {
                Some(oldest) => self.flush_one(oldest, builder)?,
                None => break,
            }
        }
        Ok(())
    }

    fn emit_group<A, P>(&mut self, group: Group, builder: &mut EventBuilder<'_, A, P>) -> Result<(), AccumulatorError>
    where
        A: EventAllocator,
        P: Prioritizer,
    {
        let mut records = group.records;
        let has_syscall = records.iter().any(|r| r.record_type == SYSCALL_RECORD_TYPE);
        let has_execve = records.iter().any(|r| r.record_type == EXECVE_RECORD_TYPE);
        let mut synthetic = false;

        if has_syscall && has_execve {
            let syscall_rec = records.iter().find(|r| r.record_type == SYSCALL_RECORD_TYPE).unwrap().clone();
            let execve_rec = records.iter().find(|r| r.record_type == EXECVE_RECORD_TYPE).unwrap().clone();
            let cwd_rec = records.iter().find(|r| r.record_type == CWD_RECORD_TYPE).cloned();
            let path0_rec = records
                .iter()
                .find(|r| r.record_type == PATH_RECORD_TYPE && field_value(r, "item") == Some("0"))
                .cloned();
            let is_full = cwd_rec.is_some() && path0_rec.is_some();

            let cmdline = self.redactor.redact(&assemble_cmdline(&execve_rec));
            let (cmdline, truncated) = truncate_cmdline(cmdline);

            const EXCLUDED: &[&str] = &["type", "items", "a0", "a1", "a2", "a3", "item"];
            let mut fields: Vec<(String, String)> = Vec::new();
            for source in [Some(&syscall_rec), cwd_rec.as_ref(), path0_rec.as_ref()].into_iter().flatten() {
                for (name, value) in &source.fields {
                    if EXCLUDED.contains(&name.as_str()) {
                        continue;
                    }
                    if !fields.iter().any(|(existing, _)| existing == name) {
                        fields.push((name.clone(), value.clone()));
                    }
                }
            }
            fields.push(("cmdline".to_string(), cmdline));
            fields.push(("cmdline_truncated".to_string(), truncated.to_string()));

            let (record_type, name) = if is_full {
                (RECORD_TYPE_AUOMS_EXECVE, "AUOMS_EXECVE")
            } else {
                (RECORD_TYPE_AUOMS_EXECVE_FRAGMENT, "AUOMS_EXECVE_FRAGMENT")
            };

            records.retain(|r| {
                !(r.record_type == SYSCALL_RECORD_TYPE
                    || r.record_type == EXECVE_RECORD_TYPE
                    || r.record_type == CWD_RECORD_TYPE
                    || (r.record_type == PATH_RECORD_TYPE && field_value(r, "item") == Some("0")))
            });
            records.push(RawRecord {
                record_type,
                name: name.to_string(),
                text: String::new(),
                fields,
            });
            synthetic = true;
        }

        let records: Vec<RawRecord> = records.into_iter().filter(|r| !r.fields.is_empty()).collect();
        if records.is_empty() {
            return Ok(());
        }
        self.emit_records(group.sec, group.msec, group.serial, &records, synthetic, builder)
    }

    fn emit_records<A, P>(
        &self,
        sec: u64,
        msec: u32,
        serial: u64,
        records: &[RawRecord],
        synthetic: bool,
        builder: &mut EventBuilder<'_, A, P>,
    ) -> Result<(), AccumulatorError>
    where
        A: EventAllocator,
        P: Prioritizer,
    {
        let hint = self.filter_hint(records);
        let attempt = (|| -> Result<(), BuilderError> {
            builder.begin_event(sec, msec, serial, records.len() as u16)?;
            if synthetic {
                builder.add_event_flags(event_flags::IS_SYNTHETIC)?;
            }
            if hint != 0 {
                builder.add_event_flags(event_flags::with_filter_hint(0, hint))?;
            }
            for record in records {
                builder.begin_record(record.record_type, &record.name, &record.text, record.fields.len() as u16)?;
                for (name, raw) in &record.fields {
                    let (field_type, interp) = self.interpret_field(name, raw);
                    builder.add_field(name, raw, interp.as_deref(), field_type)?;
                }
                builder.end_record()?;
            }
            builder.end_event()
        })();

        match attempt {
            Ok(()) => Ok(()),
            Err(BuilderError::QueueClosed) => Err(AccumulatorError::QueueClosed),
            Err(e) => {
                tracing::warn!(error = %e, "failed to build event; cancelling");
                builder.cancel_event();
                Ok(())
            }
        }
    }

    fn filter_hint(&self, records: &[RawRecord]) -> u8 {
        let pid = records
            .iter()
            .find_map(|r| field_value(r, "pid"))
            .and_then(|v| v.parse::<i32>().ok());
        match pid {
            Some(pid) if self.process_filter.contains_key(&pid) => 1,
            _ => 0,
        }
    }

    fn interpret_field(&self, name: &str, raw: &str) -> (FieldType, Option<String>) {
        let field_type = classify_field(name);
        let interp = match field_type {
            FieldType::Uid => Some(self.interpret_id(raw, |uid| self.resolver.resolve_user(uid))),
            FieldType::Gid => Some(self.interpret_id(raw, |gid| self.resolver.resolve_group(gid))),
            FieldType::Session => {
                if raw == "unset" || raw == "4294967295" {
                    Some("-1".to_string())
                } else {
                    None
                }
            }
            FieldType::Escaped | FieldType::Proctitle => {
                let (kind, decoded) = unescape_raw_field(raw);
                match kind {
                    UnescapeResult::Identical => None,
                    _ => Some(decoded),
                }
            }
            _ => None,
        };
        (field_type, interp)
    }

    fn interpret_id(&self, raw: &str, lookup: impl Fn(u32) -> Option<String>) -> String {
        match raw.parse::<i64>() {
            Ok(n) if n < 0 => "unset".to_string(),
            Ok(n) => lookup(n as u32).unwrap_or_else(|| format!("unknown({})", n)),
            Err(_) => format!("unknown({})", raw),
        }
    }
}

fn classify_field(name: &str) -> FieldType {
    match name {
        "uid" | "auid" | "euid" | "suid" | "fsuid" | "ouid" => FieldType::Uid,
        "gid" | "egid" | "sgid" | "fsgid" | "ogid" => FieldType::Gid,
        "ses" => FieldType::Session,
        "proctitle" => FieldType::Proctitle,
        "exe" | "comm" | "cwd" | "path" | "name" | "key" => FieldType::Escaped,
        _ => FieldType::Unclassified,
    }
}

fn field_value<'a>(record: &'a RawRecord, name: &str) -> Option<&'a str> {
    record.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

/// Reconstructs a shell command line from `argc`/`a<N>` EXECVE fields,
/// unescaping each argument then bash-escaping the result (spec.md §4.3).
fn assemble_cmdline(execve: &RawRecord) -> String {
    let mut args: Vec<(usize, String)> = Vec::new();
    for (name, raw) in &execve.fields {
        if let Some(idx_str) = name.strip_prefix('a') {
            if let Ok(idx) = idx_str.parse::<usize>() {
                let (_, decoded) = unescape_raw_field(raw);
                args.push((idx, decoded));
            }
        }
    }
    args.sort_by_key(|(idx, _)| *idx);
    args.into_iter().map(|(_, arg)| bash_escape(&arg)).collect::<Vec<_>>().join(" ")
}

fn truncate_cmdline(mut cmdline: String) -> (String, bool) {
    if cmdline.len() <= MAX_CMDLINE_LEN {
        return (cmdline, false);
    }
    while cmdline.len() > MAX_CMDLINE_LEN {
        cmdline.pop();
    }
    (cmdline, true)
}

fn record_type_name(record_type: u32) -> String {
    match record_type {
        1300 => "SYSCALL".to_string(),
        1302 => "PATH".to_string(),
        1307 => "CWD".to_string(),
        1309 => "EXECVE".to_string(),
        1320 => "EOE".to_string(),
        1327 => "PROCTITLE".to_string(),
        1106 => "USER_AUTH".to_string(),
        1108 => "USER_ACCT".to_string(),
        1112 => "USER_LOGIN".to_string(),
        1130 => "USER_START".to_string(),
        1131 => "USER_END".to_string(),
        other => format!("UNKNOWN[{}]", other),
    }
}

fn unix_time_now() -> (u64, u32) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (now.as_secs(), now.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use auoms_common::redactor::NullRedactor;
    use auoms_common::resolver::NullNameResolver;
    use auoms_event::allocator::VecAllocator;
    use auoms_event::prioritizer::DefaultPrioritizer;
    use auoms_event::Event;

    fn new_accumulator() -> Accumulator<NullNameResolver, NullRedactor> {
        Accumulator::new(AccumulatorConfig::default(), NullNameResolver, NullRedactor)
    }

    #[test]
    fn syscall_execve_cwd_path_assembles_full_execve_record() {
        let mut acc = new_accumulator();
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));

        let id = "audit(100.0:1)";
        acc.process_record(1300, &format!("{}: arch=c000003e syscall=59 success=yes pid=10 uid=0", id), &mut builder)
            .unwrap();
        acc.process_record(1309, &format!(r#"{}: argc=2 a0="logger" a1="hi there""#, id), &mut builder)
            .unwrap();
        acc.process_record(1307, &format!(r#"{}: cwd="/root""#, id), &mut builder).unwrap();
        acc.process_record(1302, &format!(r#"{}: item=0 name="/usr/bin/logger""#, id), &mut builder)
            .unwrap();
        acc.process_record(1320, &format!("{}: ", id), &mut builder).unwrap();

        let bytes = alloc.take_committed().expect("event should have been committed");
        let event = Event::parse(&bytes).unwrap();
        assert_eq!(event.num_records(), 1);
        let record = event.records().next().unwrap();
        assert_eq!(record.record_type, RECORD_TYPE_AUOMS_EXECVE);
        let cmdline = record
            .fields_in_insertion_order()
            .find(|f| f.name() == "cmdline")
            .unwrap();
        assert_eq!(cmdline.raw(), "logger 'hi there'");
        let truncated = record
            .fields_in_insertion_order()
            .find(|f| f.name() == "cmdline_truncated")
            .unwrap();
        assert_eq!(truncated.raw(), "false");
    }

    #[test]
    fn syscall_execve_without_cwd_path_emits_fragment() {
        let mut acc = new_accumulator();
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));

        let id = "audit(100.0:2)";
        acc.process_record(1300, &format!("{}: pid=11 uid=0", id), &mut builder).unwrap();
        acc.process_record(1309, &format!(r#"{}: argc=1 a0="true""#, id), &mut builder).unwrap();
        acc.process_record(1320, &format!("{}: ", id), &mut builder).unwrap();

        let bytes = alloc.take_committed().unwrap();
        let event = Event::parse(&bytes).unwrap();
        let record = event.records().next().unwrap();
        assert_eq!(record.record_type, RECORD_TYPE_AUOMS_EXECVE_FRAGMENT);
    }

    #[test]
    fn eoe_only_event_is_never_emitted() {
        let mut acc = new_accumulator();
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));

        acc.process_record(1320, "audit(1.0:1): ", &mut builder).unwrap();
        assert!(alloc.committed().is_none());
    }

    #[test]
    fn negative_uid_normalizes_to_unset() {
        let mut acc = new_accumulator();
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));

        acc.process_record(1300, "audit(1.0:1): uid=-1 pid=1", &mut builder).unwrap();
        acc.process_record(1320, "audit(1.0:1): ", &mut builder).unwrap();

        let bytes = alloc.take_committed().unwrap();
        let event = Event::parse(&bytes).unwrap();
        let record = event.records().next().unwrap();
        let uid_field = record.fields_in_insertion_order().find(|f| f.name() == "uid").unwrap();
        assert_eq!(uid_field.interp(), Some("unset"));
    }

    #[test]
    fn ses_normalizes_unset_tokens_to_minus_one() {
        let mut acc = new_accumulator();
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));

        acc.process_record(1300, "audit(1.0:1): ses=4294967295 pid=1", &mut builder).unwrap();
        acc.process_record(1320, "audit(1.0:1): ", &mut builder).unwrap();

        let bytes = alloc.take_committed().unwrap();
        let event = Event::parse(&bytes).unwrap();
        let record = event.records().next().unwrap();
        let ses_field = record.fields_in_insertion_order().find(|f| f.name() == "ses").unwrap();
        assert_eq!(ses_field.interp(), Some("-1"));
    }

    #[test]
    fn stale_incomplete_groups_flush_once_the_clock_advances() {
        let mut acc = new_accumulator();
        let mut alloc = VecAllocator::default();
        let mut builder = EventBuilder::new(&mut alloc, DefaultPrioritizer::new(4));

        acc.process_record(1300, "audit(1.0:1): pid=1", &mut builder).unwrap();
        assert!(alloc.committed().is_none());
        // No EOE ever arrives for id 1, but time advances well past the
        // default 1s flush threshold while handling an unrelated record.
        acc.process_record(1300, "audit(5.0:2): pid=2", &mut builder).unwrap();

        assert!(alloc.committed().is_some());
        let bytes = alloc.take_committed().unwrap();
        let event = Event::parse(&bytes).unwrap();
        assert_eq!(event.serial(), 1);
    }
}
