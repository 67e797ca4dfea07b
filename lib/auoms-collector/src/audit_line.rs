//! Parsing of one raw kernel AUDIT netlink payload into an id and an
//! ordered `name=value` field list (spec.md §4.3 "Input").
//!
//! The kernel's wire payload for a user-space-visible audit record is the
//! text that begins `audit(<sec>.<msec>:<serial>): ` followed by
//! whitespace-separated `key=value` pairs, where a value may be a
//! double-quoted string containing spaces. This is the same grammar
//! `auparse` tokenizes; we implement just enough of it to split fields
//! apart without re-interpreting their meaning (that's `accumulator::interpret_field`).

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditId {
    pub seconds: u64,
    pub milliseconds: u32,
    pub serial: u64,
}

#[derive(Debug, Clone)]
pub struct ParsedLine {
    pub id: AuditId,
    /// `(name, raw_value)` pairs in the order they appeared on the line.
    pub fields: Vec<(String, String)>,
}

/// Parses `audit(1521757638.392:262332): k=v k="v v" ...`.
pub fn parse(text: &str) -> Option<ParsedLine> {
    let text = text.trim();
    let rest = text.strip_prefix("audit(")?;
    let close = rest.find(')')?;
    let header = &rest[..close];
    let (sec_msec, serial) = header.split_once(':')?;
    let (sec, msec) = sec_msec.split_once('.')?;

    let id = AuditId {
        seconds: sec.parse().ok()?,
        milliseconds: msec.parse().ok()?,
        serial: serial.parse().ok()?,
    };

    let after = rest[close + 1..].trim_start().strip_prefix(':').unwrap_or(&rest[close + 1..]);
    let fields = tokenize_fields(after.trim_start());

    Some(ParsedLine { id, fields })
}

/// Splits `k=v k="v v" k=` into `(k, v)` pairs, respecting double quotes so a
/// quoted value may contain spaces (e.g. `exe="/usr/bin/has space"`).
fn tokenize_fields(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = s.char_indices().peekable();
    let bytes = s.as_bytes();

    while let Some(&(start, _)) = chars.peek() {
        // skip leading whitespace
        if bytes[start].is_ascii_whitespace() {
            chars.next();
            continue;
        }
        // find the end of this token, respecting one quoted span
        let mut end = start;
        let mut in_quotes = false;
        while let Some(&(i, c)) = chars.peek() {
            if c == '"' {
                in_quotes = !in_quotes;
            } else if c.is_whitespace() && !in_quotes {
                break;
            }
            end = i + c.len_utf8();
            chars.next();
        }
        let token = &s[start..end];
        if let Some((name, value)) = token.split_once('=') {
            out.push((name.to_string(), value.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_simple_fields() {
        let line = "audit(1521757638.392:262332): arch=c000003e syscall=59 success=yes pid=26918";
        let parsed = parse(line).unwrap();
        assert_eq!(parsed.id, AuditId { seconds: 1521757638, milliseconds: 392, serial: 262332 });
        assert_eq!(parsed.fields[0], ("arch".to_string(), "c000003e".to_string()));
        assert_eq!(parsed.fields[3], ("pid".to_string(), "26918".to_string()));
    }

    #[test]
    fn keeps_quoted_values_with_embedded_spaces_intact() {
        let line = r#"audit(1.0:1): a0="hello world" a1="-t""#;
        let parsed = parse(line).unwrap();
        assert_eq!(parsed.fields[0], ("a0".to_string(), "\"hello world\"".to_string()));
        assert_eq!(parsed.fields[1], ("a1".to_string(), "\"-t\"".to_string()));
    }

    #[test]
    fn rejects_lines_without_the_audit_header() {
        assert!(parse("not an audit line").is_none());
    }
}
