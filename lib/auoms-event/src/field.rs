//! Field type tagging and read-only field views (spec.md §3 "Each field").

use byteorder::{ByteOrder, LittleEndian};

use crate::layout::field_header;

/// Field classification, used by the Accumulator's field interpretation
/// (spec.md §4.3) to decide how to decode `raw` into `interp`.
///
/// The wire value is whatever was assigned at build time; unrecognized
/// values round-trip as [`FieldType::Unknown`] so a newer writer's fields
/// never become unreadable to an older reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Unclassified,
    Uid,
    Gid,
    Escaped,
    Proctitle,
    Session,
    Unescaped,
    Unknown(u16),
}

impl FieldType {
    pub fn to_wire(self) -> u16 {
        match self {
            FieldType::Unclassified => 0,
            FieldType::Uid => 1,
            FieldType::Gid => 2,
            FieldType::Escaped => 3,
            FieldType::Proctitle => 4,
            FieldType::Session => 5,
            FieldType::Unescaped => 6,
            FieldType::Unknown(v) => v,
        }
    }

    pub fn from_wire(value: u16) -> Self {
        match value {
            0 => FieldType::Unclassified,
            1 => FieldType::Uid,
            2 => FieldType::Gid,
            3 => FieldType::Escaped,
            4 => FieldType::Proctitle,
            5 => FieldType::Session,
            6 => FieldType::Unescaped,
            other => FieldType::Unknown(other),
        }
    }
}

/// A borrowed, decoded view over one field's bytes.
#[derive(Debug, Clone, Copy)]
pub struct Field<'a> {
    pub field_type: FieldType,
    name_raw: &'a [u8],
    raw_raw: &'a [u8],
    interp_raw: Option<&'a [u8]>,
}

impl<'a> Field<'a> {
    /// Parses a field starting at `buf[0..]`. Returns the field view and the
    /// total number of bytes consumed.
    pub fn parse(buf: &'a [u8]) -> Option<(Field<'a>, usize)> {
        if buf.len() < field_header::FIXED_SIZE {
            return None;
        }
        let field_type = FieldType::from_wire(LittleEndian::read_u16(&buf[field_header::FIELD_TYPE..]));
        let name_size = LittleEndian::read_u16(&buf[field_header::NAME_SIZE..]) as usize;
        let raw_size = LittleEndian::read_u32(&buf[field_header::RAW_SIZE..]) as usize;
        let interp_size = LittleEndian::read_u32(&buf[field_header::INTERP_SIZE..]) as usize;

        let mut offset = field_header::FIXED_SIZE;
        if buf.len() < offset + name_size + raw_size + interp_size {
            return None;
        }

        let name_raw = strip_nul(&buf[offset..offset + name_size]);
        offset += name_size;
        let raw_raw = strip_nul(&buf[offset..offset + raw_size]);
        offset += raw_size;
        let interp_raw = if interp_size > 0 {
            Some(strip_nul(&buf[offset..offset + interp_size]))
        } else {
            None
        };
        offset += interp_size;

        Some((
            Field {
                field_type,
                name_raw,
                raw_raw,
                interp_raw,
            },
            offset,
        ))
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(self.name_raw).unwrap_or("")
    }

    pub fn raw(&self) -> &str {
        std::str::from_utf8(self.raw_raw).unwrap_or("")
    }

    pub fn interp(&self) -> Option<&str> {
        self.interp_raw.map(|b| std::str::from_utf8(b).unwrap_or(""))
    }
}

fn strip_nul(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(pos) => &buf[..pos],
        None => buf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_round_trips_through_wire_values() {
        for ft in [
            FieldType::Unclassified,
            FieldType::Uid,
            FieldType::Gid,
            FieldType::Escaped,
            FieldType::Proctitle,
            FieldType::Session,
            FieldType::Unescaped,
        ] {
            assert_eq!(FieldType::from_wire(ft.to_wire()), ft);
        }
        assert_eq!(FieldType::from_wire(999), FieldType::Unknown(999));
    }
}
