//! Just enough RFC 5322 header scanning to label a captured message.
//! The raw source is never re-encoded; this only peeks at the header
//! block to pull out the subject and origination date.

use chrono::{DateTime, FixedOffset};

#[derive(Debug, Default, PartialEq)]
pub struct HeaderSummary {
    pub subject: String,
    pub date: Option<DateTime<FixedOffset>>,
}

/// Scan the header block of `source`, unfolding continuation lines,
/// and extract the fields we index on. Parsing is best effort: an
/// unparseable date is simply absent.
pub fn extract(source: &[u8]) -> HeaderSummary {
    let mut summary = HeaderSummary::default();

    for (name, value) in header_fields(source) {
        if name.eq_ignore_ascii_case("subject") && summary.subject.is_empty() {
            summary.subject = value;
        } else if name.eq_ignore_ascii_case("date") && summary.date.is_none() {
            summary.date = DateTime::parse_from_rfc2822(&value).ok();
        }
    }

    summary
}

/// Iterate the header block as (name, unfolded value) pairs.
/// Stops at the first empty line. Bytes outside ASCII are replaced
/// rather than rejected; capture must not fail on weird input.
fn header_fields(source: &[u8]) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = vec![];

    for raw_line in source.split(|&b| b == b'\n') {
        let line = trim_cr(raw_line);
        if line.is_empty() {
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            // Continuation of the previous field.
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(String::from_utf8_lossy(line).trim());
            }
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            // Not a header line; the block is over as far as we care.
            break;
        };
        let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
        let value = String::from_utf8_lossy(&line[colon + 1..])
            .trim()
            .to_string();
        fields.push((name, value));
    }

    fields
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}
