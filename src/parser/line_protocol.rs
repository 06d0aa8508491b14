use crate::parser::{ParseError, Parser};
use crate::sink::{FieldValue, Point};

/// Parser for InfluxDB line protocol.
///
/// `measurement[,tag=value...] field=value[,field=value...] [timestamp]`
///
/// Only the first non-blank, non-comment line of a payload is used.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineProtocolParser;

impl LineProtocolParser {
    pub fn new() -> Self {
        Self
    }
}

impl Parser for LineProtocolParser {
    fn parse(&self, payload: &[u8]) -> Result<Option<Point>, ParseError> {
        let text = std::str::from_utf8(payload)?;
        let line = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'));

        match line {
            Some(line) => parse_line(line).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_line(line: &str) -> Result<Point, ParseError> {
    let key_end = find_unescaped(line, ' ', false).ok_or(ParseError::MissingFields)?;
    let key = &line[..key_end];
    let rest = line[key_end + 1..].trim_start_matches(' ');
    if rest.is_empty() {
        return Err(ParseError::MissingFields);
    }

    let (fields, timestamp) = match find_unescaped(rest, ' ', true) {
        Some(end) => (&rest[..end], rest[end + 1..].trim()),
        None => (rest, ""),
    };

    let mut key_parts = split_unescaped(key, ',', false).into_iter();
    let measurement = key_parts.next().map(unescape).unwrap_or_default();
    if measurement.is_empty() {
        return Err(ParseError::MissingMeasurement);
    }
    let mut point = Point::new(measurement);

    for tag in key_parts {
        let (tag_key, tag_value) =
            split_pair(tag, false).ok_or_else(|| ParseError::InvalidTag(tag.to_string()))?;
        let (tag_key, tag_value) = (unescape(tag_key), unescape(tag_value));
        if tag_key.is_empty() || tag_value.is_empty() {
            return Err(ParseError::InvalidTag(tag.to_string()));
        }
        point.tags.insert(tag_key, tag_value);
    }

    for field in split_unescaped(fields, ',', true) {
        let invalid = || ParseError::InvalidField(field.to_string());
        let (field_key, raw_value) = split_pair(field, true).ok_or_else(invalid)?;
        let field_key = unescape(field_key);
        if field_key.is_empty() {
            return Err(invalid());
        }
        let value = parse_field_value(raw_value).ok_or_else(invalid)?;
        point.fields.insert(field_key, value);
    }

    if point.fields.is_empty() {
        return Err(ParseError::MissingFields);
    }

    let mut timestamp_parts = timestamp.split_whitespace();
    if let Some(ts) = timestamp_parts.next() {
        let ts = ts
            .parse::<i64>()
            .map_err(|_| ParseError::InvalidTimestamp(ts.to_string()))?;
        point.timestamp = Some(ts);
    }
    if let Some(extra) = timestamp_parts.next() {
        return Err(ParseError::TrailingContent(extra.to_string()));
    }

    Ok(point)
}

fn parse_field_value(raw: &str) -> Option<FieldValue> {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Some(FieldValue::String(unescape_string(&raw[1..raw.len() - 1])));
    }

    match raw {
        "t" | "T" | "true" | "True" | "TRUE" => return Some(FieldValue::Boolean(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Some(FieldValue::Boolean(false)),
        _ => {}
    }

    if let Some(number) = raw.strip_suffix('i') {
        return number.parse().ok().map(FieldValue::Integer);
    }
    if let Some(number) = raw.strip_suffix('u') {
        return number.parse().ok().map(FieldValue::UInteger);
    }

    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(FieldValue::Float)
}

/// Byte index of the first `target` not preceded by a backslash and, when
/// `quotes` is set, not inside a double-quoted string
fn find_unescaped(text: &str, target: char, quotes: bool) -> Option<usize> {
    let mut escaped = false;
    let mut in_quotes = false;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if quotes => in_quotes = !in_quotes,
            c if c == target && !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

fn split_unescaped(text: &str, delimiter: char, quotes: bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(i) = find_unescaped(rest, delimiter, quotes) {
        parts.push(&rest[..i]);
        rest = &rest[i + delimiter.len_utf8()..];
    }
    parts.push(rest);
    parts
}

fn split_pair(text: &str, quotes: bool) -> Option<(&str, &str)> {
    find_unescaped(text, '=', quotes).map(|i| (&text[..i], &text[i + 1..]))
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if matches!(next, ',' | '=' | ' ') {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn unescape_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if matches!(next, '"' | '\\') {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}
