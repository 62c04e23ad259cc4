//! Typing-log codec.
//!
//! A raw log interleaves decimal millisecond delays with the characters they
//! precede. Current logs append a `|`-separated action section describing
//! every edit (insert, delete, replace) with its own timing; legacy logs carry
//! the delay stream only. [`decode`] turns either into a [`TypingLog`].

use std::borrow::Cow;
use std::io::{Read as _, Write as _};
use std::iter::Peekable;
use std::str::CharIndices;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::error::{TlError, TlResult};

/// Makes the next character literal in current logs.
pub const ACTION_ESCAPE: char = '\u{8}';
/// Makes the next character literal in legacy logs.
pub const LEGACY_ESCAPE: char = '\0';

const COMPRESSION_LEVEL: u32 = 6;
const DELAY_HEADER_FIELDS: usize = 3;
const ACTION_HEADER_FIELDS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOp {
    Insert,
    Delete,
    Replace,
}

impl EditOp {
    fn from_marker(marker: char) -> Option<Self> {
        match marker {
            '+' => Some(Self::Insert),
            '-' => Some(Self::Delete),
            '$' => Some(Self::Replace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    /// Position in the text box the edit applies to.
    pub index: usize,
    pub op: EditOp,
    pub ch: char,
}

/// One physical key press; autocorrect and selection replacement can make a
/// single press produce several edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystroke {
    pub delay_ms: u32,
    pub edits: Vec<Edit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyLog {
    pub quote: String,
    pub delays: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLog {
    pub quote: String,
    /// `delays[i]` precedes character `i`; `delays[0]` is the reaction delay.
    pub delays: Vec<u32>,
    pub keystrokes: Vec<Keystroke>,
}

impl ActionLog {
    /// Whether any keystroke removed or overwrote text.
    #[must_use]
    pub fn has_corrections(&self) -> bool {
        self.keystrokes.iter().any(|keystroke| {
            keystroke
                .edits
                .iter()
                .any(|edit| matches!(edit.op, EditOp::Delete | EditOp::Replace))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum TypingLog {
    Legacy(LegacyLog),
    Action(ActionLog),
}

impl TypingLog {
    #[must_use]
    pub fn quote(&self) -> &str {
        match self {
            Self::Legacy(log) => &log.quote,
            Self::Action(log) => &log.quote,
        }
    }

    #[must_use]
    pub fn delays(&self) -> &[u32] {
        match self {
            Self::Legacy(log) => &log.delays,
            Self::Action(log) => &log.delays,
        }
    }

    #[must_use]
    pub fn char_count(&self) -> usize {
        self.delays().len()
    }

    #[must_use]
    pub fn total_ms(&self) -> u64 {
        self.delays().iter().map(|delay| u64::from(*delay)).sum()
    }

    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }

    /// Characters after the first that arrived within `threshold_ms` of their
    /// predecessor, counted consecutively from index 1. They are treated as
    /// pre-typed and share the reaction delay.
    #[must_use]
    pub fn instant_chars(&self, threshold_ms: u32) -> usize {
        instant_chars(self.delays(), threshold_ms)
    }
}

#[must_use]
pub fn instant_chars(delays: &[u32], threshold_ms: u32) -> usize {
    delays
        .iter()
        .skip(1)
        .take_while(|delay| **delay <= threshold_ms)
        .count()
}

/// Decode a raw log. With `legacy` set the payload is parsed as a bare delay
/// stream; otherwise it must carry an action section.
pub fn decode(raw: &str, legacy: bool) -> TlResult<TypingLog> {
    let unescaped = unescape_control(raw);
    let text = unescaped.as_ref();

    if legacy {
        let (quote, delays) = parse_delay_stream(text, 0, LEGACY_ESCAPE, false)?;
        return Ok(TypingLog::Legacy(LegacyLog { quote, delays }));
    }

    let Some(pipe) = find_action_section(text) else {
        return Err(TlError::malformed(0, "missing action section"));
    };

    let head = &text[..pipe];
    let delay_start = skip_fields(head, 0, DELAY_HEADER_FIELDS)
        .ok_or_else(|| TlError::malformed(0, "truncated delay header"))?;
    let (quote, delays) = parse_delay_stream(&head[delay_start..], delay_start, ACTION_ESCAPE, true)?;

    let action_offset = pipe + 1;
    let keystrokes = parse_actions(&text[action_offset..], action_offset)?;

    Ok(TypingLog::Action(ActionLog {
        quote,
        delays,
        keystrokes,
    }))
}

/// Decode a raw log, choosing the legacy path when no action section exists.
pub fn decode_auto(raw: &str) -> TlResult<TypingLog> {
    let legacy = !has_action_section(raw);
    decode(raw, legacy)
}

#[must_use]
pub fn has_action_section(raw: &str) -> bool {
    find_action_section(&unescape_control(raw)).is_some()
}

/// Decode a log as stored locally, decompressing it first when needed.
pub fn decode_stored(bytes: &[u8], compressed: bool) -> TlResult<TypingLog> {
    let raw = if compressed {
        decompress_log(bytes)?
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|error| TlError::malformed(error.utf8_error().valid_up_to(), "not utf-8"))?
    };
    decode_auto(&raw)
}

pub fn compress_log(raw: &str) -> TlResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(raw.as_bytes())?;
    Ok(encoder.finish()?)
}

pub fn decompress_log(bytes: &[u8]) -> TlResult<String> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|error| TlError::DecompressionFailure(error.to_string()))?;
    String::from_utf8(out).map_err(|error| {
        TlError::DecompressionFailure(format!("decompressed log is not utf-8: {error}"))
    })
}

/// Logs relayed through JSON arrive with the escape byte spelled out.
fn unescape_control(raw: &str) -> Cow<'_, str> {
    if raw.contains("\\b") {
        Cow::Owned(raw.replace("\\b", "\u{8}"))
    } else {
        Cow::Borrowed(raw)
    }
}

/// Position of the `|` opening the action section: the first `|` followed by
/// `<digits>,<digits>,<digits>,0+`.
fn find_action_section(text: &str) -> Option<usize> {
    text.match_indices('|')
        .map(|(index, _)| index)
        .find(|index| is_action_header(&text[index + 1..]))
}

fn is_action_header(rest: &str) -> bool {
    let mut cursor = rest;
    for _ in 0..3 {
        let digits = cursor.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || cursor.as_bytes().get(digits) != Some(&b',') {
            return false;
        }
        cursor = &cursor[digits + 1..];
    }
    cursor.starts_with("0+")
}

/// Byte index just past the `count`-th comma at or after `from`.
fn skip_fields(text: &str, from: usize, count: usize) -> Option<usize> {
    let mut position = from;
    for _ in 0..count {
        let comma = text[position..].find(',')?;
        position += comma + 1;
    }
    Some(position)
}

fn parse_delay_stream(
    stream: &str,
    base: usize,
    escape: char,
    allow_negative: bool,
) -> TlResult<(String, Vec<u32>)> {
    let mut chars = stream.char_indices().peekable();
    let mut quote = String::new();
    let mut delays = Vec::new();

    while let Some(&(offset, first)) = chars.peek() {
        let negative_start = allow_negative
            && first == '-'
            && stream[offset + 1..].starts_with(|c: char| c.is_ascii_digit());
        if !first.is_ascii_digit() && !negative_start {
            return Err(TlError::malformed(
                base + offset,
                format!("character {first:?} without a preceding delay"),
            ));
        }

        let delay = read_number(&mut chars, stream, base, allow_negative)?;
        let clamped = u32::try_from(delay.max(0))
            .map_err(|_| TlError::malformed(base + offset, "delay out of range"))?;

        let Some((char_offset, ch)) = chars.next() else {
            return Err(TlError::malformed(
                base + stream.len(),
                "delay without a following character",
            ));
        };
        let typed = if ch == escape {
            match chars.next() {
                Some((_, literal)) => literal,
                None => {
                    return Err(TlError::malformed(
                        base + char_offset,
                        "escape at end of log",
                    ));
                }
            }
        } else {
            ch
        };

        quote.push(typed);
        delays.push(clamped);
    }

    if quote.is_empty() {
        return Err(TlError::malformed(base, "empty quote"));
    }
    Ok((quote, delays))
}

fn read_number(
    chars: &mut Peekable<CharIndices<'_>>,
    stream: &str,
    base: usize,
    allow_negative: bool,
) -> TlResult<i64> {
    let Some(&(start, _)) = chars.peek() else {
        return Err(TlError::malformed(base + stream.len(), "expected a number"));
    };
    let mut end = start;
    if allow_negative && chars.peek().is_some_and(|(_, c)| *c == '-') {
        chars.next();
        end += 1;
    }
    while let Some(&(index, c)) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        end = index + 1;
        chars.next();
    }

    let digits = &stream[start..end];
    if digits.is_empty() || digits == "-" {
        return Err(TlError::malformed(base + start, "expected a number"));
    }
    digits
        .parse::<i64>()
        .map_err(|_| TlError::malformed(base + start, format!("number {digits} out of range")))
}

fn parse_actions(section: &str, base: usize) -> TlResult<Vec<Keystroke>> {
    let section = section.trim_end_matches(['\r', '\n']);
    let mut chars = section.char_indices().peekable();

    for _ in 0..ACTION_HEADER_FIELDS {
        read_number(&mut chars, section, base, false)?;
        expect_char(&mut chars, section, base, ',')?;
    }

    let mut keystrokes = Vec::new();
    while chars.peek().is_some() {
        let delay_offset = chars.peek().map_or(0, |(offset, _)| *offset);
        let delay = read_number(&mut chars, section, base, false)?;
        let delay_ms = u32::try_from(delay)
            .map_err(|_| TlError::malformed(base + delay_offset, "delay out of range"))?;
        expect_char(&mut chars, section, base, ',')?;

        let mut edits = Vec::new();
        loop {
            match chars.peek() {
                Some((_, ',')) if !edits.is_empty() => {
                    chars.next();
                    break;
                }
                Some((_, c)) if c.is_ascii_digit() => {
                    edits.push(read_edit(&mut chars, section, base)?);
                }
                Some(&(offset, c)) => {
                    return Err(TlError::malformed(
                        base + offset,
                        format!("unexpected {c:?} in keystroke"),
                    ));
                }
                None => {
                    return Err(TlError::malformed(
                        base + section.len(),
                        "unterminated keystroke",
                    ));
                }
            }
        }

        keystrokes.push(Keystroke { delay_ms, edits });
    }

    Ok(keystrokes)
}

fn read_edit(
    chars: &mut Peekable<CharIndices<'_>>,
    section: &str,
    base: usize,
) -> TlResult<Edit> {
    let start = chars.peek().map_or(section.len(), |(offset, _)| *offset);
    let index = read_number(chars, section, base, false)?;
    let index = usize::try_from(index)
        .map_err(|_| TlError::malformed(base + start, "edit index out of range"))?;

    let Some((marker_offset, marker)) = chars.next() else {
        return Err(TlError::malformed(base + section.len(), "edit without operator"));
    };
    let op = EditOp::from_marker(marker).ok_or_else(|| {
        TlError::malformed(base + marker_offset, format!("unknown edit operator {marker:?}"))
    })?;
    let Some((_, ch)) = chars.next() else {
        return Err(TlError::malformed(base + section.len(), "edit without character"));
    };

    Ok(Edit { index, op, ch })
}

fn expect_char(
    chars: &mut Peekable<CharIndices<'_>>,
    section: &str,
    base: usize,
    expected: char,
) -> TlResult<()> {
    match chars.next() {
        Some((_, c)) if c == expected => Ok(()),
        Some((offset, c)) => Err(TlError::malformed(
            base + offset,
            format!("expected {expected:?}, found {c:?}"),
        )),
        None => Err(TlError::malformed(
            base + section.len(),
            format!("expected {expected:?} at end of log"),
        )),
    }
}
