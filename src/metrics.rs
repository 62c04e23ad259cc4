//! Speed metrics derived from a decoded typing log.
//!
//! Every figure is `multiplier * characters / milliseconds`. The `raw` family
//! drops time spent on characters that were later corrected; `pauseless`
//! additionally flattens long hesitations. Legacy logs carry no edit stream
//! and only produce the unlagged and adjusted figures.

use serde::{Deserialize, Serialize};

use crate::codec::{ActionLog, EditOp, Keystroke, TypingLog};
use crate::config::MetricsConfig;
use crate::error::{TlError, TlResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub multiplier: u32,
    pub characters: usize,
    /// Sum of all delays, reaction delay included.
    pub duration_ms: f64,
    /// First delay after start-lag distribution.
    pub start_ms: f64,
    /// Whether the reaction delay was spread over pre-typed characters.
    pub distributed: bool,
    pub unlagged: f64,
    pub adjusted: f64,
    pub delays: Vec<f64>,
    pub raw: Option<RawMetrics>,
    pub typos: Vec<Typo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetrics {
    pub delays: Vec<f64>,
    pub start_ms: f64,
    pub duration_ms: f64,
    pub unlagged: f64,
    pub adjusted: f64,
    pub correction_time_ms: f64,
    pub correction_ratio: f64,
    pub pauseless: PauselessMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauselessMetrics {
    pub delays: Vec<f64>,
    pub duration_ms: f64,
    pub unlagged: f64,
    pub adjusted: f64,
    pub pause_time_ms: f64,
    pub pause_ratio: f64,
    /// Character indices whose delay was flattened.
    pub pauses: Vec<usize>,
}

/// First keystroke that made the text box diverge from the current word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typo {
    pub word_index: usize,
    /// Index into the quote of the offending character.
    pub char_index: usize,
    pub word: String,
}

/// Difference between the locally computed speed and the one the source
/// reported, which includes network latency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lag {
    pub lag: f64,
    pub ping_ms: f64,
}

/// Cumulative speed after each keystroke. `None` marks an undefined point
/// (no elapsed time yet).
pub type WpmCurve = Vec<Option<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WpmCurves {
    pub unlagged: WpmCurve,
    pub adjusted: WpmCurve,
    pub raw: Option<WpmCurve>,
    pub raw_adjusted: Option<WpmCurve>,
    pub pauseless: Option<WpmCurve>,
    pub pauseless_adjusted: Option<WpmCurve>,
}

impl Metrics {
    #[must_use]
    pub fn raw_unlagged(&self) -> Option<f64> {
        self.raw.as_ref().map(|raw| raw.unlagged)
    }

    #[must_use]
    pub fn raw_adjusted(&self) -> Option<f64> {
        self.raw.as_ref().map(|raw| raw.adjusted)
    }

    #[must_use]
    pub fn pauseless_adjusted(&self) -> Option<f64> {
        self.raw.as_ref().map(|raw| raw.pauseless.adjusted)
    }

    #[must_use]
    pub fn correction_time_ms(&self) -> Option<f64> {
        self.raw.as_ref().map(|raw| raw.correction_time_ms)
    }

    #[must_use]
    pub fn pause_time_ms(&self) -> Option<f64> {
        self.raw.as_ref().map(|raw| raw.pauseless.pause_time_ms)
    }

    /// Compare against the speed the source reported for the same race.
    #[must_use]
    pub fn lag(&self, reported_speed: f64) -> Option<Lag> {
        if reported_speed <= 0.0 {
            return None;
        }
        let lagged_ms = f64::from(self.multiplier) * self.characters as f64 / reported_speed;
        Some(Lag {
            lag: self.unlagged - reported_speed,
            ping_ms: lagged_ms.round() - self.duration_ms,
        })
    }

    #[must_use]
    pub fn curves(&self) -> WpmCurves {
        let multiplier = self.multiplier;
        WpmCurves {
            unlagged: keystroke_wpm(&self.delays, multiplier, false),
            adjusted: keystroke_wpm(&self.delays, multiplier, true),
            raw: self
                .raw
                .as_ref()
                .map(|raw| keystroke_wpm(&raw.delays, multiplier, false)),
            raw_adjusted: self
                .raw
                .as_ref()
                .map(|raw| keystroke_wpm(&raw.delays, multiplier, true)),
            pauseless: self
                .raw
                .as_ref()
                .map(|raw| keystroke_wpm(&raw.pauseless.delays, multiplier, false)),
            pauseless_adjusted: self
                .raw
                .as_ref()
                .map(|raw| keystroke_wpm(&raw.pauseless.delays, multiplier, true)),
        }
    }
}

/// Compute every metric the log supports.
///
/// # Errors
///
/// Returns [`TlError::MalformedLog`] when the delays sum to zero, since no
/// speed can be derived from an instantaneous race.
pub fn compute_metrics(
    log: &TypingLog,
    multiplier: u32,
    config: &MetricsConfig,
) -> TlResult<Metrics> {
    if multiplier == 0 {
        return Err(TlError::InvalidRequest(
            "universe multiplier must be positive".to_owned(),
        ));
    }

    let mut delays: Vec<f64> = log.delays().iter().map(|delay| f64::from(*delay)).collect();
    let characters = delays.len();
    let duration_ms: f64 = delays.iter().sum();
    if duration_ms <= 0.0 {
        return Err(TlError::malformed(0, "typing log has zero duration"));
    }

    let lagged_chars = distribute_start_lag(&mut delays, config.start_lag_threshold_ms);
    let start_ms = delays[0];
    let (unlagged, adjusted) = speeds(multiplier, characters, duration_ms, start_ms);

    let (raw, typos) = match log {
        TypingLog::Legacy(_) => (None, Vec::new()),
        TypingLog::Action(action) => (
            raw_metrics(action, &delays, duration_ms, multiplier, config),
            detect_typos(&action.quote, &action.keystrokes),
        ),
    };

    Ok(Metrics {
        multiplier,
        characters,
        duration_ms,
        start_ms,
        distributed: lagged_chars > 1,
        unlagged,
        adjusted,
        delays,
        raw,
        typos,
    })
}

/// Spread the reaction delay evenly over the first character and the
/// pre-typed characters that directly follow it. Returns how many characters
/// share it.
pub fn distribute_start_lag(delays: &mut [f64], threshold_ms: u32) -> usize {
    let Some(first) = delays.first().copied() else {
        return 0;
    };
    let threshold = f64::from(threshold_ms);
    let lagged_chars = 1 + delays
        .iter()
        .skip(1)
        .take_while(|delay| **delay <= threshold)
        .count();

    let share = first / lagged_chars as f64;
    for delay in &mut delays[..lagged_chars] {
        *delay = share;
    }
    lagged_chars
}

/// `(unlagged, adjusted)` over `characters` characters. The adjusted figure
/// drops the reaction delay and one character; with nothing left it falls
/// back to the unlagged one.
fn speeds(multiplier: u32, characters: usize, duration_ms: f64, start_ms: f64) -> (f64, f64) {
    let multiplier = f64::from(multiplier);
    let unlagged = multiplier * characters as f64 / duration_ms;
    let adjusted_base = duration_ms - start_ms;
    let adjusted = if adjusted_base > 0.0 && characters > 1 {
        multiplier * (characters - 1) as f64 / adjusted_base
    } else {
        unlagged
    };
    (unlagged, adjusted)
}

fn raw_metrics(
    action: &ActionLog,
    delays: &[f64],
    duration_ms: f64,
    multiplier: u32,
    config: &MetricsConfig,
) -> Option<RawMetrics> {
    let raw_delays = if action.has_corrections() {
        let mut replayed = replay_raw_delays(&action.keystrokes);
        if replayed.iter().sum::<f64>() <= 0.0 {
            return None;
        }
        distribute_start_lag(&mut replayed, config.start_lag_threshold_ms);
        while replayed.last() == Some(&0.0) {
            replayed.pop();
        }
        replayed.truncate(delays.len());
        let missing = delays.len() - replayed.len();
        replayed.extend_from_slice(&delays[delays.len() - missing..]);
        for (raw, delay) in replayed.iter_mut().zip(delays) {
            *raw = raw.min(*delay);
        }
        replayed
    } else {
        delays.to_vec()
    };

    let characters = raw_delays.len();
    let raw_duration: f64 = raw_delays.iter().sum();
    if raw_duration <= 0.0 {
        return None;
    }
    let raw_start = raw_delays[0];
    let (unlagged, adjusted) = speeds(multiplier, characters, raw_duration, raw_start);
    let correction_time_ms = (duration_ms - raw_duration).round();

    let pauseless = pauseless_metrics(&raw_delays, raw_duration, multiplier, config.pause_factor);

    Some(RawMetrics {
        start_ms: raw_start,
        duration_ms: raw_duration,
        unlagged,
        adjusted,
        correction_time_ms,
        correction_ratio: correction_time_ms / duration_ms,
        pauseless,
        delays: raw_delays,
    })
}

/// Replay the edit stream, keeping one delay per character that survived.
/// A replace is an implicit delete followed by an insert, and only the first
/// step of a keystroke carries its delay.
fn replay_raw_delays(keystrokes: &[Keystroke]) -> Vec<f64> {
    let mut raw = Vec::new();
    for keystroke in keystrokes {
        let mut step = 0usize;
        let mut apply = |op: EditOp, raw: &mut Vec<f64>| {
            let delay = if step == 0 {
                f64::from(keystroke.delay_ms)
            } else {
                0.0
            };
            step += 1;
            match op {
                EditOp::Insert | EditOp::Replace => raw.push(delay),
                EditOp::Delete => {
                    raw.pop();
                }
            }
        };
        for edit in &keystroke.edits {
            if edit.op == EditOp::Replace {
                apply(EditOp::Delete, &mut raw);
            }
            apply(edit.op, &mut raw);
        }
    }
    raw
}

fn pauseless_metrics(
    raw_delays: &[f64],
    raw_duration: f64,
    multiplier: u32,
    pause_factor: f64,
) -> PauselessMetrics {
    let raw_start = raw_delays[0];
    let rest = &raw_delays[1..];
    let average = rest.iter().sum::<f64>() / rest.len().max(1) as f64;
    let limit = average * pause_factor;

    let mut delays = Vec::with_capacity(raw_delays.len());
    let mut pauses = Vec::new();
    delays.push(raw_start);
    for (offset, delay) in rest.iter().enumerate() {
        if average > 0.0 && *delay >= limit {
            delays.push(average);
            pauses.push(offset + 1);
        } else {
            delays.push(*delay);
        }
    }

    let duration_ms: f64 = delays.iter().sum();
    let (unlagged, adjusted) = speeds(multiplier, delays.len(), duration_ms, delays[0]);
    let pause_time_ms = (raw_duration - duration_ms).round();

    PauselessMetrics {
        duration_ms,
        unlagged,
        adjusted,
        pause_time_ms,
        pause_ratio: pause_time_ms / raw_duration,
        pauses,
        delays,
    }
}

/// Cumulative speed after each keystroke. Adjusted curves, and curves whose
/// first delay is zero, skip the first keystroke and start undefined.
#[must_use]
pub fn keystroke_wpm(delays: &[f64], multiplier: u32, adjusted: bool) -> WpmCurve {
    let mut curve = Vec::with_capacity(delays.len());
    let mut remaining = delays;
    if !delays.is_empty() && (adjusted || delays[0] == 0.0) {
        remaining = &delays[1..];
        curve.push(None);
    }

    let multiplier = f64::from(multiplier);
    let mut elapsed = 0.0;
    for (index, delay) in remaining.iter().enumerate() {
        elapsed += delay;
        curve.push((elapsed > 0.0).then(|| multiplier * (index + 1) as f64 / elapsed));
    }
    curve
}

/// Replay the edit stream into a text box word by word and record where the
/// typist first went off track for each run of mistakes.
#[must_use]
pub fn detect_typos(quote: &str, keystrokes: &[Keystroke]) -> Vec<Typo> {
    let mut words: Vec<Vec<char>> = quote
        .split(' ')
        .map(|word| word.chars().chain(std::iter::once(' ')).collect())
        .collect();
    if let Some(last) = words.last_mut() {
        last.pop();
    }
    let quote_len = quote.chars().count();

    let mut typos = Vec::new();
    let mut in_typo = false;
    let mut word_index = 0usize;
    let mut completed_len = 0usize;
    let mut text_box: Vec<char> = Vec::new();

    'keystrokes: for keystroke in keystrokes {
        for edit in &keystroke.edits {
            match edit.op {
                EditOp::Insert => {
                    let at = edit.index.min(text_box.len());
                    text_box.insert(at, edit.ch);
                }
                EditOp::Replace => match text_box.get_mut(edit.index) {
                    Some(slot) => *slot = edit.ch,
                    None => text_box.push(edit.ch),
                },
                EditOp::Delete => {
                    if edit.index < text_box.len() {
                        text_box.remove(edit.index);
                    }
                }
            }

            let Some(word) = words.get(word_index) else {
                break 'keystrokes;
            };
            let diverged = text_box
                .iter()
                .zip(word.iter())
                .any(|(typed, expected)| typed != expected);

            if diverged && !in_typo && edit.op != EditOp::Delete {
                in_typo = true;
                let char_index = (completed_len + text_box.len()).saturating_sub(1);
                let word: String = word.iter().collect();
                typos.push(Typo {
                    word_index,
                    char_index,
                    word: word.trim_end().to_owned(),
                });
            } else if !diverged && in_typo {
                in_typo = false;
            }
        }

        while let Some(word) = words.get(word_index) {
            if !text_box.starts_with(word) {
                break;
            }
            completed_len += word.len();
            text_box.drain(..word.len());
            word_index += 1;
        }

        if completed_len == quote_len && word_index >= words.len() {
            break;
        }
    }

    typos
}
