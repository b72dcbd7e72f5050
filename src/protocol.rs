//! Classification of the controller's line protocol.
//!
//! The firmware prints free-form status text; a handful of markers carry
//! meaning. A line yields at most one status event (the most specific marker
//! wins), plus the ready signal and any sound cues it carries.

use thiserror::Error;

pub const READY_MARKER: &str = "Ready";
pub const TARE_COMPLETE_MARKER: &str = "Tare Complete";
pub const POURING_MARKER: &str = "Pouring:";
pub const STEP_OK_MARKER: &str = "Step OK";
pub const RECIPE_COMPLETE_PREFIX: &str = "RECIPE_COMPLETE:";
pub const SOUND_MARKER: &str = "SOUND:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundKind {
    StepComplete,
    Sparkle,
    Explosion,
}

impl SoundKind {
    pub const ALL: [SoundKind; 3] = [
        SoundKind::StepComplete,
        SoundKind::Sparkle,
        SoundKind::Explosion,
    ];

    pub fn token(self) -> &'static str {
        match self {
            SoundKind::StepComplete => "STEP_COMPLETE",
            SoundKind::Sparkle => "SPARKLE",
            SoundKind::Explosion => "EXPLOSION",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.token() == token)
    }

    /// Fixed per kind; the line never carries a count.
    pub fn repeat_count(self) -> u32 {
        match self {
            SoundKind::StepComplete | SoundKind::Sparkle => 1,
            SoundKind::Explosion => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    ReadySignal,
    TareComplete,
    PourStarted { liquid: String },
    StepComplete,
    RecipeComplete { total_weight: f64 },
    SoundCue { kind: SoundKind, repeat: u32 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("recipe total {payload:?} is not a number")]
    InvalidTotal { payload: String },
}

/// Turns one raw device line into typed events.
///
/// An empty result means the line was not recognised. A malformed
/// `RECIPE_COMPLETE:` payload rejects the whole line.
pub fn classify(line: &str) -> Result<Vec<ProtocolEvent>, ParseError> {
    let line = line.trim();
    let mut events = Vec::new();

    if let Some(event) = classify_status(line)? {
        events.push(event);
    }
    // Readiness belongs to the link, not the record.
    if line.contains(READY_MARKER) {
        events.push(ProtocolEvent::ReadySignal);
    }
    events.extend(sound_cues(line));

    Ok(events)
}

fn classify_status(line: &str) -> Result<Option<ProtocolEvent>, ParseError> {
    if let Some(payload) = line.strip_prefix(RECIPE_COMPLETE_PREFIX) {
        let total_weight = parse_total(payload)?;
        return Ok(Some(ProtocolEvent::RecipeComplete { total_weight }));
    }

    if line.contains(TARE_COMPLETE_MARKER) {
        return Ok(Some(ProtocolEvent::TareComplete));
    }

    if let Some(idx) = line.find(POURING_MARKER) {
        let liquid = line[idx + POURING_MARKER.len()..].trim();
        if !liquid.is_empty() {
            return Ok(Some(ProtocolEvent::PourStarted {
                liquid: liquid.to_string(),
            }));
        }
    }

    if line.contains(STEP_OK_MARKER) {
        return Ok(Some(ProtocolEvent::StepComplete));
    }

    Ok(None)
}

fn parse_total(payload: &str) -> Result<f64, ParseError> {
    // Firmware may append further colon-separated fields; the total is the first.
    let raw = payload.split(':').next().unwrap_or_default().trim();

    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseError::InvalidTotal {
            payload: payload.to_string(),
        }),
    }
}

fn sound_cues(line: &str) -> Vec<ProtocolEvent> {
    line.match_indices(SOUND_MARKER)
        .filter_map(|(idx, _)| {
            let rest = &line[idx + SOUND_MARKER.len()..];
            let end = rest
                .find(|c: char| !(c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'))
                .unwrap_or(rest.len());
            SoundKind::from_token(&rest[..end])
        })
        .map(|kind| ProtocolEvent::SoundCue {
            kind,
            repeat: kind.repeat_count(),
        })
        .collect()
}
