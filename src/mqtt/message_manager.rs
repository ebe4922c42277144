//! Inbound message decoding.
//!
//! Turns a raw `(topic, payload)` pair into a [`Command`]. Anything that is not a
//! well-formed command comes back as a [`DecodeError`] which the control loop logs
//! and drops.

use super::config::Topics;
use std::num::IntErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Requested level, not yet clamped.
    SetLevel(i64),
    GetLevel,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown topic {topic}")]
    UnknownTopic { topic: String },

    #[error("payload is not UTF-8")]
    NotUtf8,

    #[error("payload {payload:?} is not an integer")]
    NotAnInteger { payload: String },
}

impl Command {
    pub fn decode(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        if topic == topics.set_level {
            let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
            parse_level(text).map(Command::SetLevel)
        } else if topic == topics.get_level {
            Ok(Command::GetLevel)
        } else {
            Err(DecodeError::UnknownTopic {
                topic: topic.to_string(),
            })
        }
    }
}

/// Parses an ASCII integer. Values beyond `i64` saturate; they get clamped later anyway.
fn parse_level(text: &str) -> Result<i64, DecodeError> {
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    match trimmed.parse::<i64>() {
        Ok(value) => Ok(value),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Ok(i64::MAX),
            IntErrorKind::NegOverflow => Ok(i64::MIN),
            _ => Err(DecodeError::NotAnInteger {
                payload: trimmed.to_string(),
            }),
        },
    }
}
