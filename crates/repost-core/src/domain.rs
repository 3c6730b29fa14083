use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Telegram chat id (numeric).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Channel message id (numeric, assigned monotonically by the platform).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId(pub i32);

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reference to the source channel: either a numeric `-100...` id or a
/// public username (stored without the leading `@`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRef {
    Id(i64),
    Username(String),
}

impl FromStr for ChannelRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('@');
        if s.is_empty() {
            return Err(Error::Config("empty channel reference".to_string()));
        }
        if let Ok(id) = s.parse::<i64>() {
            return Ok(ChannelRef::Id(id));
        }
        Ok(ChannelRef::Username(s.to_string()))
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRef::Id(id) => id.fmt(f),
            ChannelRef::Username(name) => write!(f, "@{name}"),
        }
    }
}

/// Probe direction for `MessageLocator::find_latest_valid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}
