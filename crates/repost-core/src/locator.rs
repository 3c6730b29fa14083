use std::sync::Arc;

use tracing::debug;

use crate::{
    domain::{ChannelRef, Direction, MessageId},
    errors::Error,
    ports::MessengerPort,
    Result,
};

/// Tri-state answer for a single message probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Existence {
    Exists,
    NotFound,
    Inaccessible,
}

/// Result of a bounded bidirectional scan around a candidate id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// Best known forwardable id. Equals the starting id when nothing was
    /// found (`found == false`).
    pub resolved_id: MessageId,
    pub found: bool,
    /// Inclusive range of ids actually checked, for diagnostics. Collapses
    /// to `(from, from)` when the scan checked nothing.
    pub probed: (MessageId, MessageId),
}

fn note_probed(range: &mut Option<(MessageId, MessageId)>, id: MessageId) {
    *range = Some(match *range {
        None => (id, id),
        Some((lo, hi)) => (lo.min(id), hi.max(id)),
    });
}

/// Resolves the latest forwardable message around a stored candidate id.
///
/// The platform offers no "get latest message" call for channels, so the
/// locator probes individual ids: first a sweep in the preferred direction,
/// then the opposite direction as fallback. Forward sweeps keep the *newest*
/// existing id in range; backward sweeps stop at the first hit, since every
/// older id is by definition less recent.
pub struct MessageLocator {
    messenger: Arc<dyn MessengerPort>,
    channel: ChannelRef,
}

impl MessageLocator {
    pub fn new(messenger: Arc<dyn MessengerPort>, channel: ChannelRef) -> Self {
        Self { messenger, channel }
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    /// Probe a single id. Transport errors collapse to `Inaccessible`.
    pub async fn validate(&self, id: MessageId) -> Existence {
        match self.messenger.message_exists(&self.channel, id).await {
            Ok(true) => Existence::Exists,
            Ok(false) => Existence::NotFound,
            Err(_) => Existence::Inaccessible,
        }
    }

    async fn check(&self, id: MessageId) -> Result<bool> {
        self.messenger
            .message_exists(&self.channel, id)
            .await
            .map_err(|e| Error::Inaccessible(e.to_string()))
    }

    /// Find the latest valid message id, starting from `from` and probing at
    /// most `max_probe` ids in each direction.
    ///
    /// An unreachable channel aborts the scan immediately; a merely missing
    /// id is part of normal operation and the scan continues.
    pub async fn find_latest_valid(
        &self,
        from: MessageId,
        direction: Direction,
        max_probe: u32,
    ) -> Result<Resolution> {
        let (primary, fallback) = match direction {
            Direction::Forward => (Direction::Forward, Direction::Backward),
            Direction::Backward => (Direction::Backward, Direction::Forward),
        };

        let mut range = None;

        for dir in [primary, fallback] {
            let hit = match dir {
                Direction::Forward => self.sweep_forward(from, max_probe, &mut range).await?,
                Direction::Backward => self.sweep_backward(from, max_probe, &mut range).await?,
            };
            if let Some(id) = hit {
                debug!(%id, ?dir, "resolved forwardable message");
                return Ok(Resolution {
                    resolved_id: id,
                    found: true,
                    probed: range.unwrap_or((from, from)),
                });
            }
        }

        let probed = range.unwrap_or((from, from));
        debug!(%from, lo = %probed.0, hi = %probed.1, "no forwardable message in probed range");
        Ok(Resolution {
            resolved_id: from,
            found: false,
            probed,
        })
    }

    /// Probe `from+1 ..= from+max_probe`, returning the newest existing id.
    async fn sweep_forward(
        &self,
        from: MessageId,
        max_probe: u32,
        range: &mut Option<(MessageId, MessageId)>,
    ) -> Result<Option<MessageId>> {
        let mut newest = None;
        for step in 1..=max_probe as i32 {
            let id = MessageId(from.0.saturating_add(step));
            note_probed(range, id);
            if self.check(id).await? {
                newest = Some(id);
            }
        }
        Ok(newest)
    }

    /// Probe `from` downwards (inclusive), never below id 1, returning the
    /// first existing id.
    async fn sweep_backward(
        &self,
        from: MessageId,
        max_probe: u32,
        range: &mut Option<(MessageId, MessageId)>,
    ) -> Result<Option<MessageId>> {
        for step in 0..max_probe as i32 {
            let raw = from.0 - step;
            if raw < 1 {
                break;
            }
            let id = MessageId(raw);
            note_probed(range, id);
            if self.check(id).await? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}
