//! Catch-up scan over the committed log.
//!
//! A connection handler owns one [`Cursor`]. Every wake-up runs a full scan
//! from the cursor to the current end of the log, so wake-ups may be
//! coalesced freely: a dropped duplicate never loses a tap.
//!
//! ```text
//! log:     0 auth  1 create(apples)  2 msg  3 msg  4 invite(alex)  5 msg
//!                                                   ▲
//! alex:    cursor ─────────────────────────────────►│ backfill 1,2,3 then 4, 5
//! ```

use std::sync::Arc;

use crate::data::Data;
use crate::protocol::Event;

/// A user's read position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    user: String,
    position: usize,
}

impl Cursor {
    pub fn new(user: impl Into<String>, position: u64) -> Self {
        Self {
            user: user.into(),
            position: usize::try_from(position).unwrap_or(usize::MAX),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Index of the next tap to examine.
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// Collect every tap this user should receive between the cursor and the
    /// end of the log, in delivery order, and move the cursor to the end.
    ///
    /// A cursor past the end (a resume point from an earlier server run) is
    /// pulled back to the end so later taps are not skipped.
    pub fn advance(&mut self, data: &Data) -> Vec<Arc<Event>> {
        let end = data.len();
        let start = self.position.min(end);
        let mut out = Vec::new();

        for event in &data.log()[start..end] {
            if !data.visible(&self.user, event) {
                continue;
            }
            if self.is_admitted_by(data, event) {
                backfill(data, event, &mut out);
            }
            out.push(event.clone());
        }

        self.position = end;
        out
    }

    /// Whether `event` is the invite that admitted this cursor's user.
    fn is_admitted_by(&self, data: &Data, event: &Event) -> bool {
        event.invites(&self.user)
            && data
                .conversation(&event.conversation)
                .and_then(|c| c.admission(&self.user))
                == Some(event.sequence_id)
    }
}

/// Push the conversation's history preceding `invite`. Being named by the
/// invite is the admission, so visibility is not rechecked here.
fn backfill(data: &Data, invite: &Event, out: &mut Vec<Arc<Event>>) {
    let upto = usize::try_from(invite.sequence_id)
        .unwrap_or(usize::MAX)
        .min(data.len());
    log::trace!("Backfilling '{}' up to #{upto}", invite.conversation);
    out.extend(
        data.log()[..upto]
            .iter()
            .filter(|e| e.conversation == invite.conversation)
            .cloned(),
    );
}
