//! Stream state machine (C5): the lifecycle of one multiplexed link,
//! independent of which physical socket either end happens to own.
//!
//! A [`Link`] only tracks confirmation state and the early-data buffer
//! (§3/§4.4); it never touches a socket or the control channel itself —
//! those belong to the per-link forwarding task in [`crate::client`] and
//! [`crate::server`], which call [`Link::push`] with bytes read from
//! whichever side they own and act on the returned [`PushOutcome`].

use bytes::Bytes;
use std::collections::VecDeque;

/// Early-data cap per unconfirmed link (§5: "1 MiB per unconfirmed link").
pub const EARLY_BUFFER_CAP: usize = 1024 * 1024;

/// Where a link is in its lifecycle (§4.4 state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, but the peer has not yet confirmed with its own `OPEN`.
    Opening,
    /// Confirmed; bytes forward directly in both directions.
    Ready,
    /// Torn down; no further bytes are accepted.
    Closed,
}

/// Result of pushing bytes into a link from whichever socket it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The link is `Ready`: forward these bytes immediately (as a `DATA`
    /// frame, or to the owned socket, depending on which side is pushing).
    Forward(Bytes),
    /// The link is still `Opening`; the bytes were appended to the early
    /// buffer and will be forwarded, in order, once [`Link::confirm`] runs.
    Buffered,
    /// The early buffer would exceed [`EARLY_BUFFER_CAP`]; the caller must
    /// close the link and emit `CLOSE`.
    Overflow,
    /// The link is already `Closed`; the bytes are dropped.
    Dropped,
}

/// Returned by [`Link::confirm`] when the link is not in `Opening` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("link is not awaiting confirmation")]
pub struct NotOpening;

/// One multiplexed stream's protocol-level state.
#[derive(Debug)]
pub struct Link {
    link_id: u32,
    state: LinkState,
    early_buffer: VecDeque<Bytes>,
    buffered_len: usize,
}

impl Link {
    /// A freshly opened, unconfirmed link.
    #[must_use]
    pub fn new(link_id: u32) -> Self {
        Self {
            link_id,
            state: LinkState::Opening,
            early_buffer: VecDeque::new(),
            buffered_len: 0,
        }
    }

    /// This link's id.
    #[must_use]
    pub fn link_id(&self) -> u32 {
        self.link_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Shorthand for `state() == Ready`.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Pushes a chunk of bytes read from whichever socket this side owns.
    ///
    /// While `Opening`, bytes are queued (invariant 3, §3) up to
    /// [`EARLY_BUFFER_CAP`]; once `Ready`, bytes pass straight through.
    /// Already-`Closed` links drop everything.
    pub fn push(&mut self, bytes: Bytes) -> PushOutcome {
        match self.state {
            LinkState::Ready => PushOutcome::Forward(bytes),
            LinkState::Closed => PushOutcome::Dropped,
            LinkState::Opening => {
                if self.buffered_len + bytes.len() > EARLY_BUFFER_CAP {
                    PushOutcome::Overflow
                } else {
                    self.buffered_len += bytes.len();
                    self.early_buffer.push_back(bytes);
                    PushOutcome::Buffered
                }
            }
        }
    }

    /// Confirms the link (receipt of the peer's `OPEN` ack) and drains the
    /// early buffer in arrival order for the caller to forward.
    ///
    /// # Errors
    ///
    /// Returns [`NotOpening`] if the link is not currently `Opening` (e.g.
    /// a second `OPEN` for an already-`Ready` link — §4.4 calls this a
    /// protocol error the caller should answer by closing the link).
    pub fn confirm(&mut self) -> Result<Vec<Bytes>, NotOpening> {
        if self.state != LinkState::Opening {
            return Err(NotOpening);
        }
        self.state = LinkState::Ready;
        self.buffered_len = 0;
        Ok(self.early_buffer.drain(..).collect())
    }

    /// Tears the link down. Idempotent (§4.4/§8: "`CLOSE` is idempotent").
    pub fn close(&mut self) {
        self.state = LinkState::Closed;
        self.early_buffer.clear();
        self.buffered_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_link_is_opening_and_unconfirmed() {
        let link = Link::new(1);
        assert_eq!(link.state(), LinkState::Opening);
        assert!(!link.is_confirmed());
    }

    #[test]
    fn push_while_opening_buffers_and_confirm_drains_in_order() {
        let mut link = Link::new(1);
        assert_eq!(link.push(Bytes::from_static(b"a")), PushOutcome::Buffered);
        assert_eq!(link.push(Bytes::from_static(b"b")), PushOutcome::Buffered);
        let drained = link.confirm().unwrap();
        assert_eq!(drained, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert!(link.is_confirmed());
    }

    #[test]
    fn push_while_ready_forwards_immediately() {
        let mut link = Link::new(1);
        link.confirm().unwrap();
        assert_eq!(
            link.push(Bytes::from_static(b"x")),
            PushOutcome::Forward(Bytes::from_static(b"x"))
        );
    }

    #[test]
    fn overflow_past_cap_does_not_buffer() {
        let mut link = Link::new(1);
        let chunk = Bytes::from(vec![0u8; EARLY_BUFFER_CAP]);
        assert_eq!(link.push(chunk), PushOutcome::Buffered);
        assert_eq!(link.push(Bytes::from_static(b"one more byte")), PushOutcome::Overflow);
    }

    #[test]
    fn closed_link_drops_pushes() {
        let mut link = Link::new(1);
        link.close();
        assert_eq!(link.push(Bytes::from_static(b"x")), PushOutcome::Dropped);
    }

    #[test]
    fn close_is_idempotent() {
        let mut link = Link::new(1);
        link.close();
        link.close();
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[test]
    fn confirming_twice_is_an_error() {
        let mut link = Link::new(1);
        link.confirm().unwrap();
        assert!(link.confirm().is_err());
    }

    #[test]
    fn confirming_a_closed_link_is_an_error() {
        let mut link = Link::new(1);
        link.close();
        assert!(link.confirm().is_err());
    }
}
