//! Stream half-states.
//!
//! Every stream has an initial half and a reply half, each moving
//! through `opening -> opened -> closing -> closed` independently. The
//! eight flags pack into one word; `opened` implies `opening` and
//! `closed` implies `closing`, so predicates are simple bit tests.

const INITIAL_OPENING: u32 = 0x10;
const INITIAL_OPENED: u32 = 0x20;
const INITIAL_CLOSING: u32 = 0x40;
const INITIAL_CLOSED: u32 = 0x80;

const REPLY_OPENING: u32 = 0x01;
const REPLY_OPENED: u32 = 0x02;
const REPLY_CLOSING: u32 = 0x04;
const REPLY_CLOSED: u32 = 0x08;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamState(u32);

impl StreamState {
    pub fn opening_initial(self) -> Self {
        Self(self.0 | INITIAL_OPENING)
    }

    pub fn opened_initial(self) -> Self {
        Self(self.0 | INITIAL_OPENING | INITIAL_OPENED)
    }

    pub fn closing_initial(self) -> Self {
        Self(self.0 | INITIAL_CLOSING)
    }

    pub fn closed_initial(self) -> Self {
        Self(self.0 | INITIAL_CLOSING | INITIAL_CLOSED)
    }

    pub fn opening_reply(self) -> Self {
        Self(self.0 | REPLY_OPENING)
    }

    pub fn opened_reply(self) -> Self {
        Self(self.0 | REPLY_OPENING | REPLY_OPENED)
    }

    pub fn closing_reply(self) -> Self {
        Self(self.0 | REPLY_CLOSING)
    }

    pub fn closed_reply(self) -> Self {
        Self(self.0 | REPLY_CLOSING | REPLY_CLOSED)
    }

    pub fn initial_opening(&self) -> bool {
        self.0 & INITIAL_OPENING != 0
    }

    pub fn initial_opened(&self) -> bool {
        self.0 & INITIAL_OPENED != 0
    }

    pub fn initial_closing(&self) -> bool {
        self.0 & INITIAL_CLOSING != 0
    }

    pub fn initial_closed(&self) -> bool {
        self.0 & INITIAL_CLOSED != 0
    }

    pub fn reply_opening(&self) -> bool {
        self.0 & REPLY_OPENING != 0
    }

    pub fn reply_opened(&self) -> bool {
        self.0 & REPLY_OPENED != 0
    }

    pub fn reply_closing(&self) -> bool {
        self.0 & REPLY_CLOSING != 0
    }

    pub fn reply_closed(&self) -> bool {
        self.0 & REPLY_CLOSED != 0
    }

    pub fn closed(&self) -> bool {
        self.initial_closed() && self.reply_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_has_no_flags() {
        let state = StreamState::default();
        assert!(!state.initial_opening());
        assert!(!state.reply_opening());
        assert!(!state.closed());
    }

    #[test]
    fn test_opened_implies_opening() {
        let state = StreamState::default().opened_initial();
        assert!(state.initial_opening());
        assert!(state.initial_opened());
        assert!(!state.initial_closed());
    }

    #[test]
    fn test_closed_implies_closing() {
        let state = StreamState::default().closed_reply();
        assert!(state.reply_closing());
        assert!(state.reply_closed());
    }

    #[test]
    fn test_halves_are_independent() {
        let state = StreamState::default().opened_initial().closed_reply();
        assert!(state.initial_opened());
        assert!(!state.initial_closed());
        assert!(state.reply_closed());
        assert!(!state.closed());
    }

    #[test]
    fn test_closed_needs_both_halves() {
        let state = StreamState::default().closed_initial().closed_reply();
        assert!(state.closed());
    }
}
