//! Ordering of the post-DATA pipeline: which commands have been issued and
//! which sessions still wait for their turn

use crate::session::SessionId;

/// The sequenced commands after DATA, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// `EOH`
    EndOfHeader,
    /// `BODY`, entered once no matter how many chunks flow
    Body,
    /// `EOM`
    EndOfMessage,
}

/// Tracks the post-DATA command history and the sessions yet to walk it.
///
/// `commands` grows monotonically as the MTA issues end-of-header, body and
/// end-of-message; `waiting` holds the sessions that have not finished the
/// pipeline, in their configured order. The head of `waiting` is the session
/// currently being fed.
#[derive(Debug, Default)]
pub struct Sequencer {
    commands: Vec<Phase>,
    waiting: Vec<SessionId>,
    primed: bool,
}

impl Sequencer {
    /// Record that `phase` has been issued, enrolling every live session on
    /// first use.
    ///
    /// [`Phase::Body`] is recorded only once regardless of chunk count.
    pub fn begin(&mut self, phase: Phase, live: impl Iterator<Item = SessionId>) {
        if !(phase == Phase::Body && self.commands.contains(&Phase::Body)) {
            self.commands.push(phase);
        }

        if !self.primed {
            self.waiting = live.collect();
            self.primed = true;
        }
    }

    /// The phases issued so far, in order
    #[must_use]
    pub fn commands(&self) -> &[Phase] {
        &self.commands
    }

    /// The first issued phase strictly after `phase`, if any
    #[must_use]
    pub fn next_after(&self, phase: Phase) -> Option<Phase> {
        let position = self.commands.iter().position(|&issued| issued == phase)?;
        self.commands.get(position + 1).copied()
    }

    /// The sessions still owed the pipeline, current leader first
    pub fn waiting(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.waiting.iter().copied()
    }

    /// Whether `id` still waits for (part of) the pipeline
    #[must_use]
    pub fn is_waiting(&self, id: SessionId) -> bool {
        self.waiting.contains(&id)
    }

    /// Drop `id` from the waiting line, done or gone
    pub fn remove(&mut self, id: SessionId) {
        self.waiting.retain(|&waiting| waiting != id);
    }

    /// Forget all sequencing state for the next message
    pub fn reset(&mut self) {
        self.commands.clear();
        self.waiting.clear();
        self.primed = false;
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn body_is_recorded_once() {
        let mut sequencer = Sequencer::default();
        sequencer.begin(Phase::EndOfHeader, [0, 1].into_iter());
        sequencer.begin(Phase::Body, [0, 1].into_iter());
        sequencer.begin(Phase::Body, [0, 1].into_iter());
        sequencer.begin(Phase::EndOfMessage, [0, 1].into_iter());

        assert_eq!(
            sequencer.commands(),
            &[Phase::EndOfHeader, Phase::Body, Phase::EndOfMessage]
        );
    }

    #[test]
    fn enrollment_happens_only_once() {
        let mut sequencer = Sequencer::default();
        sequencer.begin(Phase::EndOfHeader, [0, 1].into_iter());
        sequencer.remove(0);
        // Sessions appearing later do not re-enroll
        sequencer.begin(Phase::Body, [0, 1, 2].into_iter());

        assert_eq!(sequencer.waiting().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn next_after_follows_issue_order() {
        let mut sequencer = Sequencer::default();
        sequencer.begin(Phase::EndOfHeader, [0].into_iter());

        assert_eq!(sequencer.next_after(Phase::EndOfHeader), None);

        sequencer.begin(Phase::Body, [0].into_iter());
        sequencer.begin(Phase::EndOfMessage, [0].into_iter());

        assert_eq!(sequencer.next_after(Phase::EndOfHeader), Some(Phase::Body));
        assert_eq!(sequencer.next_after(Phase::Body), Some(Phase::EndOfMessage));
        assert_eq!(sequencer.next_after(Phase::EndOfMessage), None);
    }

    #[test]
    fn reset_clears_everything() {
        let mut sequencer = Sequencer::default();
        sequencer.begin(Phase::EndOfMessage, [0, 1].into_iter());
        sequencer.reset();

        assert!(sequencer.commands().is_empty());
        assert_eq!(sequencer.waiting().count(), 0);
    }
}
