//! Per-stage reply aggregation under the milter priority rules

use crate::session::Stage;

/// The aggregated standing of a stage.
///
/// `NotChange` means no backend has weighed in yet; everything else mirrors
/// the wire verdict that currently wins the stage.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NotChange,
    Continue,
    Reject,
    Discard,
    Accept,
    TemporaryFailure,
    Skip,
}

impl Verdict {
    /// Whether `incoming` displaces `current` as the standing of `stage`.
    ///
    /// The more definitive verdict wins. Two stage-dependent special cases:
    /// at the recipient stage `Discard` beats `Reject`, so a message one
    /// filter wants dropped entirely is not merely per-recipient rejected;
    /// everywhere else `Reject` beats `Discard`.
    fn displaces(current: Self, incoming: Self, stage: Stage) -> bool {
        match current {
            Verdict::Reject => stage == Stage::RcptTo && incoming == Verdict::Discard,
            Verdict::Discard => stage != Stage::RcptTo && incoming == Verdict::Reject,
            Verdict::TemporaryFailure => incoming != Verdict::NotChange,
            Verdict::Accept => !matches!(
                incoming,
                Verdict::NotChange | Verdict::TemporaryFailure
            ),
            Verdict::Skip => !matches!(
                incoming,
                Verdict::NotChange | Verdict::Accept | Verdict::TemporaryFailure
            ),
            Verdict::Continue => !matches!(
                incoming,
                Verdict::NotChange | Verdict::Accept | Verdict::TemporaryFailure | Verdict::Skip
            ),
            Verdict::NotChange => true,
        }
    }
}

/// The current aggregated verdict of every stage, keyed by [`Stage`]
#[derive(Debug)]
pub struct VerdictBoard {
    standings: [Verdict; Stage::COUNT],
}

impl Default for VerdictBoard {
    fn default() -> Self {
        Self {
            standings: [Verdict::NotChange; Stage::COUNT],
        }
    }
}

impl VerdictBoard {
    /// The standing of `stage`
    #[must_use]
    pub fn get(&self, stage: Stage) -> Verdict {
        self.standings[stage.index()]
    }

    /// Fold one backend's `verdict` for `stage` into the standing
    pub fn compile(&mut self, stage: Stage, verdict: Verdict) {
        let current = self.get(stage);
        if Verdict::displaces(current, verdict, stage) {
            self.standings[stage.index()] = verdict;
        }
    }

    /// Open `stage` for a fresh round of replies
    pub fn reset(&mut self, stage: Stage) {
        self.standings[stage.index()] = Verdict::NotChange;
    }

    /// Forget all standings, e.g. when a message is aborted
    pub fn reset_all(&mut self) {
        self.standings = [Verdict::NotChange; Stage::COUNT];
    }
}
