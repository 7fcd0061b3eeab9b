//! The live header list, mirroring what the message looks like after all
//! modifications applied so far

use bytes::BytesMut;

/// An ordered list of `name: value` headers.
///
/// Tracks the message headers as the MTA reported them, updated in arrival
/// order with the modifications backends request at end-of-message.
#[derive(Debug, Default)]
pub struct Headers {
    entries: Vec<(BytesMut, BytesMut)>,
}

impl Headers {
    /// An empty header list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header after all existing ones
    pub fn add(&mut self, name: &[u8], value: &[u8]) {
        self.entries
            .push((BytesMut::from(name), BytesMut::from(value)));
    }

    /// Insert a header so it becomes the `position`-th entry, 1-based.
    ///
    /// Positions past the end append.
    pub fn insert(&mut self, position: u32, name: &[u8], value: &[u8]) {
        let at = (position as usize)
            .saturating_sub(1)
            .min(self.entries.len());
        self.entries
            .insert(at, (BytesMut::from(name), BytesMut::from(value)));
    }

    /// Change the `occurrence`-th header called `name` (1-based, counting
    /// only headers with that name). An empty value deletes the entry.
    ///
    /// Returns whether a matching header existed.
    pub fn change(&mut self, name: &[u8], occurrence: u32, value: &[u8]) -> bool {
        let mut seen = 0;
        for index in 0..self.entries.len() {
            if !self.entries[index].0.eq_ignore_ascii_case(name) {
                continue;
            }
            seen += 1;
            if seen == occurrence {
                if value.is_empty() {
                    self.entries.remove(index);
                } else {
                    self.entries[index].1 = BytesMut::from(value);
                }
                return true;
            }
        }
        false
    }

    /// How many headers are present
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no headers are present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate all headers in order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries
            .iter()
            .map(|(name, value)| (&name[..], &value[..]))
    }

    /// Forget everything, e.g. on abort
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
