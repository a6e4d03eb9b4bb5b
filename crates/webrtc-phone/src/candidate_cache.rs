use parking_lot::Mutex;

use crate::media::IceCandidate;

/// Ordered buffer of candidates waiting to be sent (or applied).
///
/// `push` and `drain` share one lock, so a candidate appended while another
/// task drains lands either in that drain or in the next one; it is never
/// dropped.
#[derive(Debug, Default)]
pub struct CandidateCache {
    pending: Mutex<Vec<IceCandidate>>,
}

impl CandidateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, candidate: IceCandidate) {
        self.pending.lock().push(candidate);
    }

    /// Take everything cached so far, in discovery order.
    pub fn drain(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
