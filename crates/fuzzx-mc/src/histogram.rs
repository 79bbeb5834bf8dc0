use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-location direction hit counts: `[false hits, true hits]`.
pub type HitCounts = HashMap<u32, [u32; 2]>;

/// One immutable layer of accumulated hit counts.
///
/// Pivots along the same path share their history: each pivot's frame
/// holds only the counts of its path segment and chains to the frame
/// of the previous pivot, so merging walks the chain with
/// nearest-frame-wins semantics.
#[derive(Debug, Default)]
pub struct HitCountFrame {
    local: HitCounts,
    predecessor: Option<Arc<HitCountFrame>>,
}

impl HitCountFrame {
    pub fn new(predecessor: Option<Arc<HitCountFrame>>) -> Self {
        Self {
            local: HitCounts::new(),
            predecessor,
        }
    }

    pub fn local(&self) -> &HitCounts {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut HitCounts {
        &mut self.local
    }

    pub fn predecessor(&self) -> Option<&Arc<HitCountFrame>> {
        self.predecessor.as_ref()
    }

    /// Flattens the chain; the closest frame's entry wins per
    /// location.
    pub fn merge(&self) -> HitCounts {
        let mut result = HitCounts::new();
        let mut frame: Option<&HitCountFrame> = Some(self);
        while let Some(f) = frame {
            for (&id, &counts) in &f.local {
                if let Entry::Vacant(entry) = result.entry(id) {
                    entry.insert(counts);
                }
            }
            frame = f.predecessor.as_deref();
        }
        result
    }
}

pub fn total_hits(counts: &[u32; 2]) -> u32 {
    counts[0] + counts[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_frame_wins_on_merge() {
        let mut base = HitCountFrame::new(None);
        base.local_mut().insert(1, [4, 0]);
        base.local_mut().insert(2, [1, 1]);
        let base = Arc::new(base);

        let mut top = HitCountFrame::new(Some(Arc::clone(&base)));
        top.local_mut().insert(1, [5, 3]);

        let merged = top.merge();
        assert_eq!(merged[&1], [5, 3]);
        assert_eq!(merged[&2], [1, 1]);
    }
}
