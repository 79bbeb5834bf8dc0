use std::collections::HashSet;

use fuzzx_io::LocationId;

/// Coverage state of the whole search.
///
/// A location is covered once both its directions were taken;
/// `uncovered` holds discovered-but-untaken `(location, direction)`
/// pairs. The two sets are disjoint by construction: covering a
/// location removes its pending entry.
#[derive(Debug, Default)]
pub struct Coverage {
    pub covered: HashSet<LocationId>,
    pub uncovered: HashSet<(LocationId, bool)>,
    /// Locations whose subtree produced a crashing execution.
    pub locations_to_crashes: HashSet<LocationId>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_covered(&self, loc: LocationId) -> bool {
        self.covered.contains(&loc)
    }

    /// Registers one taken `(loc, direction)`. Returns
    /// `(discovered, covered)`: whether a new location entered the
    /// uncovered set, and whether this hit covered the location.
    pub fn on_branching_taken(&mut self, loc: LocationId, direction: bool) -> (bool, bool) {
        if self.covered.contains(&loc) {
            return (false, false);
        }
        if self.uncovered.remove(&(loc, direction)) {
            self.covered.insert(loc);
            (false, true)
        } else {
            let discovered = if self.uncovered.contains(&(loc, !direction)) {
                false
            } else {
                self.uncovered.insert((loc, !direction));
                true
            };
            (discovered, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_and_demotion() {
        let mut cov = Coverage::new();
        let loc = LocationId::flat(7);

        // First hit discovers the opposite direction.
        assert_eq!(cov.on_branching_taken(loc, true), (true, false));
        assert!(cov.uncovered.contains(&(loc, false)));

        // Re-taking the same direction changes nothing.
        assert_eq!(cov.on_branching_taken(loc, true), (false, false));

        // Taking the pending direction covers the location.
        assert_eq!(cov.on_branching_taken(loc, false), (false, true));
        assert!(cov.covered.contains(&loc));
        assert!(cov.uncovered.is_empty());

        // Covered locations are inert.
        assert_eq!(cov.on_branching_taken(loc, false), (false, false));
    }
}
