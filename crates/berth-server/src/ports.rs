use std::collections::HashMap;

use crate::error::Error;

/// Monotonic-with-reuse port allocator over a configured inclusive range.
///
/// The cursor only moves forward during normal operation; freed ports are
/// reused because allocation skips anything still present in the port index.
/// The cursor is a performance hint, not a correctness invariant; reload
/// recomputes a safe lower bound via [`PortAllocator::reset_floor`].
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    next: u16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            next: start,
        }
    }

    /// Hand out the lowest unassigned port at or above the cursor.
    pub fn allocate(&mut self, in_use: &HashMap<u16, String>) -> Result<u16, Error> {
        loop {
            if self.next > self.end {
                return Err(Error::Exhausted {
                    start: self.start,
                    end: self.end,
                });
            }
            let candidate = self.next;
            self.next = self.next.saturating_add(1);
            if !in_use.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Bump the cursor past an externally observed assignment (snapshot
    /// reload, out-of-band edits).
    pub fn observe(&mut self, port: u16) {
        if port >= self.next && port <= self.end {
            self.next = port.saturating_add(1);
        }
    }

    /// Recompute the cursor from a full set of current assignments.
    pub fn reset_floor<'a>(&mut self, ports: impl Iterator<Item = &'a u16>) {
        self.next = self.start;
        for p in ports {
            self.observe(*p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved(ports: &[u16]) -> HashMap<u16, String> {
        ports.iter().map(|p| (*p, "x".to_string())).collect()
    }

    #[test]
    fn allocates_sequentially_from_start() {
        let mut a = PortAllocator::new(8500, 8999);
        let in_use = HashMap::new();
        assert_eq!(a.allocate(&in_use).unwrap(), 8500);
        assert_eq!(a.allocate(&in_use).unwrap(), 8501);
    }

    #[test]
    fn skips_ports_still_assigned() {
        let mut a = PortAllocator::new(8500, 8999);
        let in_use = reserved(&[8500, 8501, 8503]);
        assert_eq!(a.allocate(&in_use).unwrap(), 8502);
        assert_eq!(a.allocate(&in_use).unwrap(), 8504);
    }

    #[test]
    fn exhausts_past_the_range_end() {
        let mut a = PortAllocator::new(8500, 8501);
        let in_use = HashMap::new();
        a.allocate(&in_use).unwrap();
        a.allocate(&in_use).unwrap();
        let err = a.allocate(&in_use).unwrap_err();
        assert!(matches!(
            err,
            Error::Exhausted {
                start: 8500,
                end: 8501
            }
        ));
    }

    #[test]
    fn reset_floor_reuses_released_low_ports() {
        let mut a = PortAllocator::new(8500, 8999);
        let mut in_use = reserved(&[8500, 8501, 8502]);
        for _ in 0..3 {
            a.allocate(&HashMap::new()).unwrap();
        }

        // 8501 was released; a plain allocate would not go back for it.
        in_use.remove(&8501);
        a.reset_floor(in_use.keys());
        // Cursor sits past the highest observed assignment.
        assert_eq!(a.allocate(&in_use).unwrap(), 8503);
    }

    #[test]
    fn observe_never_moves_the_cursor_backwards() {
        let mut a = PortAllocator::new(8500, 8999);
        a.observe(8510);
        a.observe(8505);
        assert_eq!(a.allocate(&HashMap::new()).unwrap(), 8511);
    }
}
