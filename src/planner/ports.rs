//! Port allocation for step and service containers

use ahash::AHashSet;

use crate::pipeline::StageExecutionError;

/// Hands out ports for containers sharing one pod or VM.
///
/// Ports increase monotonically from the starting port and skip anything in
/// the reserved set. One finder lives for a single plan build.
#[derive(Debug, Clone)]
pub struct PortFinder {
    next: u32,
    used: AHashSet<u16>,
}

impl PortFinder {
    /// Creates a finder starting at `start` that never returns a `reserved` port.
    pub fn new(start: u16, reserved: impl IntoIterator<Item = u16>) -> Self {
        Self {
            next: u32::from(start),
            used: reserved.into_iter().collect(),
        }
    }

    /// Next free port.
    ///
    /// # Errors
    ///
    /// Returns [`StageExecutionError::PortsExhausted`] once the port range is used up.
    pub fn next_port(&mut self) -> Result<u16, StageExecutionError> {
        loop {
            let candidate =
                u16::try_from(self.next).map_err(|_| StageExecutionError::PortsExhausted {
                    last: u16::MAX,
                })?;
            self.next += 1;
            if self.used.insert(candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Ports handed out or reserved so far, ascending
    #[must_use]
    pub fn used_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.used.iter().copied().collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_ports_are_sequential() {
        let mut finder = PortFinder::new(20002, []);
        assert_eq!(finder.next_port().unwrap(), 20002);
        assert_eq!(finder.next_port().unwrap(), 20003);
        assert_eq!(finder.next_port().unwrap(), 20004);
    }

    #[test]
    fn test_reserved_ports_are_skipped() {
        let mut finder = PortFinder::new(20001, [20001, 20003]);
        assert_eq!(finder.next_port().unwrap(), 20002);
        assert_eq!(finder.next_port().unwrap(), 20004);
        assert_eq!(finder.used_ports(), vec![20001, 20002, 20003, 20004]);
    }

    #[test]
    fn test_exhausted_range() {
        let mut finder = PortFinder::new(u16::MAX, []);
        assert_eq!(finder.next_port().unwrap(), u16::MAX);
        assert_eq!(
            finder.next_port(),
            Err(StageExecutionError::PortsExhausted { last: u16::MAX })
        );
    }

    proptest! {
        #[test]
        fn test_ports_unique_and_above_start(
            start in 1024u16..60000,
            reserved in proptest::collection::vec(1024u16..61000, 0..20),
            count in 1usize..50,
        ) {
            let mut finder = PortFinder::new(start, reserved.clone());
            let mut seen = AHashSet::new();
            for _ in 0..count {
                let port = finder.next_port().unwrap();
                prop_assert!(port >= start);
                prop_assert!(!reserved.contains(&port));
                prop_assert!(seen.insert(port));
            }
            prop_assert_eq!(seen.len(), count);
        }
    }
}
