use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks which domains currently have an issuance attempt running in this process.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    domains: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `domain`. Returns `None` if another attempt already holds it.
    pub fn try_acquire(&self, domain: &str) -> Option<InFlightGuard> {
        let mut domains = self.domains.lock();
        if !domains.insert(domain.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            domains: self.domains.clone(),
            domain: domain.to_string(),
        })
    }

    pub fn is_running(&self, domain: &str) -> bool {
        self.domains.lock().contains(domain)
    }
}

/// Releases the domain when dropped, including on panic or cancellation.
#[must_use]
#[clippy::has_significant_drop]
#[derive(Debug)]
pub struct InFlightGuard {
    domains: Arc<Mutex<HashSet<String>>>,
    domain: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.domains.lock().remove(&self.domain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_released() {
        let in_flight = InFlight::new();

        let guard = in_flight.try_acquire("a.example.com").unwrap();
        assert!(in_flight.try_acquire("a.example.com").is_none());
        assert!(in_flight.is_running("a.example.com"));

        drop(guard);
        assert!(!in_flight.is_running("a.example.com"));
        assert!(in_flight.try_acquire("a.example.com").is_some());
    }

    #[test]
    fn test_domains_are_independent() {
        let in_flight = InFlight::new();

        let _a = in_flight.try_acquire("a.example.com").unwrap();
        let _b = in_flight.try_acquire("b.example.com").unwrap();
    }

    #[test]
    fn test_clones_share_state() {
        let in_flight = InFlight::new();
        let clone = in_flight.clone();

        let _guard = in_flight.try_acquire("a.example.com").unwrap();
        assert!(clone.try_acquire("a.example.com").is_none());
    }
}
