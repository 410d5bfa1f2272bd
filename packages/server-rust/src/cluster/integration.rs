//! Adoption of a taken-over store into the live broker runtime.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::store::{StoredDestination, TakenStore};

/// Integrates destinations and messages recovered by a takeover.
///
/// Must be safe to call again for the same target after a failure.
///
/// Used as `Arc<dyn TakeoverIntegrator>`.
#[async_trait]
pub trait TakeoverIntegrator: Send + Sync {
    async fn integrate(&self, target: &str, taken: &TakenStore) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct Adopted {
    destinations: HashSet<StoredDestination>,
    /// Message id to destination name.
    messages: HashMap<String, String>,
    /// Targets integrated, in order.
    targets: Vec<String>,
    failures_left: u32,
}

/// Records what it adopted. Can be told to fail a number of times.
#[derive(Debug, Default)]
pub struct MemoryIntegrator {
    inner: Mutex<Adopted>,
}

impl MemoryIntegrator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail before adopting anything.
    pub fn fail_next(&self, n: u32) {
        self.inner.lock().failures_left = n;
    }

    #[must_use]
    pub fn has_destination(&self, name: &str) -> bool {
        self.inner.lock().destinations.iter().any(|d| d.name == name)
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    #[must_use]
    pub fn integrated_targets(&self) -> Vec<String> {
        self.inner.lock().targets.clone()
    }
}

#[async_trait]
impl TakeoverIntegrator for MemoryIntegrator {
    async fn integrate(&self, target: &str, taken: &TakenStore) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.failures_left > 0 {
            inner.failures_left -= 1;
            anyhow::bail!("integration of {target} failed");
        }
        inner.destinations.extend(taken.destinations.iter().cloned());
        inner
            .messages
            .extend(taken.messages.iter().map(|(m, d)| (m.clone(), d.clone())));
        inner.targets.push(target.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_are_counted_down_then_adoption_happens() {
        let integrator = MemoryIntegrator::new();
        let taken = TakenStore {
            destinations: vec![StoredDestination {
                name: "orders".into(),
                is_queue: true,
            }],
            messages: HashMap::from([("m1".to_string(), "orders".to_string())]),
            ..TakenStore::default()
        };

        integrator.fail_next(1);
        assert!(integrator.integrate("b1", &taken).await.is_err());
        assert!(!integrator.has_destination("orders"));

        integrator.integrate("b1", &taken).await.unwrap();
        integrator.integrate("b1", &taken).await.unwrap();
        assert!(integrator.has_destination("orders"));
        assert_eq!(integrator.message_count(), 1);
        assert_eq!(integrator.integrated_targets(), vec!["b1", "b1"]);
    }
}
