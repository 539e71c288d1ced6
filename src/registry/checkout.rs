//! Identity registry with race-free checkout.
//!
//! The registry owns the Checkout Set. Listing the eligible identities,
//! filtering out busy ones and inserting the pick all happen under one lock,
//! so two concurrent checkouts can never return the same identity.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::registry::identity::Identity;
use crate::registry::source::IdentitySource;

/// How `checkout` picks among free identities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Uniform random pick. Avoids head-of-list contention and starvation.
    #[default]
    Random,
    /// Lexically first free identity. Deterministic, mostly for tests.
    FirstAvailable,
}

impl SelectionPolicy {
    fn pick<'a>(&self, candidates: &[&'a Identity]) -> Option<&'a Identity> {
        match self {
            Self::Random => candidates.choose(&mut rand::thread_rng()).copied(),
            Self::FirstAvailable => candidates.first().copied(),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Random => "random",
            Self::FirstAvailable => "first",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "first" | "first_available" => Ok(Self::FirstAvailable),
            other => Err(format!("unknown selection policy '{other}' (expected random or first)")),
        }
    }
}

/// Single source of truth for which identities exist and which are busy.
pub struct IdentityRegistry {
    source: Arc<dyn IdentitySource>,
    policy: SelectionPolicy,
    /// Identities bound to an in-flight job.
    checked_out: Mutex<HashSet<Identity>>,
}

impl IdentityRegistry {
    pub fn new(source: Arc<dyn IdentitySource>) -> Self {
        Self::with_policy(source, SelectionPolicy::default())
    }

    pub fn with_policy(source: Arc<dyn IdentitySource>, policy: SelectionPolicy) -> Self {
        Self {
            source,
            policy,
            checked_out: Mutex::new(HashSet::new()),
        }
    }

    /// Label of the underlying identity source.
    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Identities currently eligible to run.
    ///
    /// Source failures are logged and reported as an empty set; the registry
    /// itself never fails.
    pub async fn list_eligible(&self) -> BTreeSet<Identity> {
        match self.try_list_eligible().await {
            Ok(identities) => identities,
            Err(e) => {
                warn!(source = %self.source.name(), error = %e, "Failed to list eligible identities");
                BTreeSet::new()
            }
        }
    }

    /// Like [`list_eligible`](Self::list_eligible), but keeps a source
    /// failure apart from a genuinely empty set.
    pub async fn try_list_eligible(&self) -> Result<BTreeSet<Identity>, SourceError> {
        self.source.eligible_identities().await
    }

    /// Reserve one eligible, not-busy identity.
    ///
    /// Returns `None` when every eligible identity is already checked out or
    /// the eligible set is empty.
    pub async fn checkout(&self) -> Option<Identity> {
        let mut checked_out = self.checked_out.lock().await;
        let eligible = self.list_eligible().await;

        let candidates: Vec<&Identity> = eligible
            .iter()
            .filter(|identity| !checked_out.contains(*identity))
            .collect();

        let picked = self.policy.pick(&candidates)?.clone();
        checked_out.insert(picked.clone());

        debug!(
            identity = %picked,
            busy = checked_out.len(),
            eligible = eligible.len(),
            "Checked out identity"
        );
        Some(picked)
    }

    /// Release an identity. Idempotent: releasing a free or unknown identity
    /// is a no-op. Returns whether the identity was checked out.
    pub async fn checkin(&self, identity: &Identity) -> bool {
        let removed = self.checked_out.lock().await.remove(identity);
        if removed {
            debug!(identity = %identity, "Checked in identity");
        } else {
            debug!(identity = %identity, "Checkin of identity that was not checked out");
        }
        removed
    }

    pub async fn is_checked_out(&self, identity: &Identity) -> bool {
        self.checked_out.lock().await.contains(identity)
    }

    /// Identities currently checked out, sorted.
    pub async fn busy(&self) -> Vec<Identity> {
        let mut busy: Vec<Identity> = self.checked_out.lock().await.iter().cloned().collect();
        busy.sort();
        busy
    }

    pub async fn busy_count(&self) -> usize {
        self.checked_out.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::source::StaticSource;

    fn registry(names: &[&str], policy: SelectionPolicy) -> (IdentityRegistry, Arc<StaticSource>) {
        let source = Arc::new(StaticSource::from_names(names.iter().copied()).unwrap());
        let registry = IdentityRegistry::with_policy(source.clone(), policy);
        (registry, source)
    }

    fn id(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    #[tokio::test]
    async fn checkout_never_hands_out_a_busy_identity() {
        let (registry, _) = registry(&["a", "b", "c"], SelectionPolicy::Random);

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let picked = registry.checkout().await.expect("free identity");
            assert!(seen.insert(picked), "identity handed out twice");
        }
        assert!(registry.checkout().await.is_none());
        assert_eq!(registry.busy_count().await, 3);
    }

    #[tokio::test]
    async fn source_failure_is_distinct_from_empty_set() {
        use crate::registry::source::DescriptorDirSource;

        let dir = tempfile::tempdir().unwrap();
        let missing = Arc::new(DescriptorDirSource::new(dir.path().join("absent")));
        let registry = IdentityRegistry::new(missing);
        assert!(registry.try_list_eligible().await.is_err());
        assert!(registry.list_eligible().await.is_empty());

        let (empty, _) = self::registry(&[], SelectionPolicy::Random);
        assert!(empty.try_list_eligible().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkin_makes_identity_available_again() {
        let (registry, _) = registry(&["solo"], SelectionPolicy::Random);

        let picked = registry.checkout().await.unwrap();
        assert!(registry.checkout().await.is_none());
        assert!(registry.checkin(&picked).await);
        assert_eq!(registry.checkout().await, Some(picked));
    }

    #[tokio::test]
    async fn checkin_is_idempotent() {
        let (registry, _) = registry(&["a", "b"], SelectionPolicy::FirstAvailable);

        let a = registry.checkout().await.unwrap();
        assert!(registry.checkin(&a).await);
        assert!(!registry.checkin(&a).await);
        assert!(!registry.checkin(&id("never")).await);
        assert!(registry.busy().await.is_empty());
    }

    #[tokio::test]
    async fn first_available_is_lexical() {
        let (registry, _) = registry(&["c", "a", "b"], SelectionPolicy::FirstAvailable);

        assert_eq!(registry.checkout().await, Some(id("a")));
        assert_eq!(registry.checkout().await, Some(id("b")));
        assert_eq!(registry.busy().await, vec![id("a"), id("b")]);
    }

    #[tokio::test]
    async fn empty_source_yields_none() {
        let (registry, _) = registry(&[], SelectionPolicy::Random);
        assert!(registry.list_eligible().await.is_empty());
        assert!(registry.checkout().await.is_none());
    }

    #[tokio::test]
    async fn removed_identity_stays_checked_out_until_checkin() {
        let (registry, source) = registry(&["a"], SelectionPolicy::Random);

        let a = registry.checkout().await.unwrap();
        source.remove(&a).await;
        assert!(registry.is_checked_out(&a).await);
        assert!(registry.checkin(&a).await);
        assert!(registry.checkout().await.is_none());
    }

    #[tokio::test]
    async fn random_policy_reaches_every_identity() {
        let (registry, _) = registry(&["a", "b", "c", "d"], SelectionPolicy::Random);

        let mut seen = HashSet::new();
        for _ in 0..400 {
            let picked = registry.checkout().await.unwrap();
            registry.checkin(&picked).await;
            seen.insert(picked);
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checkouts_are_distinct() {
        let names: Vec<String> = (0..8).map(|i| format!("agent-{i}")).collect();
        let source = Arc::new(StaticSource::from_names(names).unwrap());
        let registry = Arc::new(IdentityRegistry::new(source));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.checkout().await }));
        }

        let mut picked = HashSet::new();
        let mut misses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Some(identity) => assert!(picked.insert(identity), "duplicate checkout"),
                None => misses += 1,
            }
        }
        assert_eq!(picked.len(), 8);
        assert_eq!(misses, 24);
    }

    #[test]
    fn selection_policy_parses() {
        assert_eq!("random".parse::<SelectionPolicy>(), Ok(SelectionPolicy::Random));
        assert_eq!("FIRST".parse::<SelectionPolicy>(), Ok(SelectionPolicy::FirstAvailable));
        assert!("round-robin".parse::<SelectionPolicy>().is_err());
    }
}
