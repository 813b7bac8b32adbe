//! Value-space index
//!
//! Tracks which accepted registration owns each claimed identifier. Only
//! accepted registrations (and reserved built-in types) appear here; pending
//! or rejected registrations own nothing.
//!
//! Identifiers are unique per `(identifier kind, group, value)`. The scope
//! flag is recorded on the owner for diagnostics but is not part of the key:
//! a plural accepted for a namespaced type also blocks the same plural for a
//! cluster-scoped type in that group, because the router resolves requests
//! by `(group, version, plural)` alone.

use parking_lot::RwLock;
use registrar_crd::{IdentifierKind, RegistrationSpec};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// One claimable identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueKey {
    pub kind: IdentifierKind,
    pub group: String,
    pub value: String,
}

impl ValueKey {
    pub fn new(kind: IdentifierKind, group: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            group: group.into(),
            value: value.into(),
        }
    }

    /// Every key a spec claims, deduplicated
    pub fn for_spec(spec: &RegistrationSpec) -> BTreeSet<ValueKey> {
        spec.claimed_identifiers()
            .into_iter()
            .map(|(kind, value)| ValueKey::new(kind, spec.group.clone(), value))
            .collect()
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\" in group {}", self.kind, self.value, self.group)
    }
}

/// Owner of a set of keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub registration: String,
    pub cluster_scoped: bool,
}

/// A candidate key already held by someone else
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: ValueKey,
    pub owner: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is already claimed by {}", self.key, self.owner)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValueSpaceIndex {
    by_key: HashMap<ValueKey, Owner>,
    by_owner: HashMap<String, BTreeSet<ValueKey>>,
    /// Bumped on every effective mutation
    revision: u64,
}

impl ValueSpaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn owner(&self, key: &ValueKey) -> Option<&Owner> {
        self.by_key.get(key)
    }

    /// Whether the registration currently owns any identifiers
    pub fn is_owner(&self, registration: &str) -> bool {
        self.by_owner.contains_key(registration)
    }

    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.by_owner.keys().map(String::as_str)
    }

    pub fn claims_of(&self, registration: &str) -> impl Iterator<Item = &ValueKey> {
        self.by_owner.get(registration).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// First candidate held by an owner other than `registration`
    pub fn find_conflict<'a>(
        &self,
        registration: &str,
        candidates: impl IntoIterator<Item = &'a ValueKey>,
    ) -> Option<Conflict> {
        candidates.into_iter().find_map(|key| {
            self.by_key
                .get(key)
                .filter(|owner| owner.registration != registration)
                .map(|owner| Conflict {
                    key: key.clone(),
                    owner: owner.registration.clone(),
                })
        })
    }

    /// Grant `candidates` to `registration`, replacing whatever it held before.
    ///
    /// All-or-nothing: on conflict nothing changes. On success returns the
    /// keys the registration held before but no longer claims.
    pub fn claim(
        &mut self,
        registration: &str,
        cluster_scoped: bool,
        candidates: BTreeSet<ValueKey>,
    ) -> Result<Vec<ValueKey>, Conflict> {
        if let Some(conflict) = self.find_conflict(registration, &candidates) {
            return Err(conflict);
        }

        let owner = Owner {
            registration: registration.to_string(),
            cluster_scoped,
        };
        let previous = self.by_owner.remove(registration).unwrap_or_default();
        let released: Vec<ValueKey> = previous.difference(&candidates).cloned().collect();
        for key in &released {
            self.by_key.remove(key);
        }

        let mut changed = !released.is_empty();
        for key in &candidates {
            if self.by_key.get(key) != Some(&owner) {
                self.by_key.insert(key.clone(), owner.clone());
                changed = true;
            }
        }
        if !candidates.is_empty() {
            self.by_owner.insert(registration.to_string(), candidates);
        }

        if changed {
            self.revision += 1;
        }
        Ok(released)
    }

    /// Drop every key owned by `registration`, returning them
    pub fn release(&mut self, registration: &str) -> Vec<ValueKey> {
        let Some(keys) = self.by_owner.remove(registration) else {
            return Vec::new();
        };
        for key in &keys {
            self.by_key.remove(key);
        }
        self.revision += 1;
        keys.into_iter().collect()
    }
}

/// Shared handle to the index.
///
/// The reconciler is the only writer (one worker per group, and all keys are
/// group-scoped, so workers never touch each other's keys). Readers take a
/// point-in-time copy instead of holding the lock.
#[derive(Debug, Clone, Default)]
pub struct ValueSpace {
    inner: Arc<RwLock<ValueSpaceIndex>>,
}

impl ValueSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of the whole index
    pub fn snapshot(&self) -> ValueSpaceIndex {
        self.inner.read().clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision()
    }

    pub fn is_owner(&self, registration: &str) -> bool {
        self.inner.read().is_owner(registration)
    }

    pub fn find_conflict(
        &self,
        registration: &str,
        candidates: &BTreeSet<ValueKey>,
    ) -> Option<Conflict> {
        self.inner.read().find_conflict(registration, candidates)
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ValueSpaceIndex) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Reserve identifiers for a built-in type so dynamic registrations cannot shadow it.
    pub fn reserve(&self, owner: &str, spec: &RegistrationSpec) -> Result<(), Conflict> {
        self.update(|index| {
            index
                .claim(owner, spec.cluster_scoped, ValueKey::for_spec(spec))
                .map(|_| ())
        })
    }
}
