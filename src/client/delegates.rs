//! The client's delegate registry.
//!
//! Maps handler keys to the local callbacks the server may invoke.
//! Registering the same callback twice (by [Arc] identity) yields the
//! same key. Entries go away on explicit unregister, in bulk when their
//! owner is shut down, or all at once on disconnect.

use chashmap::CHashMap;
use std::sync::Arc;

use crate::guid::Guid;

/// A client-resident callback invocable by the server.
pub type Delegate = Arc<dyn Fn(Vec<serde_json::Value>) + Send + Sync>;

struct DelegateEntry {
    callback: Delegate,
    identity: usize,
    owner: Option<Guid>,
}

pub(crate) struct DelegateRegistry {
    entries: CHashMap<Guid, DelegateEntry>,
    by_identity: CHashMap<usize, Guid>,
    by_owner: CHashMap<Guid, Vec<Guid>>,
}

fn identity_of(callback: &Delegate) -> usize {
    Arc::as_ptr(callback) as *const () as usize
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self {
            entries: CHashMap::new(),
            by_identity: CHashMap::new(),
            by_owner: CHashMap::new(),
        }
    }

    /// Register `callback` under a fresh key, or return the key it
    /// already has.
    pub fn register(&self, callback: &Delegate, owner: Option<Guid>) -> Guid {
        let identity = identity_of(callback);
        let mut resolved = None;
        self.by_identity.alter(identity, |existing| match existing {
            Some(key) => {
                resolved = Some((key, true));
                Some(key)
            }
            None => {
                let key = Guid::random();
                resolved = Some((key, false));
                Some(key)
            }
        });
        let (key, existed) = resolved.expect("alter always resolves");
        if !existed {
            self.entries.insert(
                key,
                DelegateEntry {
                    callback: Arc::clone(callback),
                    identity,
                    owner,
                },
            );
            if let Some(owner) = owner {
                self.by_owner.alter(owner, |keys| {
                    let mut keys = keys.unwrap_or_default();
                    keys.push(key);
                    Some(keys)
                });
            }
        }
        key
    }

    pub fn get(&self, key: Guid) -> Option<Delegate> {
        self.entries.get(&key).map(|entry| Arc::clone(&entry.callback))
    }

    /// `false` when the key was not registered.
    pub fn remove(&self, key: Guid) -> bool {
        match self.entries.remove(&key) {
            Some(entry) => {
                self.by_identity.remove(&entry.identity);
                if let Some(owner) = entry.owner {
                    self.by_owner.alter(owner, |keys| {
                        let mut keys = keys?;
                        keys.retain(|registered| *registered != key);
                        if keys.is_empty() {
                            None
                        } else {
                            Some(keys)
                        }
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Drop every callback registered under `owner`.
    pub fn remove_owner(&self, owner: Guid) {
        if let Some(keys) = self.by_owner.remove(&owner) {
            for key in keys {
                if let Some(entry) = self.entries.remove(&key) {
                    self.by_identity.remove(&entry.identity);
                }
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.by_identity.clear();
        self.by_owner.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_delegate() -> Delegate {
        Arc::new(|_args| {})
    }

    #[test]
    fn same_callback_reuses_the_key() {
        let registry = DelegateRegistry::new();
        let callback = noop_delegate();

        let first = registry.register(&callback, None);
        let second = registry.register(&callback, None);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);

        let other = registry.register(&noop_delegate(), None);
        assert_ne!(first, other);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registered_callback_is_invocable() {
        let registry = DelegateRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let callback: Delegate = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_args| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        let key = registry.register(&callback, None);
        registry.get(key).unwrap()(vec![]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_forgets_the_identity() {
        let registry = DelegateRegistry::new();
        let callback = noop_delegate();
        let key = registry.register(&callback, None);

        assert!(registry.remove(key));
        assert!(!registry.remove(key));
        assert!(registry.get(key).is_none());

        // Re-registering after removal issues a fresh key.
        let rekey = registry.register(&callback, None);
        assert_ne!(key, rekey);
    }

    #[test]
    fn owner_removal_is_bulk() {
        let registry = DelegateRegistry::new();
        let owner = Guid::random();
        registry.register(&noop_delegate(), Some(owner));
        registry.register(&noop_delegate(), Some(owner));
        let unowned = registry.register(&noop_delegate(), None);

        registry.remove_owner(owner);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(unowned).is_some());
    }

    #[test]
    fn clear_empties_everything() {
        let registry = DelegateRegistry::new();
        let callback = noop_delegate();
        registry.register(&callback, Some(Guid::random()));
        registry.clear();
        assert_eq!(registry.len(), 0);
    }
}
