//! Notification identity bookkeeping shared by the poll cycle, action jobs
//! and the foreground dismissal callbacks.
//!
//! Every account owns three stable ids (group summary, status update and
//! error) for its whole lifetime, plus one id per unread message
//! notification. Message ids come from a single bounded window shared by all
//! accounts; the allocation cursor only moves forward and wraps, skipping any
//! id that is still live, so two live notifications never share an id.
//!
//! All state sits behind one mutex. Critical sections are pure map/set work;
//! callers post notifications and log only after the guard is released.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::RegistryError;
use crate::model::{NotificationId, NotificationIdentitySet, UnreadState};

/// First id handed out for per-account stable identities.
pub const IDENTITY_ID_BASE: NotificationId = 1;
/// Message ids live in `[MESSAGE_ID_BASE, MESSAGE_ID_BASE + MESSAGE_ID_WINDOW)`.
pub const MESSAGE_ID_BASE: NotificationId = 1_000;
pub const MESSAGE_ID_WINDOW: NotificationId = 4_096;

/// What the caller must do with the group summary after freeing a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The id was not live for that account; nothing changed.
    NotLive,
    GroupUpdated {
        group: NotificationId,
        unread: usize,
    },
    GroupRetired {
        group: NotificationId,
    },
}

/// Everything the caller has to cancel once an account is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedAccount {
    pub identities: NotificationIdentitySet,
    pub message_ids: Vec<NotificationId>,
}

#[derive(Debug)]
struct AccountSlot {
    identities: NotificationIdentitySet,
    unread: BTreeSet<NotificationId>,
}

#[derive(Debug)]
struct RegistryInner {
    accounts: HashMap<String, AccountSlot>,
    next_identity: NotificationId,
    recycled: Vec<NotificationIdentitySet>,
    window: NotificationId,
    cursor: NotificationId,
    live: HashMap<NotificationId, String>,
}

impl RegistryInner {
    fn slot(&mut self, account: &str) -> Result<&mut AccountSlot, RegistryError> {
        if !self.accounts.contains_key(account) {
            let identities = match self.recycled.pop() {
                Some(identities) => identities,
                None => {
                    let first = self.next_identity;
                    if first + 3 > MESSAGE_ID_BASE {
                        return Err(RegistryError::Exhausted("account"));
                    }
                    self.next_identity += 3;
                    NotificationIdentitySet {
                        group: first,
                        status_update: first + 1,
                        error: first + 2,
                    }
                }
            };
            self.accounts.insert(
                account.to_string(),
                AccountSlot {
                    identities,
                    unread: BTreeSet::new(),
                },
            );
        }
        self.accounts
            .get_mut(account)
            .ok_or(RegistryError::Exhausted("account"))
    }

    fn next_free_message_id(&mut self) -> Option<NotificationId> {
        for _ in 0..self.window {
            let candidate = MESSAGE_ID_BASE + self.cursor;
            self.cursor = (self.cursor + 1) % self.window;
            if !self.live.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct NotificationRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::with_window(MESSAGE_ID_WINDOW)
    }

    /// Registry whose message ids come from a window of `window` ids.
    pub fn with_window(window: NotificationId) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                accounts: HashMap::new(),
                next_identity: IDENTITY_ID_BASE,
                recycled: Vec::new(),
                window: window.clamp(1, MESSAGE_ID_WINDOW),
                cursor: 0,
                live: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // Guarded state is plain data; a panicking holder cannot leave it torn.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get-or-create the stable ids of `account`. Repeated calls return the
    /// same triple until the account is removed.
    pub fn identities_for(&self, account: &str) -> Result<NotificationIdentitySet, RegistryError> {
        let mut inner = self.lock();
        inner.slot(account).map(|slot| slot.identities)
    }

    pub fn allocate_message_id(&self, account: &str) -> Result<NotificationId, RegistryError> {
        let allocated = {
            let mut inner = self.lock();
            inner.slot(account)?;
            let id = inner
                .next_free_message_id()
                .ok_or(RegistryError::Exhausted("message"))?;
            inner.live.insert(id, account.to_string());
            if let Some(slot) = inner.accounts.get_mut(account) {
                slot.unread.insert(id);
            }
            id
        };
        debug!(account, id = allocated, "allocated message notification id");
        Ok(allocated)
    }

    /// Release a message id. Freeing an id that is not live for `account`
    /// (already freed, or never allocated) is a no-op.
    pub fn free_message_id(&self, account: &str, id: NotificationId) -> FreeOutcome {
        let outcome = {
            let mut inner = self.lock();
            let Some(slot) = inner.accounts.get_mut(account) else {
                return FreeOutcome::NotLive;
            };
            if !slot.unread.remove(&id) {
                return FreeOutcome::NotLive;
            }
            let group = slot.identities.group;
            let unread = slot.unread.len();
            inner.live.remove(&id);
            if unread == 0 {
                FreeOutcome::GroupRetired { group }
            } else {
                FreeOutcome::GroupUpdated { group, unread }
            }
        };
        debug!(account, id, ?outcome, "freed message notification id");
        outcome
    }

    pub fn unread_snapshot(&self, account: &str) -> UnreadState {
        let inner = self.lock();
        inner
            .accounts
            .get(account)
            .map(|slot| UnreadState {
                message_ids: slot.unread.clone(),
            })
            .unwrap_or_default()
    }

    /// Forget `account`: its live message ids are released and its stable
    /// triple becomes available to the next new account.
    pub fn remove_account(&self, account: &str) -> Option<RemovedAccount> {
        let mut inner = self.lock();
        let slot = inner.accounts.remove(account)?;
        for id in &slot.unread {
            inner.live.remove(id);
        }
        inner.recycled.push(slot.identities);
        Some(RemovedAccount {
            identities: slot.identities,
            message_ids: slot.unread.into_iter().collect(),
        })
    }

    pub fn accounts(&self) -> Vec<String> {
        let inner = self.lock();
        let mut accounts: Vec<String> = inner.accounts.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    pub fn live_message_ids(&self) -> Vec<(NotificationId, String)> {
        let inner = self.lock();
        let mut live: Vec<(NotificationId, String)> = inner
            .live
            .iter()
            .map(|(id, account)| (*id, account.clone()))
            .collect();
        live.sort();
        live
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::{FreeOutcome, MESSAGE_ID_BASE, NotificationRegistry};
    use crate::error::RegistryError;

    #[test]
    fn identities_are_stable_and_distinct_per_account() -> anyhow::Result<()> {
        let registry = NotificationRegistry::new();
        let alice = registry.identities_for("alice@example.com")?;
        assert_eq!(registry.identities_for("alice@example.com")?, alice);

        let bob = registry.identities_for("bob@example.com")?;
        let ids: HashSet<i32> = [
            alice.group,
            alice.status_update,
            alice.error,
            bob.group,
            bob.status_update,
            bob.error,
        ]
        .into_iter()
        .collect();
        assert_eq!(ids.len(), 6);
        assert!(ids.iter().all(|id| *id < MESSAGE_ID_BASE));
        Ok(())
    }

    #[test]
    fn group_follows_unread_set() -> anyhow::Result<()> {
        let registry = NotificationRegistry::new();
        let account = "alice@example.com";
        let group = registry.identities_for(account)?.group;
        let ids = [
            registry.allocate_message_id(account)?,
            registry.allocate_message_id(account)?,
            registry.allocate_message_id(account)?,
        ];
        assert_eq!(registry.unread_snapshot(account).count(), 3);
        assert!(registry.unread_snapshot(account).group_visible());

        assert_eq!(
            registry.free_message_id(account, ids[0]),
            FreeOutcome::GroupUpdated { group, unread: 2 }
        );
        assert_eq!(
            registry.free_message_id(account, ids[1]),
            FreeOutcome::GroupUpdated { group, unread: 1 }
        );
        assert_eq!(
            registry.free_message_id(account, ids[2]),
            FreeOutcome::GroupRetired { group }
        );
        assert!(!registry.unread_snapshot(account).group_visible());
        Ok(())
    }

    #[test]
    fn freeing_twice_or_for_another_account_is_a_no_op() -> anyhow::Result<()> {
        let registry = NotificationRegistry::new();
        let id = registry.allocate_message_id("alice@example.com")?;
        registry.allocate_message_id("alice@example.com")?;

        assert_eq!(
            registry.free_message_id("bob@example.com", id),
            FreeOutcome::NotLive
        );
        assert!(matches!(
            registry.free_message_id("alice@example.com", id),
            FreeOutcome::GroupUpdated { unread: 1, .. }
        ));
        assert_eq!(
            registry.free_message_id("alice@example.com", id),
            FreeOutcome::NotLive
        );
        assert_eq!(registry.unread_snapshot("alice@example.com").count(), 1);
        Ok(())
    }

    #[test]
    fn allocation_wraps_and_skips_live_ids() -> anyhow::Result<()> {
        let registry = NotificationRegistry::with_window(4);
        let a0 = registry.allocate_message_id("a@example.com")?;
        let b1 = registry.allocate_message_id("b@example.com")?;
        let a2 = registry.allocate_message_id("a@example.com")?;
        let b3 = registry.allocate_message_id("b@example.com")?;
        assert_eq!(
            vec![a0, b1, a2, b3],
            (MESSAGE_ID_BASE..MESSAGE_ID_BASE + 4).collect::<Vec<_>>()
        );

        assert_eq!(
            registry.allocate_message_id("a@example.com"),
            Err(RegistryError::Exhausted("message"))
        );

        registry.free_message_id("b@example.com", b1);
        assert_eq!(registry.allocate_message_id("a@example.com")?, b1);
        let owners: Vec<String> = registry
            .live_message_ids()
            .into_iter()
            .filter(|(id, _)| *id == b1)
            .map(|(_, owner)| owner)
            .collect();
        assert_eq!(owners, vec!["a@example.com".to_string()]);
        Ok(())
    }

    #[test]
    fn removed_account_releases_ids_and_recycles_triple() -> anyhow::Result<()> {
        let registry = NotificationRegistry::new();
        let alice = registry.identities_for("alice@example.com")?;
        let id = registry.allocate_message_id("alice@example.com")?;

        let removed = registry
            .remove_account("alice@example.com")
            .ok_or_else(|| anyhow::anyhow!("alice should be registered"))?;
        assert_eq!(removed.identities, alice);
        assert_eq!(removed.message_ids, vec![id]);
        assert!(registry.live_message_ids().is_empty());
        assert!(registry.remove_account("alice@example.com").is_none());

        assert_eq!(registry.identities_for("carol@example.com")?, alice);
        Ok(())
    }

    #[test]
    fn concurrent_allocation_never_shares_live_ids() {
        let registry = Arc::new(NotificationRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let account = format!("user{}@example.com", n);
                    let mut mine = Vec::new();
                    for round in 0..200 {
                        let id = registry.allocate_message_id(&account).unwrap();
                        mine.push(id);
                        if round % 3 == 0 {
                            let freed = mine.remove(0);
                            registry.free_message_id(&account, freed);
                        }
                    }
                    (account, mine)
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let (account, mine) = handle.join().unwrap();
            let snapshot = registry.unread_snapshot(&account);
            assert_eq!(snapshot.count(), mine.len());
            for id in mine {
                assert!(snapshot.message_ids.contains(&id));
                assert!(seen.insert(id), "id {} live for two accounts", id);
            }
        }
        assert_eq!(registry.live_message_ids().len(), seen.len());
    }
}
