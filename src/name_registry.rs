//! Well-known name registry (§3 "Well-known name", §4.4, component C4).
//!
//! Adapted from this codebase's own `NameRegistry` (originally
//! `HashMap<OwnedWellKnownName, NameEntry>` behind a `parking_lot::RwLock`,
//! tracking one owner plus a FIFO waiting list per name, built on
//! `zbus::fdo::{RequestNameReply,ReleaseNameReply}`): this version drops the
//! `zbus::fdo` reply types (our wire protocol isn't D-Bus's) in favor of
//! plain local enums, keys entries by raw connection id instead of a
//! D-Bus unique name, and adds wildcard lookup, `list`, and synthetic
//! queue-promotion notifications on disconnect.

use std::collections::{HashMap, VecDeque};

use enumflags2::{bitflags, BitFlags};
use parking_lot::RwLock;

use crate::error::{BusError, Result};

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NameFlags {
    AllowReplacement,
    ReplaceExisting,
    Queue,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

/// A synthetic event the registry emits as a side effect of a name
/// transferring ownership -- the router turns these into kernel-sourced
/// messages (§9 resolved open question: synthetic messages carry no sender
/// credentials, since their source id is 0).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NameEvent {
    OwnerChanged {
        name: String,
        old: Option<u64>,
        new: Option<u64>,
    },
}

struct QueuedOwner {
    conn_id: u64,
    allow_replacement: bool,
}

struct Entry {
    owner: Option<u64>,
    allow_replacement: bool,
    queue: VecDeque<QueuedOwner>,
}

#[derive(Default)]
pub struct NameRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_name(
        &self,
        name: &str,
        conn_id: u64,
        flags: BitFlags<NameFlags>,
    ) -> (RequestNameReply, Vec<NameEvent>) {
        let mut entries = self.entries.write();

        let Some(entry) = entries.get_mut(name) else {
            entries.insert(
                name.to_string(),
                Entry {
                    owner: Some(conn_id),
                    allow_replacement: flags.contains(NameFlags::AllowReplacement),
                    queue: VecDeque::new(),
                },
            );
            return (
                RequestNameReply::PrimaryOwner,
                vec![NameEvent::OwnerChanged {
                    name: name.to_string(),
                    old: None,
                    new: Some(conn_id),
                }],
            );
        };

        if entry.owner == Some(conn_id) {
            return (RequestNameReply::AlreadyOwner, vec![]);
        }

        let can_replace = entry.allow_replacement && flags.contains(NameFlags::ReplaceExisting);
        if can_replace {
            let old = entry.owner;
            if let Some(old_id) = old {
                // The displaced owner goes to the back of the queue so it's
                // first in line if the new owner later releases it.
                entry.queue.push_back(QueuedOwner {
                    conn_id: old_id,
                    allow_replacement: false,
                });
            }
            entry.owner = Some(conn_id);
            entry.allow_replacement = flags.contains(NameFlags::AllowReplacement);
            return (
                RequestNameReply::PrimaryOwner,
                vec![NameEvent::OwnerChanged {
                    name: name.to_string(),
                    old,
                    new: Some(conn_id),
                }],
            );
        }

        if flags.contains(NameFlags::Queue) {
            entry.queue.push_back(QueuedOwner {
                conn_id,
                allow_replacement: flags.contains(NameFlags::AllowReplacement),
            });
            return (RequestNameReply::InQueue, vec![]);
        }

        (RequestNameReply::Exists, vec![])
    }

    pub fn release_name(&self, name: &str, conn_id: u64) -> (ReleaseNameReply, Vec<NameEvent>) {
        let mut entries = self.entries.write();

        let Some(entry) = entries.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, vec![]);
        };

        if entry.owner != Some(conn_id) {
            let before = entry.queue.len();
            entry.queue.retain(|q| q.conn_id != conn_id);
            return (
                if entry.queue.len() != before {
                    ReleaseNameReply::Released
                } else {
                    ReleaseNameReply::NotOwner
                },
                vec![],
            );
        }

        let events = promote(entry, name);
        if entry.owner.is_none() {
            entries.remove(name);
        }
        (ReleaseNameReply::Released, events)
    }

    /// Drops every name this connection owns or is queued for, as part of
    /// disconnect cleanup. Returns the synthetic events the router should
    /// turn into kernel-sourced messages.
    pub fn remove_connection(&self, conn_id: u64) -> Vec<NameEvent> {
        let mut entries = self.entries.write();
        let mut events = Vec::new();
        let mut to_remove = Vec::new();

        for (name, entry) in entries.iter_mut() {
            entry.queue.retain(|q| q.conn_id != conn_id);
            if entry.owner == Some(conn_id) {
                events.extend(promote(entry, name));
                if entry.owner.is_none() {
                    to_remove.push(name.clone());
                }
            }
        }

        for name in to_remove {
            entries.remove(&name);
        }

        events
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.entries.read().get(name).and_then(|e| e.owner)
    }

    pub fn list_queued_owners(&self, name: &str) -> Vec<u64> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.queue.iter().map(|q| q.conn_id).collect())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Resolves `prefix` (the non-`.*` part of `a.b.*`) to every currently
    /// owned name it matches, by stripping the trailing `.*` and checking
    /// prefixes -- the same rule [`crate::policy::Object::Wildcard`] uses.
    pub fn list_matching_wildcard(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .keys()
            .filter(|name| *name == prefix || name.starts_with(&format!("{prefix}.")))
            .cloned()
            .collect()
    }

    pub fn check_name_valid(name: &str) -> Result<()> {
        let valid = name.contains('.')
            && !name.starts_with('.')
            && !name.ends_with('.')
            && name.split('.').all(|label| {
                !label.is_empty()
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            })
            && name
                .chars()
                .next()
                .map(|c| !c.is_ascii_digit())
                .unwrap_or(false);
        if valid {
            Ok(())
        } else {
            Err(BusError::InvalidName(name.to_string()))
        }
    }
}

fn promote(entry: &mut Entry, name: &str) -> Vec<NameEvent> {
    let old = entry.owner;
    match entry.queue.pop_front() {
        Some(next) => {
            entry.owner = Some(next.conn_id);
            entry.allow_replacement = next.allow_replacement;
            vec![NameEvent::OwnerChanged {
                name: name.to_string(),
                old,
                new: Some(next.conn_id),
            }]
        }
        None => {
            entry.owner = None;
            vec![NameEvent::OwnerChanged {
                name: name.to_string(),
                old,
                new: None,
            }]
        }
    }
}
