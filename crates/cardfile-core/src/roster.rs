//! Authoritative in-memory contact and group set.
//!
//! Single logical writer: callers serialize through these methods, and
//! every successful mutation sets the dirty flag and refreshes the
//! last-modified stamp. Readers only ever see defensive copies. The clock
//! is always passed in, never read from a global.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Contact, ContactDraft, ContactId, ContactPatch, Group, GroupId};

/// Optional narrowing applied by `get_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterFilter {
    /// Keep only contacts whose favorite flag matches.
    #[serde(default)]
    pub favorite: Option<bool>,
    /// Keep only contacts whose blocked flag matches.
    #[serde(default)]
    pub blocked: Option<bool>,
    /// Keep only members of this group.
    #[serde(default)]
    pub group: Option<GroupId>,
    /// Case-insensitive substring over name, email, and phone.
    #[serde(default)]
    pub query: Option<String>,
}

impl RosterFilter {
    fn matches(&self, contact: &Contact) -> bool {
        if let Some(fav) = self.favorite {
            if contact.favorite != fav {
                return false;
            }
        }
        if let Some(blocked) = self.blocked {
            if contact.blocked != blocked {
                return false;
            }
        }
        if let Some(group) = self.group {
            if !contact.groups.contains(&group) {
                return false;
            }
        }
        if let Some(query) = &self.query {
            let needle = query.to_lowercase();
            let hit = contact.name.to_lowercase().contains(&needle)
                || contact
                    .email
                    .as_deref()
                    .is_some_and(|e| e.to_lowercase().contains(&needle))
                || contact.phone.as_deref().is_some_and(|p| p.contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// The authoritative dataset.
#[derive(Debug, Default)]
pub struct Roster {
    contacts: BTreeMap<ContactId, Contact>,
    groups: BTreeMap<GroupId, Group>,
    dirty: bool,
    last_modified_ms: i64,
}

impl Roster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Contact operations ──────────────────────────────────────────────

    /// Validate and insert a new contact, returning the stored record.
    pub fn add(&mut self, draft: ContactDraft, now_ms: i64) -> Result<Contact> {
        let contact = Contact::create(draft, now_ms)?;
        self.contacts.insert(contact.id, contact.clone());
        self.touch(now_ms);
        Ok(contact)
    }

    /// Replace the record with `id` by a patched copy.
    pub fn update(&mut self, id: ContactId, patch: &ContactPatch, now_ms: i64) -> Result<Contact> {
        if let Some(groups) = &patch.groups {
            for gid in groups {
                if !self.groups.contains_key(gid) {
                    return Err(Error::NotFound {
                        id: gid.to_string(),
                    });
                }
            }
        }
        let current = self.contacts.get(&id).ok_or_else(|| Error::NotFound {
            id: id.to_string(),
        })?;
        let replacement = current.apply_patch(patch, now_ms)?;
        self.contacts.insert(id, replacement.clone());
        self.touch(now_ms);
        Ok(replacement)
    }

    /// Remove a contact. Derived group membership shrinks with it; the
    /// groups themselves stay.
    pub fn delete(&mut self, id: ContactId, now_ms: i64) -> Result<()> {
        if self.contacts.remove(&id).is_none() {
            return Err(Error::NotFound {
                id: id.to_string(),
            });
        }
        self.touch(now_ms);
        Ok(())
    }

    /// Flip the favorite flag. Sugar over `update`.
    pub fn toggle_favorite(&mut self, id: ContactId, now_ms: i64) -> Result<Contact> {
        let current = self.require(id)?;
        let patch = ContactPatch {
            favorite: Some(!current.favorite),
            ..ContactPatch::default()
        };
        self.update(id, &patch, now_ms)
    }

    /// Flip the blocked flag. Sugar over `update`.
    pub fn toggle_block(&mut self, id: ContactId, now_ms: i64) -> Result<Contact> {
        let current = self.require(id)?;
        let patch = ContactPatch {
            blocked: Some(!current.blocked),
            ..ContactPatch::default()
        };
        self.update(id, &patch, now_ms)
    }

    /// Defensive copy of the matching contacts, sorted by name
    /// case-insensitively (id as a deterministic tie break).
    #[must_use]
    pub fn get_all(&self, filter: Option<&RosterFilter>) -> Vec<Contact> {
        let mut out: Vec<Contact> = self
            .contacts
            .values()
            .filter(|c| filter.is_none_or(|f| f.matches(c)))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    #[must_use]
    pub fn get(&self, id: ContactId) -> Option<Contact> {
        self.contacts.get(&id).cloned()
    }

    // ── Group operations ────────────────────────────────────────────────

    pub fn add_group(&mut self, label: &str, now_ms: i64) -> Result<Group> {
        let group = Group::create(label)?;
        self.groups.insert(group.id, group.clone());
        self.touch(now_ms);
        Ok(group)
    }

    /// Drop a group and strip its id from every contact that carried it.
    pub fn remove_group(&mut self, id: GroupId, now_ms: i64) -> Result<()> {
        if self.groups.remove(&id).is_none() {
            return Err(Error::NotFound {
                id: id.to_string(),
            });
        }
        for contact in self.contacts.values_mut() {
            if contact.groups.remove(&id) {
                contact.updated_at_ms = now_ms.max(contact.created_at_ms);
            }
        }
        self.touch(now_ms);
        Ok(())
    }

    /// Add a contact to a group. Sugar over `update`.
    pub fn assign_group(
        &mut self,
        contact: ContactId,
        group: GroupId,
        now_ms: i64,
    ) -> Result<Contact> {
        if !self.groups.contains_key(&group) {
            return Err(Error::NotFound {
                id: group.to_string(),
            });
        }
        let mut groups = self.require(contact)?.groups.clone();
        groups.insert(group);
        let patch = ContactPatch {
            groups: Some(groups),
            ..ContactPatch::default()
        };
        self.update(contact, &patch, now_ms)
    }

    /// Remove a contact from a group. Sugar over `update`.
    pub fn unassign_group(
        &mut self,
        contact: ContactId,
        group: GroupId,
        now_ms: i64,
    ) -> Result<Contact> {
        let mut groups = self.require(contact)?.groups.clone();
        groups.remove(&group);
        let patch = ContactPatch {
            groups: Some(groups),
            ..ContactPatch::default()
        };
        self.update(contact, &patch, now_ms)
    }

    /// All groups, sorted by label.
    #[must_use]
    pub fn groups(&self) -> Vec<Group> {
        let mut out: Vec<Group> = self.groups.values().cloned().collect();
        out.sort_by(|a, b| {
            a.label
                .to_lowercase()
                .cmp(&b.label.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Membership derived by scanning contact records; the group stores
    /// no member list of its own.
    #[must_use]
    pub fn group_members(&self, id: GroupId) -> Vec<Contact> {
        self.get_all(Some(&RosterFilter {
            group: Some(id),
            ..RosterFilter::default()
        }))
    }

    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<Group> {
        self.groups.get(&id).cloned()
    }

    // ── Dataset-level access ────────────────────────────────────────────

    /// Unsorted copies of the full dataset, for snapshot capture.
    #[must_use]
    pub fn dataset(&self) -> (Vec<Contact>, Vec<Group>) {
        (
            self.contacts.values().cloned().collect(),
            self.groups.values().cloned().collect(),
        )
    }

    /// Swap in a recovered or imported dataset wholesale.
    ///
    /// Contacts referencing unknown groups keep working; membership views
    /// simply skip ids with no matching group.
    pub fn replace_all(&mut self, contacts: Vec<Contact>, groups: Vec<Group>, now_ms: i64) {
        self.contacts = contacts.into_iter().map(|c| (c.id, c)).collect();
        self.groups = groups.into_iter().map(|g| (g.id, g)).collect();
        self.touch(now_ms);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms
    }

    /// Clear the dirty flag after a successful persist.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Re-arm the dirty flag, e.g. after a persist attempt failed.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn require(&self, id: ContactId) -> Result<&Contact> {
        self.contacts.get(&id).ok_or_else(|| Error::NotFound {
            id: id.to_string(),
        })
    }

    fn touch(&mut self, now_ms: i64) {
        self.dirty = true;
        self.last_modified_ms = self.last_modified_ms.max(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn draft(name: &str) -> ContactDraft {
        ContactDraft::new(name)
    }

    // ── CRUD ────────────────────────────────────────────────────────────

    #[test]
    fn add_then_get_all_contains_equal_record() {
        let mut roster = Roster::new();
        let input = draft("Grace Hopper").with_email("grace@navy.mil");
        let added = roster.add(input.clone(), NOW).unwrap();

        let all = roster.get_all(None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, input.name);
        assert_eq!(all[0].email, input.email);
        assert_eq!(all[0].id, added.id);
    }

    #[test]
    fn get_all_sorted_case_insensitively() {
        let mut roster = Roster::new();
        roster.add(draft("charlie"), NOW).unwrap();
        roster.add(draft("Alice"), NOW).unwrap();
        roster.add(draft("bob"), NOW).unwrap();

        let names: Vec<String> = roster.get_all(None).into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Alice", "bob", "charlie"]);
    }

    #[test]
    fn get_all_returns_defensive_copies() {
        let mut roster = Roster::new();
        roster.add(draft("a"), NOW).unwrap();
        let mut copy = roster.get_all(None);
        copy[0].name = "mutated".to_string();
        assert_eq!(roster.get_all(None)[0].name, "a");
    }

    #[test]
    fn update_missing_id_is_not_found() {
        let mut roster = Roster::new();
        let err = roster
            .update(ContactId::generate(), &ContactPatch::rename("x"), NOW)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn delete_missing_id_is_not_found() {
        let mut roster = Roster::new();
        assert!(matches!(
            roster.delete(ContactId::generate(), NOW),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn toggles_flip_flags_and_refresh_updated_at() {
        let mut roster = Roster::new();
        let id = roster.add(draft("a"), NOW).unwrap().id;

        let fav = roster.toggle_favorite(id, NOW + 10).unwrap();
        assert!(fav.favorite);
        assert_eq!(fav.updated_at_ms, NOW + 10);

        let unfav = roster.toggle_favorite(id, NOW + 20).unwrap();
        assert!(!unfav.favorite);

        let blocked = roster.toggle_block(id, NOW + 30).unwrap();
        assert!(blocked.blocked);
    }

    // ── Dirty tracking ──────────────────────────────────────────────────

    #[test]
    fn mutations_set_dirty_and_refresh_last_modified() {
        let mut roster = Roster::new();
        assert!(!roster.is_dirty());

        roster.add(draft("a"), NOW).unwrap();
        assert!(roster.is_dirty());
        assert_eq!(roster.last_modified_ms(), NOW);

        roster.clear_dirty();
        assert!(!roster.is_dirty());

        let id = roster.get_all(None)[0].id;
        roster.toggle_favorite(id, NOW + 5).unwrap();
        assert!(roster.is_dirty());
        assert_eq!(roster.last_modified_ms(), NOW + 5);
    }

    #[test]
    fn failed_validation_leaves_store_clean() {
        let mut roster = Roster::new();
        roster.add(draft("a"), NOW).unwrap();
        roster.clear_dirty();

        let id = roster.get_all(None)[0].id;
        let bad = ContactPatch {
            email: Some("nope".to_string()),
            ..ContactPatch::default()
        };
        assert!(roster.update(id, &bad, NOW + 1).is_err());
        assert!(!roster.is_dirty());
    }

    // ── Groups ──────────────────────────────────────────────────────────

    #[test]
    fn deleting_contact_shrinks_derived_membership_but_keeps_group() {
        let mut roster = Roster::new();
        let group = roster.add_group("Friends", NOW).unwrap();
        let a = roster.add(draft("a"), NOW).unwrap().id;
        let b = roster.add(draft("b"), NOW).unwrap().id;
        roster.assign_group(a, group.id, NOW).unwrap();
        roster.assign_group(b, group.id, NOW).unwrap();
        assert_eq!(roster.group_members(group.id).len(), 2);

        roster.delete(a, NOW + 1).unwrap();

        let members = roster.group_members(group.id);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, b);
        assert!(roster.group(group.id).is_some());
    }

    #[test]
    fn removing_group_strips_membership_references() {
        let mut roster = Roster::new();
        let group = roster.add_group("g", NOW).unwrap();
        let id = roster.add(draft("a"), NOW).unwrap().id;
        roster.assign_group(id, group.id, NOW).unwrap();

        roster.remove_group(group.id, NOW + 1).unwrap();
        assert!(roster.group(group.id).is_none());
        assert!(roster.get(id).unwrap().groups.is_empty());
    }

    #[test]
    fn assigning_unknown_group_rejected() {
        let mut roster = Roster::new();
        let id = roster.add(draft("a"), NOW).unwrap().id;
        let err = roster.assign_group(id, GroupId::generate(), NOW).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    // ── Filters ─────────────────────────────────────────────────────────

    #[test]
    fn filter_by_flags_group_and_query() {
        let mut roster = Roster::new();
        let group = roster.add_group("work", NOW).unwrap();
        let a = roster
            .add(draft("Ada").with_email("ada@exa.co"), NOW)
            .unwrap()
            .id;
        roster.add(draft("Bob"), NOW).unwrap();
        roster.toggle_favorite(a, NOW).unwrap();
        roster.assign_group(a, group.id, NOW).unwrap();

        let favs = roster.get_all(Some(&RosterFilter {
            favorite: Some(true),
            ..RosterFilter::default()
        }));
        assert_eq!(favs.len(), 1);
        assert_eq!(favs[0].id, a);

        let by_query = roster.get_all(Some(&RosterFilter {
            query: Some("ADA".to_string()),
            ..RosterFilter::default()
        }));
        assert_eq!(by_query.len(), 1);

        let by_group = roster.get_all(Some(&RosterFilter {
            group: Some(group.id),
            ..RosterFilter::default()
        }));
        assert_eq!(by_group.len(), 1);
    }

    // ── Dataset swap ────────────────────────────────────────────────────

    #[test]
    fn replace_all_swaps_dataset_and_dirties() {
        let mut roster = Roster::new();
        roster.add(draft("old"), NOW).unwrap();
        roster.clear_dirty();

        let incoming = Contact::create(draft("new"), NOW).unwrap();
        roster.replace_all(vec![incoming.clone()], Vec::new(), NOW + 1);

        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get(incoming.id).unwrap().name, "new");
        assert!(roster.is_dirty());
    }
}
