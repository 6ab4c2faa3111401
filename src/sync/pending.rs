//! Identities that a cache refresh must not clobber.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{Action, Document, OutboxEntry};

/// Snapshot of the unconfirmed work for one collection.
#[derive(Debug, Default)]
pub struct PendingSet {
    local_ids: HashSet<i64>,
    server_ids: HashSet<String>,
    deleted: HashSet<String>,
    correlations: HashMap<Uuid, i64>,
    fingerprints: HashSet<String>,
}

impl PendingSet {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a OutboxEntry>) -> Self {
        let mut set = Self::default();

        for entry in entries {
            match entry.action {
                Action::Delete => {
                    if let Some(server_id) = entry.target_server_id() {
                        set.deleted.insert(server_id.to_string());
                    }
                }
                Action::Create | Action::Update => {
                    if let Some(local_id) = entry.local_id {
                        set.local_ids.insert(local_id);
                        if entry.payload.server_id.is_none() {
                            if let Some(cid) = entry.payload.correlation_id {
                                set.correlations.insert(cid, local_id);
                            }
                            if let Some(fingerprint) = entry.payload.fingerprint() {
                                set.fingerprints.insert(fingerprint);
                            }
                        }
                    }
                    if let Some(server_id) = entry.target_server_id() {
                        set.server_ids.insert(server_id.to_string());
                    }
                }
            }
        }

        set
    }

    /// Folds in the work of a later snapshot. A refresh protects everything
    /// that was pending at any point while its remote list was in flight.
    pub fn merge(&mut self, other: PendingSet) {
        self.local_ids.extend(other.local_ids);
        self.server_ids.extend(other.server_ids);
        self.deleted.extend(other.deleted);
        self.fingerprints.extend(other.fingerprints);
        for (cid, local_id) in other.correlations {
            self.correlations.entry(cid).or_insert(local_id);
        }
    }

    /// The remote row has a queued delete and must not come back.
    pub fn is_deleted(&self, server_id: &str) -> bool {
        self.deleted.contains(server_id)
    }

    /// Whether a cached row carries unconfirmed state.
    ///
    /// A row never sent to the remote is also kept when its name matches a
    /// pending create.
    pub fn protects(&self, document: &Document) -> bool {
        document
            .local_id
            .is_some_and(|id| self.local_ids.contains(&id))
            || document
                .server_id
                .as_ref()
                .is_some_and(|id| self.server_ids.contains(id))
            || (document.server_id.is_none()
                && document
                    .fingerprint()
                    .is_some_and(|f| self.fingerprints.contains(&f)))
    }

    /// Finds the pending create a remote row is the echo of, by correlation
    /// id only. A matching name says nothing about identity. A local id is
    /// matched at most once.
    pub fn claim_create(&mut self, remote: &Document) -> Option<i64> {
        let local_id = self.correlations.remove(&remote.correlation_id?)?;
        self.correlations.retain(|_, id| *id != local_id);
        Some(local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn pending_create(local_id: i64, name: &str) -> OutboxEntry {
        let mut doc = Document::new("projects", Map::new()).with_field("name", name);
        doc.local_id = Some(local_id);
        doc.correlation_id = Some(Uuid::new_v4());
        OutboxEntry::create(&doc)
    }

    fn remote(server_id: &str, name: &str, cid: Option<Uuid>) -> Document {
        let mut doc = Document::new("projects", Map::new()).with_field("name", name);
        doc.server_id = Some(server_id.to_string());
        doc.correlation_id = cid;
        doc
    }

    #[test]
    fn test_collects_identities_by_action() {
        let create = pending_create(1, "A");
        let mut bound = Document::new("projects", Map::new());
        bound.local_id = Some(2);
        bound.server_id = Some("s2".into());
        let update = OutboxEntry::update(&bound);
        let delete = OutboxEntry::delete("projects", "s3", Some(3));

        let set = PendingSet::from_entries([&create, &update, &delete]);

        assert!(set.protects(&Document {
            local_id: Some(1),
            ..Document::new("projects", Map::new())
        }));
        assert!(set.protects(&remote("s2", "B", None)));
        assert!(set.is_deleted("s3"));
        assert!(!set.is_deleted("s2"));
        // A deleted row is gone locally; nothing to protect
        assert!(!set.protects(&remote("s3", "C", None)));
    }

    #[test]
    fn test_claim_by_correlation_id() {
        let create = pending_create(1, "Demo");
        let cid = create.payload.correlation_id;
        let mut set = PendingSet::from_entries([&create]);

        assert_eq!(set.claim_create(&remote("s1", "Renamed", cid)), Some(1));
        // Claimed once only
        assert_eq!(set.claim_create(&remote("s2", "Demo", cid)), None);
        assert_eq!(set.claim_create(&remote("s3", "Demo", None)), None);
    }

    #[test]
    fn test_foreign_correlation_id_never_falls_back_to_name() {
        let create = pending_create(1, "Demo");
        let mut set = PendingSet::from_entries([&create]);

        assert_eq!(
            set.claim_create(&remote("s1", "Demo", Some(Uuid::new_v4()))),
            None
        );
    }

    #[test]
    fn test_name_match_never_claims() {
        let create = pending_create(4, "  My Site");
        let mut set = PendingSet::from_entries([&create]);

        assert_eq!(set.claim_create(&remote("s1", "my site", None)), None);
    }

    #[test]
    fn test_name_match_protects_unsent_row() {
        let create = pending_create(4, "My Site");
        let set = PendingSet::from_entries([&create]);

        // Entry for row 9 was discarded, but a create of the same name is queued
        let mut unsent = Document::new("projects", Map::new()).with_field("name", "my site");
        unsent.local_id = Some(9);
        assert!(set.protects(&unsent));

        // A remote row of the same name is not protected
        assert!(!set.protects(&remote("s1", "My Site", None)));
    }

    #[test]
    fn test_merge_keeps_earlier_identities() {
        let create = pending_create(1, "A");
        let mut set = PendingSet::from_entries([&create]);
        let later = OutboxEntry::delete("projects", "s2", None);

        set.merge(PendingSet::from_entries([&later, &pending_create(7, "B")]));

        assert!(set.protects(&Document {
            local_id: Some(1),
            ..Document::new("projects", Map::new())
        }));
        assert!(set.protects(&Document {
            local_id: Some(7),
            ..Document::new("projects", Map::new())
        }));
        assert!(set.is_deleted("s2"));
    }

    #[test]
    fn test_bound_create_is_not_claimable() {
        let mut doc = Document::new("projects", Map::new()).with_field("name", "Demo");
        doc.local_id = Some(1);
        doc.server_id = Some("s1".into());
        doc.correlation_id = Some(Uuid::new_v4());
        let entry = OutboxEntry::create(&doc);
        let mut set = PendingSet::from_entries([&entry]);

        assert_eq!(set.claim_create(&remote("s9", "Demo", doc.correlation_id)), None);
        assert!(set.protects(&remote("s1", "Demo", None)));
    }
}
