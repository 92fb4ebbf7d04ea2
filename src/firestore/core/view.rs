use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::local::DocumentMap;
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::{OnlineState, TargetChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Removed,
    Added,
    Modified,
    /// Only `has_pending_writes` changed.
    Metadata,
}

impl ChangeType {
    fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Per-key change log that folds repeated changes of one document into a single entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) {
        use ChangeType::*;
        let key = change.document.key().clone();
        let Some(previous) = self.changes.get(&key).map(|entry| entry.change_type) else {
            self.changes.insert(key, change);
            return;
        };
        let merged = match (previous, change.change_type) {
            (Added, Removed) => {
                self.changes.remove(&key);
                return;
            }
            (Added, Modified | Metadata) => Added,
            (Removed, Added) => Modified,
            (Metadata | Modified, Modified) => Modified,
            (Modified, Metadata) => Modified,
            (Metadata, Metadata) => Metadata,
            (Modified | Metadata, Removed) => Removed,
            (_, incoming) => incoming,
        };
        self.changes.insert(
            key,
            DocumentViewChange {
                change_type: merged,
                document: change.document,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Candidate next state of a view; nothing is applied until [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    documents: BTreeMap<DocumentKey, Document>,
    change_set: DocumentChangeSet,
    mutated_keys: BTreeSet<DocumentKey>,
    /// A limited view lost or moved a document and must be re-run against the local cache.
    pub needs_refill: bool,
}

/// What a listener sees after a view changed.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    /// Matching documents in query order.
    pub docs: Vec<Document>,
    pub changes: Vec<DocumentViewChange>,
    pub from_cache: bool,
    pub has_pending_writes: bool,
    pub sync_state_changed: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

/// Result set of one query, kept in sync with local and remote changes.
#[derive(Clone, Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    /// Set once the backend marked the target current; cleared by going offline.
    current: bool,
    documents: BTreeMap<DocumentKey, Document>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    /// Keys the backend says belong to the target.
    synced_documents: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        Self {
            query,
            sync_state: None,
            current: false,
            documents: BTreeMap::new(),
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            synced_documents,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    fn edge_document<'a>(
        &self,
        documents: &'a BTreeMap<DocumentKey, Document>,
        pick: Ordering,
    ) -> Option<&'a Document> {
        documents
            .values()
            .reduce(|edge, candidate| {
                if self.query.compare(candidate, edge) == pick {
                    candidate
                } else {
                    edge
                }
            })
    }

    /// Folds `changes` into the current (or `previous`) state without applying it.
    pub fn compute_doc_changes(
        &self,
        changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let refilling = previous.is_some();
        let (mut documents, mut change_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.documents, previous.change_set, previous.mutated_keys),
            None => (
                self.documents.clone(),
                DocumentChangeSet::default(),
                self.mutated_keys.clone(),
            ),
        };

        let full = self.query.limit().map(|limit| documents.len() == limit as usize) == Some(true);
        let last_in_limit = (full && self.query.limit_type() == LimitType::First)
            .then(|| self.edge_document(&documents, Ordering::Greater).cloned())
            .flatten();
        let first_in_limit = (full && self.query.limit_type() == LimitType::Last)
            .then(|| self.edge_document(&documents, Ordering::Less).cloned())
            .flatten();
        let mut needs_refill = false;

        for (key, candidate) in changes {
            let old = documents.get(key).cloned();
            let new = Some(candidate).filter(|doc| self.query.matches(doc)).cloned();

            let old_had_pending = old.is_some() && self.mutated_keys.contains(key);
            // Committed writes only count for documents mutated while this view existed.
            let new_has_pending = new.as_ref().is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let applied = match (&old, &new) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if wait_for_synced_document(old, new) {
                            false
                        } else {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new.clone(),
                            });
                            let moved_past_last = last_in_limit.as_ref().is_some_and(|last| {
                                self.query.compare(new, last) == Ordering::Greater
                            });
                            let moved_before_first = first_in_limit.as_ref().is_some_and(|first| {
                                self.query.compare(new, first) == Ordering::Less
                            });
                            if moved_past_last || moved_before_first {
                                needs_refill = true;
                            }
                            true
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new.clone(),
                        });
                        true
                    } else {
                        false
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new.clone(),
                    });
                    true
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old.clone(),
                    });
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                    true
                }
                (None, None) => false,
            };

            if applied {
                match new {
                    Some(new) => {
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                        documents.insert(key.clone(), new);
                    }
                    None => {
                        documents.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            let far_end = match self.query.limit_type() {
                LimitType::First => Ordering::Greater,
                LimitType::Last => Ordering::Less,
            };
            while documents.len() > limit as usize {
                let Some(evicted) = self.edge_document(&documents, far_end).cloned() else {
                    break;
                };
                documents.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        debug_assert!(!(needs_refill && refilling), "refill produced another refill");
        ViewDocumentChanges {
            documents,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Commits `doc_changes` and, when given, the target's membership change.
    ///
    /// Limbo documents are only recomputed while the target is current and its membership is not
    /// about to be reset by an existence-filter mismatch.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        debug_assert!(!doc_changes.needs_refill, "cannot apply changes that need a refill");
        let ViewDocumentChanges {
            documents,
            change_set,
            mutated_keys,
            ..
        } = doc_changes;
        self.documents = documents;
        self.mutated_keys = mutated_keys;

        let mut changes = change_set.into_changes();
        changes.sort_by(|left, right| {
            left.change_type
                .rank()
                .cmp(&right.change_type.rank())
                .then_with(|| self.query.compare(&left.document, &right.document))
        });

        if let Some(target_change) = target_change {
            self.apply_target_change(target_change);
        }
        let limbo_changes = if target_is_pending_reset {
            Vec::new()
        } else {
            self.update_limbo_documents()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(sync_state);
        self.sync_state = Some(sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.sorted_documents(),
                changes,
                from_cache: sync_state == SyncState::Local,
                has_pending_writes: !self.mutated_keys.is_empty(),
                sync_state_changed,
            }),
            limbo_changes,
        }
    }

    /// Going offline downgrades a current view to `from_cache`.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if !(self.current && online_state == OnlineState::Offline) {
            return ViewChange::default();
        }
        self.current = false;
        let unchanged = ViewDocumentChanges {
            documents: self.documents.clone(),
            change_set: DocumentChangeSet::default(),
            mutated_keys: self.mutated_keys.clone(),
            needs_refill: false,
        };
        self.apply_changes(unchanged, None, true)
    }

    /// The whole current result as a fresh snapshot, for a listener joining an existing view.
    pub fn current_snapshot(&self) -> Option<ViewSnapshot> {
        let sync_state = self.sync_state?;
        let docs = self.sorted_documents();
        let changes = docs
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        Some(ViewSnapshot {
            query: self.query.clone(),
            docs,
            changes,
            from_cache: sync_state == SyncState::Local,
            has_pending_writes: !self.mutated_keys.is_empty(),
            sync_state_changed: true,
        })
    }

    fn sorted_documents(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.documents.values().cloned().collect();
        docs.sort_by(|left, right| self.query.compare(left, right));
        docs
    }

    fn apply_target_change(&mut self, change: &TargetChange) {
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.documents.get(key) {
            // Local changes may explain why the backend doesn't list it.
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let limbo: BTreeSet<DocumentKey> = self
            .documents
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();
        let previous = std::mem::replace(&mut self.limbo_documents, limbo);

        let mut changes: Vec<_> = previous
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&previous)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }
}

/// Hides the intermediate event of an acknowledged write; watch delivers the final document.
fn wait_for_synced_document(old: &Document, new: &Document) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Direction;
    use crate::firestore::model::{ResourcePath, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, n: i64) -> Document {
        let data: MapValue = [("n".to_string(), FirestoreValue::from_integer(n))]
            .into_iter()
            .collect();
        Document::found(key(path), Timestamp::new(1, 0), data)
    }

    fn deleted(path: &str) -> Document {
        Document::no_document(key(path), SnapshotVersion::min())
    }

    fn by_n() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap())
            .unwrap()
            .order_by("n", Direction::Ascending)
            .unwrap()
    }

    fn changes(docs: Vec<Document>) -> DocumentMap {
        docs.into_iter().map(|doc| (doc.key().clone(), doc)).collect()
    }

    fn apply(view: &mut View, docs: Vec<Document>, target: Option<&TargetChange>) -> ViewChange {
        let doc_changes = view.compute_doc_changes(&changes(docs), None);
        view.apply_changes(doc_changes, target, false)
    }

    fn current_with(keys: &[&str]) -> TargetChange {
        TargetChange {
            current: true,
            added_documents: keys.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    fn summary(snapshot: &ViewSnapshot) -> Vec<(ChangeType, String)> {
        snapshot
            .changes
            .iter()
            .map(|change| (change.change_type, change.document.key().to_string()))
            .collect()
    }

    #[test]
    fn diffs_are_ordered_by_kind_then_query_order() {
        let mut view = View::new(by_n(), BTreeSet::new());
        apply(&mut view, vec![doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)], None);

        let snapshot = apply(
            &mut view,
            vec![doc("rooms/c", 0), doc("rooms/d", 9), doc("rooms/e", 5), deleted("rooms/a")],
            None,
        )
        .snapshot
        .unwrap();
        assert_eq!(
            summary(&snapshot),
            vec![
                (ChangeType::Removed, "rooms/a".to_string()),
                (ChangeType::Added, "rooms/e".to_string()),
                (ChangeType::Added, "rooms/d".to_string()),
                (ChangeType::Modified, "rooms/c".to_string()),
            ]
        );
        let order: Vec<_> = snapshot.docs.iter().map(|doc| doc.key().to_string()).collect();
        assert_eq!(order, vec!["rooms/c", "rooms/b", "rooms/e", "rooms/d"]);
        assert!(snapshot.from_cache);
    }

    #[test]
    fn limits_trim_the_far_end_and_request_refills() {
        let mut view = View::new(by_n().limit_to_first(2), BTreeSet::new());
        let snapshot = apply(&mut view, vec![doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)], None)
            .snapshot
            .unwrap();
        assert_eq!(snapshot.docs.len(), 2);
        assert!(!view.contains(&key("rooms/c")));

        let removal = view.compute_doc_changes(&changes(vec![deleted("rooms/a")]), None);
        assert!(removal.needs_refill);
        let refilled = view.compute_doc_changes(&changes(vec![doc("rooms/c", 3)]), Some(removal));
        assert!(!refilled.needs_refill);
        let snapshot = view.apply_changes(refilled, None, false).snapshot.unwrap();
        let order: Vec<_> = snapshot.docs.iter().map(|doc| doc.key().to_string()).collect();
        assert_eq!(order, vec!["rooms/b", "rooms/c"]);

        let mut last = View::new(by_n().limit_to_last(1), BTreeSet::new());
        let snapshot = apply(&mut last, vec![doc("rooms/a", 1), doc("rooms/b", 2)], None)
            .snapshot
            .unwrap();
        assert_eq!(snapshot.docs, vec![doc("rooms/b", 2)]);
    }

    #[test]
    fn unconfirmed_documents_enter_limbo_once_current() {
        let mut view = View::new(by_n(), BTreeSet::new());
        let change = apply(&mut view, vec![doc("rooms/a", 1), doc("rooms/b", 2)], None);
        assert!(change.limbo_changes.is_empty());

        let pending_reset = view.compute_doc_changes(&DocumentMap::new(), None);
        let change = view.apply_changes(pending_reset, Some(&current_with(&["rooms/a"])), true);
        assert!(change.limbo_changes.is_empty());

        let change = apply(&mut view, vec![], Some(&current_with(&[])));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.map_or(true, |snapshot| snapshot.from_cache));

        let change = apply(&mut view, vec![deleted("rooms/b")], Some(&current_with(&[])));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn pending_write_transitions_are_metadata_changes() {
        let mut view = View::new(by_n(), BTreeSet::new());
        let snapshot = apply(&mut view, vec![doc("rooms/a", 1).with_local_mutations()], None)
            .snapshot
            .unwrap();
        assert!(snapshot.has_pending_writes);

        let snapshot = apply(&mut view, vec![doc("rooms/a", 1)], None).snapshot.unwrap();
        assert_eq!(summary(&snapshot), vec![(ChangeType::Metadata, "rooms/a".to_string())]);
        assert!(!snapshot.has_pending_writes);
    }

    #[test]
    fn acknowledged_contents_wait_for_watch() {
        let mut view = View::new(by_n(), BTreeSet::new());
        apply(&mut view, vec![doc("rooms/a", 1).with_local_mutations()], None);
        let change = apply(&mut view, vec![doc("rooms/a", 2).with_committed_mutations()], None);
        assert!(change.snapshot.is_none());
        let snapshot = apply(&mut view, vec![doc("rooms/a", 2)], None).snapshot.unwrap();
        assert_eq!(summary(&snapshot), vec![(ChangeType::Modified, "rooms/a".to_string())]);
    }

    #[test]
    fn going_offline_marks_views_from_cache() {
        let mut view = View::new(by_n(), BTreeSet::new());
        let snapshot = apply(&mut view, vec![doc("rooms/a", 1)], Some(&current_with(&["rooms/a"])))
            .snapshot
            .unwrap();
        assert!(!snapshot.from_cache);

        let snapshot = view.apply_online_state_change(OnlineState::Offline).snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.changes.is_empty());
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }

    #[test]
    fn repeated_changes_to_one_key_merge() {
        let mut set = DocumentChangeSet::default();
        set.track(DocumentViewChange {
            change_type: ChangeType::Added,
            document: doc("rooms/a", 1),
        });
        set.track(DocumentViewChange {
            change_type: ChangeType::Modified,
            document: doc("rooms/a", 2),
        });
        assert_eq!(
            set.clone().into_changes(),
            vec![DocumentViewChange {
                change_type: ChangeType::Added,
                document: doc("rooms/a", 2),
            }]
        );
        set.track(DocumentViewChange {
            change_type: ChangeType::Removed,
            document: doc("rooms/a", 2),
        });
        assert!(set.is_empty());
    }
}
