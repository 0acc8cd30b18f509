//! Lock-step comparison of two path-ordered listings.
//!
//! Both listings are consumed in a single pass, like a merge join. Memory use
//! is bounded by the listing channels, not by the size of either tree.

use crate::error::Result;
use crate::storage::{key_cmp, Entry, StorageClient};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    OnlyInSource,
    OnlyInTarget,
    DiffersInType,
    DiffersInSize,
    DiffersInTimeOnly,
    Identical,
}

/// One compared key. At least one side is present; both are present for
/// every classification other than the two `OnlyIn*` ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    pub classification: Classification,
    pub source: Option<Entry>,
    pub target: Option<Entry>,
}

impl Difference {
    /// Key shared by both sides
    pub fn key(&self) -> &str {
        self.source
            .as_ref()
            .or(self.target.as_ref())
            .map(|e| e.key.as_str())
            .unwrap_or_default()
    }
}

/// Classify two entries known to share a key.
pub fn classify(source: &Entry, target: &Entry) -> Classification {
    if source.is_dir != target.is_dir {
        return Classification::DiffersInType;
    }
    if source.is_dir {
        return Classification::Identical;
    }
    if source.size != target.size {
        return Classification::DiffersInSize;
    }
    match (source.modified, target.modified) {
        (Some(s), Some(t)) if s != t => Classification::DiffersInTimeOnly,
        _ => Classification::Identical,
    }
}

/// Compare two clients' trees.
pub fn diff(
    source: &dyn StorageClient,
    target: &dyn StorageClient,
    recursive: bool,
) -> BoxStream<'static, Result<Difference>> {
    diff_listings(source.list(recursive, true), target.list(recursive, true)).boxed()
}

/// Merge two path-ordered listings into differences, also in path order.
///
/// Listing errors are passed through as `Err` items and the merge carries on
/// with the next entry of that side.
pub fn diff_listings<S, T>(source: S, target: T) -> impl Stream<Item = Result<Difference>> + Send
where
    S: Stream<Item = Result<Entry>> + Send + Unpin + 'static,
    T: Stream<Item = Result<Entry>> + Send + Unpin + 'static,
{
    let state = Merge {
        source: Side::new(source),
        target: Side::new(target),
    };
    futures::stream::unfold(state, |mut state| async move {
        state.next().await.map(|item| (item, state))
    })
}

struct Side<S> {
    stream: S,
    head: Option<Entry>,
    done: bool,
    /// Subtree of a directory that lost a type comparison; its children have
    /// no counterpart worth reporting.
    skip_under: Option<String>,
}

impl<S> Side<S>
where
    S: Stream<Item = Result<Entry>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            head: None,
            done: false,
            skip_under: None,
        }
    }

    /// Load the next head if empty. Returns a listing error if one surfaced.
    async fn fill(&mut self) -> Option<crate::error::MirrorError> {
        while self.head.is_none() && !self.done {
            match self.stream.next().await {
                Some(Ok(entry)) => {
                    if let Some(prefix) = &self.skip_under {
                        if entry.key.starts_with(prefix.as_str()) {
                            continue;
                        }
                        self.skip_under = None;
                    }
                    self.head = Some(entry);
                }
                Some(Err(e)) => return Some(e),
                None => self.done = true,
            }
        }
        None
    }

    fn skip_children_of(&mut self, entry: &Entry) {
        if entry.is_dir {
            self.skip_under = Some(format!("{}/", entry.key));
        }
    }
}

struct Merge<S, T> {
    source: Side<S>,
    target: Side<T>,
}

impl<S, T> Merge<S, T>
where
    S: Stream<Item = Result<Entry>> + Unpin,
    T: Stream<Item = Result<Entry>> + Unpin,
{
    async fn next(&mut self) -> Option<Result<Difference>> {
        if let Some(e) = self.source.fill().await {
            return Some(Err(e));
        }
        if let Some(e) = self.target.fill().await {
            return Some(Err(e));
        }

        let only_source = |s: Entry| Difference {
            classification: Classification::OnlyInSource,
            source: Some(s),
            target: None,
        };
        let only_target = |t: Entry| Difference {
            classification: Classification::OnlyInTarget,
            source: None,
            target: Some(t),
        };

        let diff = match (self.source.head.take(), self.target.head.take()) {
            (None, None) => return None,
            (Some(s), None) => only_source(s),
            (None, Some(t)) => only_target(t),
            (Some(s), Some(t)) => match key_cmp(&s.key, &t.key) {
                Ordering::Less => {
                    self.target.head = Some(t);
                    only_source(s)
                }
                Ordering::Greater => {
                    self.source.head = Some(s);
                    only_target(t)
                }
                Ordering::Equal => {
                    let classification = classify(&s, &t);
                    if classification == Classification::DiffersInType {
                        self.source.skip_children_of(&s);
                        self.target.skip_children_of(&t);
                    }
                    Difference {
                        classification,
                        source: Some(s),
                        target: Some(t),
                    }
                }
            },
        };
        Some(Ok(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorError;
    use crate::location::Location;
    use crate::storage::local::LocalClient;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    fn listing(entries: Vec<Entry>) -> BoxStream<'static, Result<Entry>> {
        futures::stream::iter(entries.into_iter().map(Ok)).boxed()
    }

    async fn run(source: Vec<Entry>, target: Vec<Entry>) -> Vec<Difference> {
        diff_listings(listing(source), listing(target))
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[test]
    fn test_classify() {
        let at = |secs| Utc.timestamp_opt(secs, 0).unwrap();
        let f = |size| Entry::file("k", size);

        assert_eq!(classify(&f(1), &Entry::dir("k")), Classification::DiffersInType);
        assert_eq!(classify(&Entry::dir("k"), &Entry::dir("k")), Classification::Identical);
        assert_eq!(classify(&f(1), &f(2)), Classification::DiffersInSize);
        assert_eq!(
            classify(&f(1).with_modified(at(1)), &f(1).with_modified(at(2))),
            Classification::DiffersInTimeOnly
        );
        assert_eq!(classify(&f(1).with_modified(at(1)), &f(1)), Classification::Identical);
        assert_eq!(classify(&f(1), &f(1)), Classification::Identical);
    }

    #[tokio::test]
    async fn test_merge_basic() {
        let diffs = run(
            vec![Entry::file("a/1.txt", 10), Entry::file("b/2.txt", 20)],
            vec![Entry::file("b/2.txt", 20), Entry::file("c/old.txt", 5)],
        )
        .await;

        let summary: Vec<(&str, Classification)> =
            diffs.iter().map(|d| (d.key(), d.classification)).collect();
        assert_eq!(
            summary,
            vec![
                ("a/1.txt", Classification::OnlyInSource),
                ("b/2.txt", Classification::Identical),
                ("c/old.txt", Classification::OnlyInTarget),
            ]
        );
    }

    #[tokio::test]
    async fn test_type_mismatch_skips_subtree() {
        let diffs = run(
            vec![Entry::file("a", 3), Entry::file("b", 1)],
            vec![Entry::dir("a"), Entry::file("a/inner", 1), Entry::file("b", 1)],
        )
        .await;

        let summary: Vec<(&str, Classification)> =
            diffs.iter().map(|d| (d.key(), d.classification)).collect();
        assert_eq!(
            summary,
            vec![
                ("a", Classification::DiffersInType),
                ("b", Classification::Identical),
            ]
        );
    }

    #[tokio::test]
    async fn test_listing_error_passes_through() {
        let source = futures::stream::iter(vec![
            Ok(Entry::file("a", 1)),
            Err(MirrorError::NotFound("gone".into())),
            Ok(Entry::file("c", 1)),
        ])
        .boxed();
        let items: Vec<Result<Difference>> =
            diff_listings(source, listing(vec![Entry::file("c", 1)])).collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().classification, Classification::OnlyInSource);
        assert!(items[1].is_err());
        assert_eq!(items[2].as_ref().unwrap().classification, Classification::Identical);
    }

    #[tokio::test]
    async fn test_diff_local_trees() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("a")).unwrap();
        fs::write(src.path().join("a/1.txt"), vec![0u8; 10]).unwrap();
        fs::write(src.path().join("same"), b"xyz").unwrap();
        fs::write(dst.path().join("same"), b"xyz").unwrap();
        fs::write(dst.path().join("zzz"), b"old").unwrap();

        let source = LocalClient::new(Location::local(src.path()));
        let target = LocalClient::new(Location::local(dst.path()));
        let diffs: Vec<Difference> = diff(&source, &target, true)
            .map(|r| r.unwrap())
            .collect()
            .await;

        let files: Vec<(&str, Classification)> = diffs
            .iter()
            .filter(|d| !d.source.as_ref().or(d.target.as_ref()).unwrap().is_dir)
            .map(|d| (d.key(), d.classification))
            .collect();
        assert_eq!(files[0], ("a/1.txt", Classification::OnlyInSource));
        assert_eq!(files[1].0, "same");
        assert!(matches!(
            files[1].1,
            Classification::Identical | Classification::DiffersInTimeOnly
        ));
        assert_eq!(files[2], ("zzz", Classification::OnlyInTarget));
    }

    fn key_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-c]{1,2}", 1..3).prop_map(|parts| parts.join("/"))
    }

    type Attrs = (bool, u64, Option<i64>);

    fn attrs_strategy() -> impl Strategy<Value = Attrs> {
        (any::<bool>(), 0u64..3, prop::option::of(0i64..3))
    }

    fn entry_from(key: &str, (is_dir, size, modified): Attrs) -> Entry {
        let entry = if is_dir { Entry::dir(key) } else { Entry::file(key, size) };
        match modified {
            Some(secs) => entry.with_modified(Utc.timestamp_opt(secs, 0).unwrap()),
            None => entry,
        }
    }

    /// Expand one side into a sorted listing; every directory gets a single child.
    fn side_listing(keys: &[(String, Option<Entry>)]) -> Vec<Entry> {
        let mut entries = Vec::new();
        for (key, entry) in keys {
            if let Some(entry) = entry {
                entries.push(entry.clone());
                if entry.is_dir {
                    entries.push(Entry::file(format!("{key}/c"), 1));
                }
            }
        }
        entries
    }

    proptest! {
        #[test]
        fn prop_merge_classifies_shared_keys(
            pairs in prop::collection::btree_map(
                "[a-f]",
                (prop::option::of(attrs_strategy()), prop::option::of(attrs_strategy())),
                0..6,
            ),
        ) {
            let mut source = Vec::new();
            let mut target = Vec::new();
            let mut expected: Vec<(String, Classification)> = Vec::new();
            for (key, (s, t)) in &pairs {
                let s = s.map(|a| entry_from(key, a));
                let t = t.map(|a| entry_from(key, a));
                let child = format!("{key}/c");
                match (&s, &t) {
                    (Some(s), Some(t)) => {
                        let class = classify(s, t);
                        expected.push((key.clone(), class));
                        if class != Classification::DiffersInType && s.is_dir {
                            expected.push((child, Classification::Identical));
                        }
                    }
                    (Some(s), None) => {
                        expected.push((key.clone(), Classification::OnlyInSource));
                        if s.is_dir {
                            expected.push((child, Classification::OnlyInSource));
                        }
                    }
                    (None, Some(t)) => {
                        expected.push((key.clone(), Classification::OnlyInTarget));
                        if t.is_dir {
                            expected.push((child, Classification::OnlyInTarget));
                        }
                    }
                    (None, None) => {}
                }
                source.push((key.clone(), s));
                target.push((key.clone(), t));
            }

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let diffs = rt.block_on(run(side_listing(&source), side_listing(&target)));
            let got: Vec<(String, Classification)> = diffs
                .iter()
                .map(|d| (d.key().to_string(), d.classification))
                .collect();
            prop_assert_eq!(got, expected);

            for d in &diffs {
                if let (Some(s), Some(t)) = (&d.source, &d.target) {
                    prop_assert_eq!(d.classification, classify(s, t));
                }
            }
        }

        #[test]
        fn prop_merge_covers_union_in_order(
            source_keys in prop::collection::btree_set(key_strategy(), 0..20),
            target_keys in prop::collection::btree_set(key_strategy(), 0..20),
        ) {
            let to_entries = |keys: &BTreeSet<String>| {
                let mut entries: Vec<Entry> = keys.iter().map(|k| Entry::file(k.clone(), 1)).collect();
                entries.sort_by(|a, b| key_cmp(&a.key, &b.key));
                entries
            };
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let diffs = rt.block_on(run(to_entries(&source_keys), to_entries(&target_keys)));

            let mut expected: Vec<String> = source_keys.union(&target_keys).cloned().collect();
            expected.sort_by(|a, b| key_cmp(a, b));
            let got: Vec<String> = diffs.iter().map(|d| d.key().to_string()).collect();
            prop_assert_eq!(got, expected);

            for d in &diffs {
                let in_source = source_keys.contains(d.key());
                let in_target = target_keys.contains(d.key());
                let expected_class = match (in_source, in_target) {
                    (true, false) => Classification::OnlyInSource,
                    (false, true) => Classification::OnlyInTarget,
                    _ => Classification::Identical,
                };
                prop_assert_eq!(d.classification, expected_class);
            }
        }
    }
}
