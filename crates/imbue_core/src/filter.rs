//! Per-namespace filter math, kept free of hub state so it can be exercised
//! directly by property tests.

use crate::{canonical_namespace, Item};
use std::collections::{BTreeMap, BTreeSet};

/// What the peers of one namespace collectively need: the union of their
/// accepted MIME types. An empty `accepts` means at least one peer accepts
/// everything on that namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFilter {
    pub namespace: String,
    pub accepts: Vec<String>,
}

/// Computes the filter snapshot for a set of non-broadcast peers, given as
/// `(namespace, accepted_types)` pairs.
///
/// The result is sorted by namespace and each accept list is sorted, so two
/// snapshots over the same peer set compare equal regardless of input order.
pub fn compute(peers: &[(String, Vec<String>)]) -> Vec<NamespaceFilter> {
    // namespace → accepted set; None once some peer accepts everything.
    let mut merged: BTreeMap<String, Option<BTreeSet<String>>> = BTreeMap::new();

    for (ns, accepts) in peers {
        let ns = canonical_namespace(ns).to_string();
        let entry = merged.entry(ns).or_insert_with(|| Some(BTreeSet::new()));
        if accepts.is_empty() {
            *entry = None;
        } else if let Some(set) = entry.as_mut() {
            set.extend(accepts.iter().cloned());
        }
    }

    merged
        .into_iter()
        .map(|(namespace, accepts)| NamespaceFilter {
            namespace,
            accepts: accepts
                .map(|set| set.into_iter().collect())
                .unwrap_or_default(),
        })
        .collect()
}

/// Returns only the items whose MIME type appears in `accepts`.
/// An empty `accepts` returns the items unchanged.
pub fn filter_items(items: &[Item], accepts: &[String]) -> Vec<Item> {
    if accepts.is_empty() {
        return items.to_vec();
    }
    items
        .iter()
        .filter(|it| accepts.iter().any(|a| *a == it.mime))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(ns: &str, accepts: &[&str]) -> (String, Vec<String>) {
        (
            ns.to_string(),
            accepts.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn unions_accepts_per_namespace() {
        let peers = vec![
            peer("default", &["text/plain"]),
            peer("default", &["image/png"]),
            peer("scratch", &[]),
        ];
        let snapshot = compute(&peers);
        assert_eq!(
            snapshot,
            vec![
                NamespaceFilter {
                    namespace: "default".into(),
                    accepts: vec!["image/png".into(), "text/plain".into()],
                },
                NamespaceFilter {
                    namespace: "scratch".into(),
                    accepts: vec![],
                },
            ]
        );
    }

    #[test]
    fn removal_shrinks_or_drops_namespaces() {
        let mut peers = vec![
            peer("default", &["text/plain"]),
            peer("default", &["image/png"]),
            peer("scratch", &[]),
        ];

        peers.retain(|(ns, _)| ns != "scratch");
        let snapshot = compute(&peers);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot[0].accepts,
            vec!["image/png".to_string(), "text/plain".to_string()]
        );

        peers.retain(|(_, accepts)| accepts != &vec!["image/png".to_string()]);
        let snapshot = compute(&peers);
        assert_eq!(snapshot[0].accepts, vec!["text/plain".to_string()]);
    }

    #[test]
    fn accept_all_absorbs_specific_lists() {
        let peers = vec![peer("default", &["text/plain"]), peer("default", &[])];
        let snapshot = compute(&peers);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].accepts.is_empty());
    }

    #[test]
    fn empty_namespace_is_canonicalized() {
        let snapshot = compute(&[peer("", &["text/plain"])]);
        assert_eq!(snapshot[0].namespace, "default");
    }

    #[test]
    fn filter_items_empty_accepts_passes_through() {
        let items = vec![Item::text("hi"), Item::new("image/png", vec![1, 2])];
        assert_eq!(filter_items(&items, &[]), items);
    }

    #[test]
    fn filter_items_drops_unlisted_mimes() {
        let items = vec![Item::text("hi"), Item::new("image/png", vec![1, 2])];
        let filtered = filter_items(&items, &["image/png".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].mime, "image/png");
    }

    fn arb_peers() -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
        let ns = prop_oneof![
            Just("default".to_string()),
            Just("scratch".to_string()),
            Just("work".to_string()),
            Just(String::new()),
        ];
        let mime = prop_oneof![
            Just("text/plain".to_string()),
            Just("image/png".to_string()),
            Just("text/html".to_string()),
        ];
        proptest::collection::vec((ns, proptest::collection::vec(mime, 0..3)), 0..8)
    }

    proptest! {
        #[test]
        fn deterministic(peers in arb_peers()) {
            prop_assert_eq!(compute(&peers), compute(&peers));
        }

        #[test]
        fn permutation_invariant(peers in arb_peers(), seed in any::<u64>()) {
            let mut shuffled = peers.clone();
            // Cheap deterministic shuffle: rotate + swap pairs by seed.
            if !shuffled.is_empty() {
                let rot = (seed as usize) % shuffled.len();
                shuffled.rotate_left(rot);
                for i in 1..shuffled.len() {
                    if seed & (1 << (i % 64)) != 0 {
                        shuffled.swap(i - 1, i);
                    }
                }
            }
            prop_assert_eq!(compute(&peers), compute(&shuffled));
        }

        #[test]
        fn removal_is_monotonic(peers in arb_peers(), drop_idx in any::<proptest::sample::Index>()) {
            prop_assume!(!peers.is_empty());
            let before = compute(&peers);
            let mut fewer = peers.clone();
            fewer.remove(drop_idx.index(peers.len()));
            let after = compute(&fewer);

            for f in &after {
                let prior = before.iter().find(|b| b.namespace == f.namespace);
                let prior = prior.expect("namespace appeared after removing a peer");
                if prior.accepts.is_empty() {
                    // "accept all" can only stay or disappear, never narrow
                    // into a broader concrete union than before.
                    continue;
                }
                prop_assert!(f.accepts.iter().all(|a| prior.accepts.contains(a)));
            }
        }
    }
}
