//! Property tests for the whitelist pattern compiler and ruleset

use auth_gateway::{compile, InMemoryWhitelistStore, Matcher, SyncOptions, WhitelistStore, WhitelistSynchronizer};
use proptest::prelude::*;
use std::sync::Arc;

fn segment() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,8}"
}

fn path(max_segments: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(segment(), 1..=max_segments)
}

fn join(segments: &[String]) -> String {
    format!("/{}", segments.join("/"))
}

proptest! {
    #[test]
    fn literal_spec_matches_exactly_itself(segments in path(5), extra in segment()) {
        let spec = join(&segments);
        let pattern = compile(&spec).unwrap();
        prop_assert!(pattern.matches(&spec));

        let mut longer = segments.clone();
        longer.push(extra);
        let with_slash = format!("{spec}/");
        prop_assert!(!pattern.matches(&join(&longer)));
        prop_assert!(!pattern.matches(&with_slash));
    }

    #[test]
    fn single_wildcard_matches_exactly_one_segment(prefix in path(3), value in segment(), extra in segment()) {
        let pattern = compile(&format!("{}/*", join(&prefix))).unwrap();
        let base = join(&prefix);
        let one_segment = format!("{base}/{value}");
        let two_segments = format!("{one_segment}/{extra}");
        prop_assert!(pattern.matches(&one_segment));
        prop_assert!(!pattern.matches(&base));
        prop_assert!(!pattern.matches(&two_segments));
    }

    #[test]
    fn tail_wildcard_matches_every_descendant(prefix in path(3), rest in prop::collection::vec(segment(), 0..5)) {
        let base = join(&prefix);
        for spec in [format!("{base}/**"), format!("{base}/{{*rest}}")] {
            let pattern = compile(&spec).unwrap();
            let mut full = prefix.clone();
            full.extend(rest.iter().cloned());
            prop_assert!(pattern.matches(&join(&full)));
        }
    }

    #[test]
    fn compile_is_deterministic(spec in "/[a-z*?{}/:]{0,16}") {
        let first = compile(&spec);
        let second = compile(&spec);
        prop_assert_eq!(first.is_ok(), second.is_ok());
        if let (Ok(a), Ok(b)) = (first, second) {
            for path in ["/", "/a", "/a/b", "/abc/def/ghi"] {
                prop_assert_eq!(a.matches(path), b.matches(path));
            }
        }
    }

    #[test]
    fn specs_without_leading_slash_are_rejected(spec in "[a-z*][a-z/*]{0,12}") {
        prop_assert!(compile(&spec).is_err());
    }

    #[test]
    fn every_valid_source_spec_reaches_the_ruleset(
        specs in prop::collection::vec(path(4), 1..8),
        bad in prop::collection::vec("[a-z]{1,6}", 0..4),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let store = Arc::new(InMemoryWhitelistStore::new());
            store.register_source("svc");
            store.add_specifications("svc", specs.iter().map(|s| join(s)));
            store.add_specifications("svc", bad.iter().cloned());

            let sync = WhitelistSynchronizer::new(
                Arc::clone(&store) as Arc<dyn WhitelistStore>,
                SyncOptions::default(),
            );
            let rules = sync.refresh_all().await.unwrap();
            for segments in &specs {
                assert!(rules.matches(&join(segments)));
            }
        });
    }
}
