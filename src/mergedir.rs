//! Directory merging: the listing of an implied directory is the real
//! listing plus the child segments the virtual path set contributes, with
//! real entries shadowing virtual ones of the same name.

use crate::passthrough::Passthrough;
use crate::paths::HyperPathSet;

fn join(dir: &str, child: &str) -> String {
    if dir == "/" {
        format!("/{child}")
    } else {
        format!("{dir}/{child}")
    }
}

/// Merge one directory listing. `real` holds the passthrough entries with
/// `.`/`..` already excluded; the merger emits those two first, then the
/// real entries in their given order, then every virtual child of `dir`
/// that no real entry shadows. Shadowing is checked both against the
/// listing and with an existence probe, since a real file can exist without
/// appearing in `real` (a racing create, or a listing from a stale
/// snapshot).
pub fn merge_listing(
    dir: &str,
    real: &[String],
    set: &HyperPathSet,
    pass: &dyn Passthrough,
) -> Vec<String> {
    let mut out = Vec::with_capacity(2 + real.len());
    out.push(".".to_string());
    out.push("..".to_string());
    out.extend(real.iter().cloned());

    for child in set.children_of(dir) {
        if real.iter().any(|r| *r == child) {
            continue;
        }
        if pass.exists(&join(dir, &child)) {
            continue;
        }
        out.push(child);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeReal {
        present: HashSet<String>,
    }

    impl FakeReal {
        fn new(paths: &[&str]) -> Self {
            Self {
                present: paths.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl Passthrough for FakeReal {
        fn exists(&self, path: &str) -> bool {
            self.present.contains(path)
        }
    }

    fn set(paths: &[&str]) -> HyperPathSet {
        HyperPathSet::new(paths.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn virtual_children_are_appended() {
        let s = set(&["/igloo/ctl", "/igloo/log"]);
        let pass = FakeReal::new(&[]);
        let real = vec!["readme".to_string()];
        assert_eq!(
            merge_listing("/igloo", &real, &s, &pass),
            vec![".", "..", "readme", "ctl", "log"]
        );
    }

    #[test]
    fn real_entry_shadows_virtual_child() {
        let s = set(&["/igloo/ctl"]);
        let pass = FakeReal::new(&[]);
        let real = vec!["ctl".to_string()];
        assert_eq!(
            merge_listing("/igloo", &real, &s, &pass),
            vec![".", "..", "ctl"]
        );
    }

    #[test]
    fn existence_probe_also_shadows() {
        // Present on disk but missing from the captured listing.
        let s = set(&["/igloo/ctl"]);
        let pass = FakeReal::new(&["/igloo/ctl"]);
        assert_eq!(merge_listing("/igloo", &[], &s, &pass), vec![".", ".."]);
    }

    #[test]
    fn intermediate_segment_appears_once() {
        let s = set(&["/a/deep/x", "/a/deep/y"]);
        let pass = FakeReal::new(&[]);
        assert_eq!(merge_listing("/a", &[], &s, &pass), vec![".", "..", "deep"]);
    }

    #[test]
    fn root_listing_merges_top_level_segments() {
        let s = set(&["/vfile", "/igloo/ctl"]);
        let pass = FakeReal::new(&[]);
        let real = vec!["etc".to_string()];
        assert_eq!(
            merge_listing("/", &real, &s, &pass),
            vec![".", "..", "etc", "vfile", "igloo"]
        );
    }

    #[test]
    fn unrelated_directory_is_untouched() {
        let s = set(&["/igloo/ctl"]);
        let pass = FakeReal::new(&[]);
        let real = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            merge_listing("/other", &real, &s, &pass),
            vec![".", "..", "a", "b"]
        );
    }
}
