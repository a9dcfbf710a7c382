use std::cmp::Ordering;
use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::fs::FileType;
use crate::snapshot::{is_descendant, path_cmp, walk_rootfs, AttrCaps, Attributes, KeywordSet, Snapshot, SnapshotEntry};
use crate::types::DiffEntry;

/// compare a live rootfs against its baseline snapshot
///
/// returns the changes in path order. only keywords that were requested,
/// recorded in the snapshot and observable under `caps` are compared.
/// descendants of a removed directory (or of a directory replaced by
/// something else) are not reported; the change on the directory covers
/// them. children of an added directory are each reported as added.
pub fn detect_changes(
    rootfs: &Path,
    snapshot: &Snapshot,
    keywords: &KeywordSet,
    caps: &AttrCaps,
    cancel: &CancelToken,
) -> Result<Vec<DiffEntry>> {
    let keywords = caps.effective(&keywords.intersect(&snapshot.keywords));
    let baseline = snapshot.entries();

    let mut changes = Vec::new();
    let mut idx = 0;
    let mut walker = walk_rootfs(rootfs);
    let mut live = walker.next().transpose()?;

    loop {
        cancel.check()?;

        let Some(current) = live.take() else {
            // whatever is left in the baseline is gone
            while idx < baseline.len() {
                changes.push(DiffEntry::removed(&baseline[idx].path));
                idx = skip_descendants(baseline, idx);
            }
            break;
        };

        let ord = match baseline.get(idx) {
            Some(base) => path_cmp(&base.path, &current.path),
            None => Ordering::Greater,
        };

        match ord {
            Ordering::Less => {
                changes.push(DiffEntry::removed(&baseline[idx].path));
                idx = skip_descendants(baseline, idx);
                live = Some(current);
            }
            Ordering::Greater => {
                let attrs = Attributes::read(&current.full_path, &keywords, caps)?;
                changes.push(DiffEntry::added(current.path, attrs));
                live = walker.next().transpose()?;
            }
            Ordering::Equal => {
                let base = &baseline[idx];
                let attrs = Attributes::read(&current.full_path, &keywords, caps)?;
                let differences = caps.restrict(&base.attrs).differences(&attrs, &keywords);

                let replaced_dir = base.attrs.file_type == FileType::Directory
                    && attrs.file_type != FileType::Directory;

                if !differences.is_empty() {
                    tracing::trace!(path = %current.path, ?differences, "modified");
                    changes.push(DiffEntry::modified(current.path, attrs));
                }

                idx = if replaced_dir {
                    skip_descendants(baseline, idx)
                } else {
                    idx + 1
                };
                live = walker.next().transpose()?;
            }
        }
    }

    tracing::debug!(rootfs = %rootfs.display(), changes = changes.len(), "detected changes");
    Ok(changes)
}

/// index of the first baseline entry after `idx` that is not below it
fn skip_descendants(baseline: &[SnapshotEntry], idx: usize) -> usize {
    let dir = &baseline[idx].path;
    let mut next = idx + 1;
    while next < baseline.len() && is_descendant(&baseline[next].path, dir) {
        next += 1;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::snapshot::Keyword;
    use crate::types::ChangeKind;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn sample_rootfs(dir: &Path) -> PathBuf {
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::create_dir_all(rootfs.join("var/log")).unwrap();
        fs::write(rootfs.join("etc/hostname"), "box\n").unwrap();
        fs::write(rootfs.join("var/log/x"), "x").unwrap();
        rootfs
    }

    fn capture(rootfs: &Path) -> Snapshot {
        Snapshot::capture(
            rootfs,
            &KeywordSet::all(),
            &AttrCaps::privileged(),
            &CancelToken::new(),
        )
        .unwrap()
    }

    fn detect(rootfs: &Path, snapshot: &Snapshot) -> Vec<(ChangeKind, String)> {
        detect_changes(
            rootfs,
            snapshot,
            &KeywordSet::all(),
            &AttrCaps::privileged(),
            &CancelToken::new(),
        )
        .unwrap()
        .into_iter()
        .map(|d| (d.kind, d.path))
        .collect()
    }

    fn change(kind: ChangeKind, path: &str) -> (ChangeKind, String) {
        (kind, path.to_string())
    }

    #[test]
    fn test_unchanged_tree() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);
        assert!(detect(&rootfs, &snap).is_empty());
    }

    #[test]
    fn test_remove_and_add_file() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        fs::remove_file(rootfs.join("var/log/x")).unwrap();
        fs::write(rootfs.join("var/log/y"), "y").unwrap();

        assert_eq!(
            detect(&rootfs, &snap),
            vec![
                change(ChangeKind::Removed, "var/log/x"),
                change(ChangeKind::Added, "var/log/y"),
            ]
        );
    }

    #[test]
    fn test_removed_dir_hides_descendants() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        fs::remove_dir_all(rootfs.join("var")).unwrap();

        assert_eq!(detect(&rootfs, &snap), vec![change(ChangeKind::Removed, "var")]);
    }

    #[test]
    fn test_added_dir_reports_children() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        fs::create_dir_all(rootfs.join("opt/app")).unwrap();
        fs::write(rootfs.join("opt/app/bin"), "#!/bin/sh\n").unwrap();

        assert_eq!(
            detect(&rootfs, &snap),
            vec![
                change(ChangeKind::Added, "opt"),
                change(ChangeKind::Added, "opt/app"),
                change(ChangeKind::Added, "opt/app/bin"),
            ]
        );
    }

    #[test]
    fn test_content_and_mode_changes() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        // same size, different content
        fs::write(rootfs.join("etc/hostname"), "xob\n").unwrap();
        fs::set_permissions(rootfs.join("var/log/x"), fs::Permissions::from_mode(0o600)).unwrap();

        let changes = detect_changes(
            &rootfs,
            &snap,
            &KeywordSet::all(),
            &AttrCaps::privileged(),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "etc/hostname");
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[1].path, "var/log/x");
        assert_eq!(changes[1].attrs.as_ref().unwrap().mode, Some(0o600));
    }

    #[test]
    fn test_dir_replaced_by_file() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        fs::remove_dir_all(rootfs.join("var")).unwrap();
        fs::write(rootfs.join("var"), "now a file").unwrap();

        assert_eq!(detect(&rootfs, &snap), vec![change(ChangeKind::Modified, "var")]);
    }

    #[test]
    fn test_file_replaced_by_dir() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        fs::remove_file(rootfs.join("var/log/x")).unwrap();
        fs::create_dir(rootfs.join("var/log/x")).unwrap();
        fs::write(rootfs.join("var/log/x/inner"), "i").unwrap();

        assert_eq!(
            detect(&rootfs, &snap),
            vec![
                change(ChangeKind::Modified, "var/log/x"),
                change(ChangeKind::Added, "var/log/x/inner"),
            ]
        );
    }

    #[test]
    fn test_keywords_limit_comparison() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        fs::write(rootfs.join("etc/hostname"), "different length\n").unwrap();

        let only_mode: KeywordSet = [Keyword::Mode].into_iter().collect();
        let changes = detect_changes(
            &rootfs,
            &snap,
            &only_mode,
            &AttrCaps::privileged(),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_rootless_ignores_ownership() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        let entries = snap
            .entries()
            .iter()
            .cloned()
            .map(|mut e| {
                if e.path == "etc/hostname" {
                    e.attrs.uid = e.attrs.uid.map(|uid| uid.wrapping_add(1));
                }
                e
            })
            .collect();
        let tampered = Snapshot::new(snap.keywords.clone(), entries);

        assert_eq!(
            detect(&rootfs, &tampered),
            vec![change(ChangeKind::Modified, "etc/hostname")]
        );

        let rootless = detect_changes(
            &rootfs,
            &tampered,
            &KeywordSet::all(),
            &AttrCaps::rootless(),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(rootless.is_empty());
    }

    #[test]
    fn test_unrecorded_keyword_not_compared() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let recorded: KeywordSet = [Keyword::Mode].into_iter().collect();
        let snap = Snapshot::capture(&rootfs, &recorded, &AttrCaps::privileged(), &CancelToken::new())
            .unwrap();

        fs::write(rootfs.join("etc/hostname"), "changed\n").unwrap();
        assert!(detect(&rootfs, &snap).is_empty());
    }

    #[test]
    fn test_output_is_stable() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);

        fs::write(rootfs.join("b"), "b").unwrap();
        fs::write(rootfs.join("a"), "a").unwrap();
        fs::remove_file(rootfs.join("etc/hostname")).unwrap();

        let first = detect(&rootfs, &snap);
        let second = detect(&rootfs, &snap);
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                change(ChangeKind::Added, "a"),
                change(ChangeKind::Added, "b"),
                change(ChangeKind::Removed, "etc/hostname"),
            ]
        );
    }

    #[test]
    fn test_cancelled() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = capture(&rootfs);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = detect_changes(&rootfs, &snap, &KeywordSet::all(), &AttrCaps::privileged(), &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
