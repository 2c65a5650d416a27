//! Mount tree and path resolution
//!
//! The virtual directory tree is the set of mount paths: a path with a
//! filesystem attached is a mount point, a path that is merely a prefix
//! of deeper mounts is a virtual directory. Resolution probes the name
//! cache at every prefix, falls back to `read_dir` walks, and inserts
//! every directory listing it reads back into the cache (predictive
//! caching: sibling lookups usually follow).

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{name_cache, path, Dirent, FileSize, FileType, Filesystem, Rights};
use crate::error::{KernelError, KernelResult};
use crate::sync::IrqSpinlock;

/// One mounted filesystem.
struct Mount {
    path: String,
    fs: Arc<dyn Filesystem>,
}

static MOUNTS: IrqSpinlock<Vec<Mount>> = IrqSpinlock::new(Vec::new());

/// Result of a path resolution.
pub enum Resolved {
    /// The path surely does not exist.
    Missing,
    /// The path is a virtual directory of the mount tree only; no
    /// filesystem entity backs it.
    VirtualDir,
    /// The path exists on a mounted filesystem.
    Entry {
        fs: Arc<dyn Filesystem>,
        dirent: Dirent,
    },
}

/// Reset the tree. Called once at boot.
pub fn init() {
    MOUNTS.lock().clear();
}

/// Attach `fs` at `mount_path`. Fails if something is already mounted
/// there.
pub fn mount(fs: Arc<dyn Filesystem>, mount_path: &str) -> KernelResult<()> {
    let canonical = path::simplify(mount_path);
    let mut mounts = MOUNTS.lock();
    if mounts.iter().any(|m| m.path == canonical) {
        return Err(KernelError::WrongState);
    }
    log::info!("mounting {} on {}", fs.name(), canonical);
    mounts.push(Mount {
        path: canonical,
        fs,
    });
    Ok(())
}

/// Detach the filesystem at `mount_path`. Refuses while files are open
/// on it or while deeper mounts exist under it. Queued metadata is
/// flushed through before the filesystem goes away.
pub fn unmount(mount_path: &str) -> KernelResult<()> {
    super::vfile::flush_pending();

    let canonical = path::simplify(mount_path);
    let mut mounts = MOUNTS.lock();

    let index = mounts
        .iter()
        .position(|m| m.path == canonical)
        .ok_or(KernelError::NotFound)?;

    if mounts[index].fs.open_file_count() != 0 {
        return Err(KernelError::WrongState);
    }
    let has_children = mounts
        .iter()
        .any(|m| m.path != canonical && is_strictly_under(&m.path, &canonical));
    if has_children {
        return Err(KernelError::WrongState);
    }

    let mount = mounts.swap_remove(index);
    drop(mounts);

    name_cache::invalidate_fs(&mount.fs);
    mount.fs.unmount();
    log::info!("unmounted {}", canonical);
    Ok(())
}

/// True when `p` is strictly below `prefix` in the tree.
fn is_strictly_under(p: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return p != "/";
    }
    p.len() > prefix.len() && p.starts_with(prefix) && p.as_bytes()[prefix.len()] == b'/'
}

/// The mount owning `canonical` by longest-prefix match.
fn owning_mount(canonical: &str) -> Option<(Arc<dyn Filesystem>, String)> {
    let mounts = MOUNTS.lock();
    mounts
        .iter()
        .filter(|m| m.path == canonical || is_strictly_under(canonical, &m.path))
        .max_by_key(|m| m.path.len())
        .map(|m| (m.fs.clone(), m.path.clone()))
}

/// True when `canonical` is an ancestor of (or equal to) some mount
/// path, making it a directory of the virtual tree.
fn is_virtual_prefix(canonical: &str) -> bool {
    if canonical == "/" {
        return true;
    }
    let mounts = MOUNTS.lock();
    mounts
        .iter()
        .any(|m| m.path == canonical || is_strictly_under(&m.path, canonical))
}

/// A synthetic dirent for a fs root or virtual directory.
fn directory_dirent(name: String, ino: super::Ino) -> Dirent {
    Dirent {
        ino,
        file_size: FileSize::Known(0),
        file_type: FileType::Directory,
        rights: Rights::READ | Rights::SEEKABLE,
        name,
    }
}

/// Look up `name` among the children of `dir` on `fs`, inserting the
/// whole listing into the name cache keyed under `dir_path`.
fn find_fs_child(
    fs: &Arc<dyn Filesystem>,
    dir: &Dirent,
    dir_path: &str,
    name: &str,
) -> KernelResult<Option<Dirent>> {
    let entries = fs.read_dir(dir.ino)?;

    let mut found = None;
    for entry in &entries {
        let child_path = if dir_path == "/" {
            alloc::format!("/{}", entry.name)
        } else {
            alloc::format!("{}/{}", dir_path, entry.name)
        };
        name_cache::insert(name_cache::CacheEntry {
            path: child_path,
            fs: fs.clone(),
            addr: entry.ino,
            file_size: entry.file_size,
            file_type: entry.file_type,
            rights: entry.rights,
        });
        if entry.name == name {
            found = Some(entry.clone());
        }
    }
    Ok(found)
}

/// Resolve `raw_path` to a filesystem entity, a virtual directory or a
/// definite absence.
pub fn resolve(raw_path: &str) -> Resolved {
    let canonical = path::simplify(raw_path);

    // Cache first: exact path match.
    if let Some(hit) = name_cache::lookup(&canonical) {
        let name = path::split_parent(&canonical)
            .map(|(_, leaf)| String::from(leaf))
            .unwrap_or_default();
        return Resolved::Entry {
            fs: hit.fs.clone(),
            dirent: hit.to_dirent(name),
        };
    }

    let Some((fs, mount_path)) = owning_mount(&canonical) else {
        if is_virtual_prefix(&canonical) {
            return Resolved::VirtualDir;
        }
        return Resolved::Missing;
    };

    // Walk the components below the mount point.
    let remainder = &canonical[mount_path.len()..];
    let mut cur = directory_dirent(String::new(), fs.root_addr());
    let mut cur_path = mount_path.clone();

    for component in path::components(remainder) {
        if cur.file_type != FileType::Directory {
            return Resolved::Missing;
        }
        let child_path = if cur_path == "/" {
            alloc::format!("/{}", component)
        } else {
            alloc::format!("{}/{}", cur_path, component)
        };

        // Probe the cache at every prefix before reading the directory.
        let next = if let Some(hit) = name_cache::lookup(&child_path) {
            Some(hit.to_dirent(String::from(component)))
        } else {
            match find_fs_child(&fs, &cur, &cur_path, component) {
                Ok(found) => found,
                Err(_) => None,
            }
        };

        match next {
            Some(d) => {
                cur = d;
                cur_path = child_path;
            }
            None => {
                // Not on the fs; it may still be a virtual directory
                // leading to a deeper mount.
                if is_virtual_prefix(&canonical) {
                    return Resolved::VirtualDir;
                }
                return Resolved::Missing;
            }
        }
    }

    if path::components(remainder).next().is_some() {
        // The final resolved record joins the cache.
        name_cache::insert(name_cache::CacheEntry {
            path: canonical,
            fs: fs.clone(),
            addr: cur.ino,
            file_size: cur.file_size,
            file_type: cur.file_type,
            rights: cur.rights,
        });
    }

    Resolved::Entry { fs, dirent: cur }
}

/// Full listing of the directory at `raw_path`: its filesystem entries
/// (when fs-backed) plus the mount-tree children visible at this level.
pub fn list_dir(raw_path: &str) -> KernelResult<Vec<Dirent>> {
    let canonical = path::simplify(raw_path);

    let mut entries = match resolve(&canonical) {
        Resolved::Missing => return Err(KernelError::NotFound),
        Resolved::VirtualDir => Vec::new(),
        Resolved::Entry { fs, dirent } => {
            if dirent.file_type != FileType::Directory {
                return Err(KernelError::NotADirectory);
            }
            fs.read_dir(dirent.ino)?
        }
    };

    // Mount-tree children: the next component of every mount path under
    // this directory.
    let mounts = MOUNTS.lock();
    for m in mounts.iter() {
        if !is_strictly_under(&m.path, &canonical) {
            continue;
        }
        let below = if canonical == "/" {
            &m.path[1..]
        } else {
            &m.path[canonical.len() + 1..]
        };
        let name = below.split('/').next().unwrap_or("");
        if !name.is_empty() && !entries.iter().any(|e| e.name == name) {
            entries.push(directory_dirent(String::from(name), m.fs.root_addr()));
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testfs::TestFs;

    fn fresh() -> Arc<TestFs> {
        // Each test mounts at a unique path to stay independent of the
        // shared global tree.
        Arc::new(TestFs::new(512))
    }

    #[test]
    fn resolve_through_mount() {
        name_cache::init();
        let fs = fresh();
        fs.add_file("hello.txt", b"hi");
        mount(fs.clone(), "/rt1").unwrap();

        match resolve("/rt1/hello.txt") {
            Resolved::Entry { dirent, .. } => {
                assert_eq!(dirent.file_type, FileType::Regular);
                assert_eq!(dirent.file_size, FileSize::Known(2));
            }
            _ => panic!("expected entry"),
        }

        // Second resolution hits the cache.
        assert!(matches!(
            resolve("/rt1//hello.txt/."),
            Resolved::Entry { .. }
        ));

        assert!(matches!(resolve("/rt1/absent"), Resolved::Missing));
        unmount("/rt1").unwrap();
    }

    #[test]
    fn virtual_dirs_come_from_mount_paths() {
        name_cache::init();
        let fs = fresh();
        mount(fs.clone(), "/vd1/deep/mnt").unwrap();

        assert!(matches!(resolve("/vd1"), Resolved::VirtualDir));
        assert!(matches!(resolve("/vd1/deep"), Resolved::VirtualDir));
        // The mount point itself resolves to the fs root.
        assert!(matches!(resolve("/vd1/deep/mnt"), Resolved::Entry { .. }));
        assert!(matches!(resolve("/vd1/other"), Resolved::Missing));

        unmount("/vd1/deep/mnt").unwrap();
        assert!(matches!(resolve("/vd1"), Resolved::Missing));
    }

    #[test]
    fn unmount_refuses_with_submounts() {
        name_cache::init();
        let upper = fresh();
        let lower = fresh();
        mount(upper.clone(), "/um1").unwrap();
        mount(lower.clone(), "/um1/sub").unwrap();

        assert_eq!(unmount("/um1").unwrap_err(), KernelError::WrongState);
        unmount("/um1/sub").unwrap();
        unmount("/um1").unwrap();
    }

    #[test]
    fn unmount_purges_cache_entries() {
        name_cache::init();
        let fs = fresh();
        fs.add_file("f", b"x");
        mount(fs.clone(), "/um2").unwrap();
        assert!(matches!(resolve("/um2/f"), Resolved::Entry { .. }));
        assert!(name_cache::lookup("/um2/f").is_some());

        unmount("/um2").unwrap();
        assert!(name_cache::lookup("/um2/f").is_none());
        assert!(matches!(resolve("/um2/f"), Resolved::Missing));
    }

    #[test]
    fn listing_merges_fs_and_mount_children() {
        name_cache::init();
        let fs = fresh();
        fs.add_file("real", b"1");
        let sub = fresh();
        mount(fs.clone(), "/ls1").unwrap();
        mount(sub.clone(), "/ls1/nested").unwrap();

        let names: Vec<String> = list_dir("/ls1")
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&String::from("real")));
        assert!(names.contains(&String::from("nested")));

        unmount("/ls1/nested").unwrap();
        unmount("/ls1").unwrap();
    }

    #[test]
    fn subdirectory_walk() {
        name_cache::init();
        let fs = fresh();
        let child = Dirent {
            ino: 0, // replaced by add_dir wiring
            file_size: FileSize::Known(3),
            file_type: FileType::Regular,
            rights: Rights::READ,
            name: String::from("inner.txt"),
        };
        let file = fs.add_file("standalone", b"abc");
        let dir = fs.add_dir(
            "docs",
            alloc::vec![Dirent {
                ino: file.ino,
                ..child
            }],
        );
        let _ = dir;
        mount(fs.clone(), "/sd1").unwrap();

        assert!(matches!(
            resolve("/sd1/docs/inner.txt"),
            Resolved::Entry { .. }
        ));
        // A file is not a directory: walking through it fails.
        assert!(matches!(
            resolve("/sd1/standalone/xx"),
            Resolved::Missing
        ));
        unmount("/sd1").unwrap();
    }
}
