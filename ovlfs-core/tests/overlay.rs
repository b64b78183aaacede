//! End-to-end tests against `Overlay<LocalFs>`, covering the concrete
//! scenarios and the quantified properties the engine is built against.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use ovlfs_api::error::BackingError;
use ovlfs_api::flags::OpenFlags;
use ovlfs_api::local::LocalFs;
use ovlfs_api::types::SetAttr;
use ovlfs_core::{MountOptions, Overlay, OverlayError, Registry, ROOT_LINO};

struct Fixture {
    base_path: PathBuf,
    storage_path: PathBuf,
    state_path: PathBuf,
    registry: Registry,
    overlay: Overlay<LocalFs>,
    _base_dir: tempfile::TempDir,
    _storage_dir: tempfile::TempDir,
    _state_dir: tempfile::TempDir,
}

fn mount_over(
    base_path: &std::path::Path,
    storage_path: &std::path::Path,
    state_path: &std::path::Path,
    registry: &Registry,
) -> Overlay<LocalFs> {
    let backing = Arc::new(LocalFs::default());
    let base_root = LocalFs::root_handle(base_path).expect("base root");
    let storage_root = LocalFs::root_handle(storage_path).expect("storage root");
    let options = MountOptions {
        base_root: base_path.to_path_buf(),
        storage: Some(storage_path.to_path_buf()),
        ..Default::default()
    };
    Overlay::mount(options, registry, backing, base_root, storage_root, state_path).expect("mount")
}

fn fresh() -> Fixture {
    let base_dir = tempfile::tempdir().expect("base tempdir");
    let storage_dir = tempfile::tempdir().expect("storage tempdir");
    let state_dir = tempfile::tempdir().expect("state tempdir");
    let state_path = state_dir.path().join("state.log");
    let registry = Registry::new();
    registry.register(Registry::BUILTIN_RECORD_LOG).expect("register");
    let overlay = mount_over(base_dir.path(), storage_dir.path(), &state_path, &registry);
    Fixture {
        base_path: base_dir.path().to_path_buf(),
        storage_path: storage_dir.path().to_path_buf(),
        state_path,
        registry,
        overlay,
        _base_dir: base_dir,
        _storage_dir: storage_dir,
        _state_dir: state_dir,
    }
}

fn storage_is_empty(fx: &Fixture) -> bool {
    fs::read_dir(&fx.storage_path).unwrap().next().is_none()
}

// S1: a read-only base file is visible and readable without touching
// storage at all.
#[test]
fn s1_base_file_is_readable_without_copy_up() {
    let fx = fresh();
    fs::create_dir(fx.base_path.join("a")).unwrap();
    fs::write(fx.base_path.join("a/b.txt"), b"hello").unwrap();

    let a = fx.overlay.lookup(ROOT_LINO, "a").unwrap();
    let b = fx.overlay.lookup(a, "b.txt").unwrap();
    let open = fx.overlay.open(b, OpenFlags::READ).unwrap();
    assert!(open.is_base());
    let data = fx.overlay.read(&open, 0, 5).unwrap();
    assert_eq!(data, b"hello");
    assert!(storage_is_empty(&fx));
}

// S2: writing through a base-side handle copies the file up; the base
// copy is left untouched.
#[test]
fn s2_write_triggers_copy_up_and_preserves_base() {
    let fx = fresh();
    fs::create_dir(fx.base_path.join("a")).unwrap();
    fs::write(fx.base_path.join("a/b.txt"), b"hello").unwrap();

    let a = fx.overlay.lookup(ROOT_LINO, "a").unwrap();
    let b = fx.overlay.lookup(a, "b.txt").unwrap();
    let mut open = fx.overlay.open(b, OpenFlags::READ | OpenFlags::WRITE).unwrap();
    let written = fx.overlay.write(&mut open, 0, b"HELLO").unwrap();
    assert_eq!(written, 5);
    assert!(!open.is_base());

    let stat = fx.overlay.stat(b).unwrap();
    assert_eq!(stat.size, 5);
    assert_eq!(fs::read(fx.storage_path.join("a/b.txt")).unwrap(), b"HELLO");
    assert_eq!(fs::read(fx.base_path.join("a/b.txt")).unwrap(), b"hello");
}

// S3 / property 1: unlinking a base-only file hides it from lookup and
// readdir without removing it from the base tree.
#[test]
fn s3_unlink_hides_base_file_but_leaves_it_on_disk() {
    let fx = fresh();
    fs::write(fx.base_path.join("x"), b"xxx").unwrap();

    fx.overlay.unlink(ROOT_LINO, "x").unwrap();

    let err = fx.overlay.lookup(ROOT_LINO, "x").unwrap_err();
    assert!(err.is_not_found());
    assert!(fx.base_path.join("x").exists());
}

#[test]
fn property1_readdir_omits_tombstoned_entries() {
    let fx = fresh();
    fs::write(fx.base_path.join("keep"), b"1").unwrap();
    fs::write(fx.base_path.join("drop"), b"2").unwrap();

    fx.overlay.unlink(ROOT_LINO, "drop").unwrap();

    let mut names = Vec::new();
    let mut cursor = 0;
    while let Some((name, _lino, next)) = fx.overlay.readdir(ROOT_LINO, cursor).unwrap() {
        names.push(name);
        cursor = next;
    }
    names.sort();
    assert_eq!(names, vec!["keep".to_string()]);
}

// S4 / property 5: create, write, and unmount/remount round-trips the
// observable state, and the resurrected name can be unlinked again.
#[test]
fn s4_create_write_persists_across_remount_then_unlinks_again() {
    let fx = fresh();
    fs::write(fx.base_path.join("x"), b"xxx").unwrap();
    fx.overlay.unlink(ROOT_LINO, "x").unwrap();

    let (_m, mut open) = fx.overlay.create(ROOT_LINO, "x", 0o644).unwrap();
    fx.overlay.write(&mut open, 0, b"y").unwrap();
    assert_eq!(fx.overlay.read(&open, 0, 1).unwrap(), b"y");

    let Fixture {
        base_path,
        storage_path,
        state_path,
        registry,
        overlay,
        _base_dir,
        _storage_dir,
        _state_dir,
    } = fx;
    overlay.unmount(&registry).unwrap();

    let overlay2 = mount_over(&base_path, &storage_path, &state_path, &registry);
    let lino = overlay2.lookup(ROOT_LINO, "x").unwrap();
    let open2 = overlay2.open(lino, OpenFlags::READ).unwrap();
    assert_eq!(overlay2.read(&open2, 0, 1).unwrap(), b"y");

    overlay2.unlink(ROOT_LINO, "x").unwrap();
    assert!(overlay2.lookup(ROOT_LINO, "x").unwrap_err().is_not_found());
    assert!(base_path.join("x").exists());

    drop(_base_dir);
    drop(_storage_dir);
    drop(_state_dir);
}

// Property 2: resurrecting a tombstoned name gets a fresh logical inode,
// relinked rather than plainly positive, with no residual base binding.
#[test]
fn property2_resurrection_preserves_identity_ladder() {
    let fx = fresh();
    fs::write(fx.base_path.join("x"), b"base").unwrap();

    let original = fx.overlay.lookup(ROOT_LINO, "x").unwrap();
    fx.overlay.unlink(ROOT_LINO, "x").unwrap();

    let (resurrected, _open) = fx.overlay.create(ROOT_LINO, "x", 0o644).unwrap();
    assert_ne!(original, resurrected);
    assert!(fx.overlay.dirent_relinked(ROOT_LINO, "x").unwrap());

    let open = fx.overlay.open(resurrected, OpenFlags::READ).unwrap();
    assert!(!open.is_base());
}

// Property 3: a mid-file write during copy-up leaves every byte outside
// the written range untouched and grows the size only as far as needed.
#[test]
fn property3_copy_up_preserves_bytes_outside_the_write() {
    let fx = fresh();
    fs::write(fx.base_path.join("big.txt"), b"0123456789").unwrap();

    let lino = fx.overlay.lookup(ROOT_LINO, "big.txt").unwrap();
    let mut open = fx.overlay.open(lino, OpenFlags::READ | OpenFlags::WRITE).unwrap();
    fx.overlay.write(&mut open, 3, b"XYZ").unwrap();

    let stat = fx.overlay.stat(lino).unwrap();
    assert_eq!(stat.size, 10);
    assert_eq!(fs::read(fx.storage_path.join("big.txt")).unwrap(), b"012XYZ6789");
}

// Property 4: once the logical size exceeds what the backing file holds,
// reads past the backing end return zeros rather than an error or EOF.
#[test]
fn property4_read_past_backing_size_is_zero_filled() {
    let fx = fresh();
    fs::write(fx.base_path.join("small.txt"), b"small").unwrap();

    let lino = fx.overlay.lookup(ROOT_LINO, "small.txt").unwrap();
    fx.overlay
        .setattr(
            lino,
            &SetAttr {
                size: Some(20),
                ..Default::default()
            },
        )
        .unwrap();

    let open = fx.overlay.open(lino, OpenFlags::READ).unwrap();
    assert!(open.is_base());
    let data = fx.overlay.read(&open, 5, 20).unwrap();
    assert_eq!(data.len(), 15);
    assert!(data.iter().all(|&b| b == 0));
}

// S5 / property 6: resolving a storage-side path materializes every
// missing ancestor directory along the way, leaving the base tree alone.
#[test]
fn s5_nested_create_materializes_storage_hierarchy() {
    let fx = fresh();
    fs::create_dir(fx.base_path.join("d")).unwrap();

    let d = fx.overlay.mkdir(ROOT_LINO, "d", 0o755).unwrap();
    let sub = fx.overlay.mkdir(d, "sub", 0o755).unwrap();
    let (_f, mut open) = fx.overlay.create(sub, "f", 0o644).unwrap();
    fx.overlay.write(&mut open, 0, b"k").unwrap();

    assert_eq!(fs::read(fx.storage_path.join("d/sub/f")).unwrap(), b"k");
    assert!(fs::read_dir(fx.base_path.join("d")).unwrap().next().is_none());
}

// Property 7: a second unlink of an already-tombstoned name is rejected,
// and does not further mutate state.
#[test]
fn property7_second_unlink_is_not_found() {
    let fx = fresh();
    fs::write(fx.base_path.join("x"), b"x").unwrap();

    fx.overlay.unlink(ROOT_LINO, "x").unwrap();
    let err = fx.overlay.unlink(ROOT_LINO, "x").unwrap_err();
    assert!(err.is_not_found());
}

// Property 8: rmdir refuses a directory with at least one live entry.
#[test]
fn property8_rmdir_rejects_nonempty_directory() {
    let fx = fresh();
    let d = fx.overlay.mkdir(ROOT_LINO, "d", 0o755).unwrap();
    fx.overlay.create(d, "f", 0o644).unwrap();

    let err = fx.overlay.rmdir(ROOT_LINO, "d").unwrap_err();
    assert!(matches!(err, OverlayError::Backing(BackingError::NotEmpty)));
}

#[test]
fn rmdir_succeeds_once_the_only_entry_is_removed() {
    let fx = fresh();
    let d = fx.overlay.mkdir(ROOT_LINO, "d", 0o755).unwrap();
    fx.overlay.create(d, "f", 0o644).unwrap();
    fx.overlay.unlink(d, "f").unwrap();

    fx.overlay.rmdir(ROOT_LINO, "d").unwrap();
    assert!(fx.overlay.lookup(ROOT_LINO, "d").unwrap_err().is_not_found());
}

// Creating over a name that only the base tree currently holds (never
// looked up through the overlay before) must still report EEXIST rather
// than silently shadowing it.
#[test]
fn create_fails_on_an_undiscovered_base_name() {
    let fx = fresh();
    fs::write(fx.base_path.join("x"), b"base").unwrap();

    let err = fx.overlay.create(ROOT_LINO, "x", 0o644).unwrap_err();
    assert!(matches!(err, OverlayError::Backing(BackingError::Exists)));
}

// Renaming across directories moves the logical entry and drops any
// cached handle, so a later open re-resolves against the new name.
#[test]
fn rename_moves_entry_across_directories() {
    let fx = fresh();
    let (a_lino, _open) = fx.overlay.create(ROOT_LINO, "a", 0o644).unwrap();
    let d = fx.overlay.mkdir(ROOT_LINO, "d", 0o755).unwrap();

    fx.overlay.rename(ROOT_LINO, "a", d, "a2").unwrap();

    assert!(fx.overlay.lookup(ROOT_LINO, "a").unwrap_err().is_not_found());
    let moved = fx.overlay.lookup(d, "a2").unwrap();
    assert_eq!(moved, a_lino);
    assert!(fx.storage_path.join("d/a2").exists());
}
