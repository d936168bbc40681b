//! In-process tar.gz handling.
//!
//! Archives are written deterministically: entries in sorted order, owner
//! 0:0, modes and mtimes taken from the source tree.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;
use walkdir::WalkDir;

/// Totals for an unpacked or packed tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    /// Sum of regular file sizes.
    pub bytes: u64,
}

/// Unpack a `.tar.gz` into `dest`, keeping permission bits.
pub fn unpack_tar_gz(archive: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let file = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.unpack(dest)
}

/// Names of the entries of a `.tar.gz`, in archive order.
pub fn list_tar_gz(archive: &Path) -> io::Result<Vec<String>> {
    let file = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

fn header(kind: EntryType, meta: &fs::Metadata, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(meta.permissions().mode() & 0o7777);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(meta.mtime().max(0) as u64);
    header
}

/// Pack the contents of `src` (not `src` itself) into `dest` as `.tar.gz`.
pub fn pack_tree(src: &Path, dest: &Path) -> io::Result<TreeStats> {
    let out = BufWriter::new(File::create(dest)?);
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
    builder.follow_symlinks(false);
    let mut stats = TreeStats::default();

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name().follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let mut header = header(EntryType::Symlink, &meta, 0);
            builder.append_link(&mut header, rel, &target)?;
            stats.symlinks += 1;
        } else if file_type.is_dir() {
            let mut header = header(EntryType::Directory, &meta, 0);
            builder.append_data(&mut header, rel, io::empty())?;
            stats.dirs += 1;
        } else if file_type.is_file() {
            let mut header = header(EntryType::Regular, &meta, meta.len());
            builder.append_data(&mut header, rel, File::open(entry.path())?)?;
            stats.files += 1;
            stats.bytes += meta.len();
        } else {
            debug!("skipping special file {}", entry.path().display());
        }
    }

    builder.into_inner()?.finish()?.into_inner().map_err(|e| e.into_error())?;
    Ok(stats)
}

/// Write a `.tar.gz` holding exactly `members` (files in `dir`), in order.
pub fn pack_members(dir: &Path, members: &[&str], dest: &Path) -> io::Result<()> {
    let out = BufWriter::new(File::create(dest)?);
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
    for name in members {
        let path = dir.join(name);
        let meta = fs::metadata(&path)?;
        let mut header = header(EntryType::Regular, &meta, meta.len());
        builder.append_data(&mut header, name, File::open(&path)?)?;
    }
    builder.into_inner()?.finish()?.into_inner().map_err(|e| e.into_error())?;
    Ok(())
}

/// Count files, directories and symlinks under `root`.
pub fn tree_stats(root: &Path) -> io::Result<TreeStats> {
    let mut stats = TreeStats::default();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            stats.symlinks += 1;
        } else if file_type.is_dir() {
            stats.dirs += 1;
        } else if file_type.is_file() {
            stats.files += 1;
            stats.bytes += entry.metadata().map_err(io::Error::other)?.len();
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_pack_is_deterministic_and_unpacks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("bin/busybox"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(src.join("bin/busybox"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("/bin/busybox", src.join("bin/sh")).unwrap();
        fs::write(src.join("etc/os-release"), "ID=alpine\n").unwrap();

        let a = temp.path().join("a.tar.gz");
        let b = temp.path().join("b.tar.gz");
        let stats = pack_tree(&src, &a).unwrap();
        pack_tree(&src, &b).unwrap();
        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
        assert_eq!(stats.files, 2);
        assert_eq!(stats.symlinks, 1);
        assert_eq!(stats.dirs, 2);

        let names = list_tar_gz(&a).unwrap();
        assert_eq!(names[0].trim_end_matches('/'), "bin");

        let out = temp.path().join("out");
        unpack_tar_gz(&a, &out).unwrap();
        assert_eq!(fs::read_link(out.join("bin/sh")).unwrap(), Path::new("/bin/busybox"));
        let mode = fs::metadata(out.join("bin/busybox")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(tree_stats(&out).unwrap(), stats);
    }

    #[test]
    fn test_pack_members_keeps_order() {
        let temp = TempDir::new().unwrap();
        for name in ["b.txt", "a.txt"] {
            fs::write(temp.path().join(name), name).unwrap();
        }
        let dest = temp.path().join("out.tar.gz");
        pack_members(temp.path(), &["b.txt", "a.txt"], &dest).unwrap();
        assert_eq!(list_tar_gz(&dest).unwrap(), vec!["b.txt", "a.txt"]);
    }
}
