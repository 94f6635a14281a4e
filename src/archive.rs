//! Content-addressed extraction of a compressed root-filesystem tarball.
//!
//! Hashing and extraction are streaming: neither requires seeking on the
//! decompressed byte stream, so a `.tar.zst` produced by piping `docker
//! export` straight into `zstd` can be consumed without buffering it whole.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::ArchiveError;

static HASH_CACHE: Mutex<Option<HashMap<PathBuf, String>>> = Mutex::new(None);

fn cache_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    home.join(".cache").join("sandkit").join("rootfs")
}

/// SHA-256 over the archive's compressed bytes, memoized per process and
/// keyed by the archive path. A pure performance optimization: correctness
/// of `prepare` never depends on the cache being hit.
fn tarball_hash(archive_path: &Path) -> Result<String, ArchiveError> {
    {
        let guard = HASH_CACHE.lock().unwrap();
        if let Some(hit) = guard.as_ref().and_then(|m| m.get(archive_path)) {
            return Ok(hit.clone());
        }
    }

    let file = fs::File::open(archive_path)
        .map_err(|_| ArchiveError::ArchiveNotFound(archive_path.to_path_buf()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = format!("{:x}", hasher.finalize());

    let mut guard = HASH_CACHE.lock().unwrap();
    guard
        .get_or_insert_with(HashMap::new)
        .insert(archive_path.to_path_buf(), digest.clone());
    Ok(digest)
}

enum Codec {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Plain,
}

fn detect_codec(archive_path: &Path) -> Result<Codec, ArchiveError> {
    let name = archive_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if name.ends_with(".tar.zst") || name.ends_with(".zst") {
        Ok(Codec::Zstd)
    } else if name.ends_with(".tgz") || name.ends_with(".tar.gz") || name.ends_with(".gz") {
        Ok(Codec::Gzip)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".bz2") {
        Ok(Codec::Bzip2)
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") || name.ends_with(".xz") {
        Ok(Codec::Xz)
    } else if name.ends_with(".tar") {
        Ok(Codec::Plain)
    } else {
        Err(ArchiveError::UnknownCodec(name.to_string()))
    }
}

fn open_archive(archive_path: &Path) -> Result<tar::Archive<Box<dyn Read>>, ArchiveError> {
    let file = fs::File::open(archive_path)
        .map_err(|_| ArchiveError::ArchiveNotFound(archive_path.to_path_buf()))?;
    let reader = BufReader::new(file);
    let decoder: Box<dyn Read> = match detect_codec(archive_path)? {
        Codec::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Codec::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        Codec::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        Codec::Zstd => Box::new(
            zstd::stream::read::Decoder::new(reader)
                .map_err(|e| ArchiveError::DecompressionFailed(e.to_string()))?,
        ),
        Codec::Plain => Box::new(reader),
    };
    Ok(tar::Archive::new(decoder))
}

/// Rejects absolute paths, `..` components, and (for links) absolute or
/// `..`-containing link targets. Mirrors the single-pass streaming check the
/// original implementation performs so it stays compatible with non-seekable
/// decompressed streams.
fn reject_unsafe_member(path: &Path, link_target: Option<&Path>) -> Result<(), ArchiveError> {
    let is_unsafe = |p: &Path| p.is_absolute() || p.components().any(|c| c.as_os_str() == "..");
    if is_unsafe(path) {
        return Err(ArchiveError::UnsafeMember(path.display().to_string()));
    }
    if let Some(target) = link_target {
        if is_unsafe(target) {
            return Err(ArchiveError::UnsafeMember(format!(
                "{} -> {}",
                path.display(),
                target.display()
            )));
        }
    }
    Ok(())
}

fn extract_into(archive: &mut tar::Archive<Box<dyn Read>>, dest: &Path) -> Result<(), ArchiveError> {
    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let path = entry.path()?.to_path_buf();
        let link_target = entry.link_name()?.map(|l| l.to_path_buf());
        reject_unsafe_member(&path, link_target.as_deref())?;
        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// The archive store: content-addressed extraction with safe-path
/// enforcement and a process-wide memoized hash cache.
pub struct ArchiveStore;

impl ArchiveStore {
    /// Extracts `archive_path` into `target_path` if given, otherwise into
    /// `<cache_root>/<sha256-hex>`, skipping extraction when that directory
    /// already exists. Concurrent callers extracting the same hash converge
    /// on one valid tree via atomic rename of a temporary sibling.
    pub fn prepare(
        archive_path: &Path,
        target_path: Option<&Path>,
    ) -> Result<PathBuf, ArchiveError> {
        if !archive_path.exists() {
            return Err(ArchiveError::ArchiveNotFound(archive_path.to_path_buf()));
        }

        let dest = match target_path {
            Some(p) => p.to_path_buf(),
            None => {
                let hash = tarball_hash(archive_path)?;
                cache_dir().join(hash)
            }
        };

        if dest.exists() {
            return Ok(dest);
        }

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let staging = parent.join(format!(
            ".{}.partial-{}",
            dest.file_name().and_then(|s| s.to_str()).unwrap_or("rootfs"),
            std::process::id()
        ));
        fs::create_dir_all(&staging)?;

        let result = (|| -> Result<(), ArchiveError> {
            let mut archive = open_archive(archive_path)?;
            extract_into(&mut archive, &staging)
        })();

        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }

        match fs::rename(&staging, &dest) {
            Ok(()) => Ok(dest),
            Err(_) if dest.exists() => {
                // Another process won the race; ours is redundant.
                let _ = fs::remove_dir_all(&staging);
                Ok(dest)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e.into())
            }
        }
    }

    /// Removes the per-user cache root entirely.
    pub fn clear_cache() -> Result<(), ArchiveError> {
        let dir = cache_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tarball(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn prepare_is_idempotent_and_content_addressed() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("rootfs.tar.gz");
        write_tarball(&archive_path, &[("hello.txt", b"hi\n")]);

        let out1 = ArchiveStore::prepare(&archive_path, Some(&tmp.path().join("out"))).unwrap();
        assert!(out1.join("hello.txt").exists());

        // second call with the same explicit target is a cache hit (directory exists)
        let out2 = ArchiveStore::prepare(&archive_path, Some(&tmp.path().join("out"))).unwrap();
        assert_eq!(out1, out2);
    }

    #[test]
    fn rejects_unsafe_members_and_leaves_no_partial_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("evil.tar.gz");
        write_tarball(&archive_path, &[("../etc/passwd", b"root:x:0:0\n")]);

        let dest = tmp.path().join("out");
        let err = ArchiveStore::prepare(&archive_path, Some(&dest)).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafeMember(_)));
        assert!(!dest.exists());
        // no stray .partial- directories either
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".out.partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn rejects_absolute_member_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("abs.tar.gz");
        write_tarball(&archive_path, &[("/etc/shadow", b"x\n")]);

        let dest = tmp.path().join("out");
        let err = ArchiveStore::prepare(&archive_path, Some(&dest)).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafeMember(_)));
    }

    #[test]
    fn unknown_codec_suffix_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("rootfs.rar");
        fs::write(&archive_path, b"not a tarball").unwrap();

        let err = ArchiveStore::prepare(&archive_path, Some(&tmp.path().join("out"))).unwrap_err();
        assert!(matches!(err, ArchiveError::UnknownCodec(_)));
    }
}
