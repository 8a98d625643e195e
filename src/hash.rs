use memmap2::Mmap;
use nix::errno::Errno;
use std::{fmt, fs, fs::File, os::unix::ffi::OsStrExt, path::Path};

use crate::diag::{Error, Result};

const M: u64 = 0xc6a4_a793_5bd1_e995;
const R: u32 = 47;
const SEED: u64 = 0;

/// 64-bit content digest (`MurmurHash64A`, seed 0).
///
/// Collisions are an accepted risk: the digest only decides whether a
/// cached trace is still usable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Digest(u64);

impl Digest {
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[must_use]
/// Hash an in-memory byte slice.
///
/// # Arguments
///
/// * `bytes` - The data to digest.
///
/// # Returns
///
/// The digest of `bytes`. Identical inputs always produce identical digests.
pub fn data(bytes: &[u8]) -> Digest {
    let mut h = SEED ^ (bytes.len() as u64).wrapping_mul(M);

    let mut blocks = bytes.chunks_exact(8);
    for block in blocks.by_ref() {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(block);
        let mut k = u64::from_le_bytes(buf);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        for (i, byte) in tail.iter().enumerate().rev() {
            h ^= u64::from(*byte) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    Digest(h)
}

/// Hash the contents of a regular file through a read-only memory map.
///
/// # Arguments
///
/// * `path` - Path of the file to digest.
///
/// # Errors
///
/// Returns an error carrying the errno of the failing `open`/`fstat`/`mmap`,
/// or `EISDIR` if `path` names a directory.
///
/// # Returns
///
/// The digest of the file bytes. An empty file hashes like an empty slice.
pub fn file(path: &Path) -> Result<Digest> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if metadata.is_dir() {
        return Err(Error::from(Errno::EISDIR));
    }
    if metadata.len() == 0 {
        return Ok(data(&[]));
    }

    // SAFETY: the mapping is read-only and dropped before returning. A
    // concurrent writer can only change the digest, which validation
    // already treats as "changed".
    let map = unsafe { Mmap::map(&file) }?;
    Ok(data(&map))
}

/// Hash the listing of a directory: entry names, sorted, NUL-terminated.
///
/// # Errors
///
/// Returns an error carrying the errno of the failing `opendir`/`readdir`.
pub fn directory(path: &Path) -> Result<Digest> {
    let mut names = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<std::io::Result<Vec<_>>>()?;
    names.sort();

    let mut listing = Vec::new();
    for name in &names {
        listing.extend_from_slice(name.as_bytes());
        listing.push(0);
    }
    Ok(data(&listing))
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_known_vectors() {
        assert_eq!(data(b""), Digest(0));
        assert_eq!(data(b"hello"), Digest(0x1e68_d17c_457b_f117));
        assert_eq!(data(b"hello world, murmur"), Digest(0x822e_d47f_4166_e3a4));
    }

    #[test]
    fn test_display() {
        assert_eq!(Digest(0xab).to_string(), "00000000000000ab");
    }

    #[test]
    fn test_file_matches_data() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"hello").expect("write");
        assert_eq!(file_digest(file.path()), data(b"hello"));
    }

    #[test]
    fn test_empty_file() {
        let file = NamedTempFile::new().expect("temp file");
        assert_eq!(file_digest(file.path()), data(&[]));
    }

    #[test]
    fn test_file_errors() {
        let dir = tempdir().expect("temp dir");
        let err = file(dir.path()).expect_err("directory");
        assert_eq!(err.errno(), Some(libc::EISDIR));

        let err = file(&dir.path().join("missing")).expect_err("missing");
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_directory_listing() {
        let dir = tempdir().expect("temp dir");
        let before = directory(dir.path()).expect("listing");
        assert_eq!(before, data(&[]));

        fs::write(dir.path().join("b"), "").expect("write");
        fs::write(dir.path().join("a"), "").expect("write");
        assert_eq!(directory(dir.path()).expect("listing"), data(b"a\0b\0"));
    }

    fn file_digest(path: &Path) -> Digest {
        file(path).expect("hash file")
    }

    proptest! {
        #[test]
        fn prop_deterministic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(data(&bytes), data(&bytes.clone()));
        }

        #[test]
        fn prop_file_equals_data(bytes in proptest::collection::vec(any::<u8>(), 1..256)) {
            let mut file = NamedTempFile::new().expect("temp file");
            file.write_all(&bytes).expect("write");
            prop_assert_eq!(file_digest(file.path()), data(&bytes));
        }
    }
}
