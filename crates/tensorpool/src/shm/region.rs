// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Mapping and validating ring files.
//!
//! Regions are addressed by URIs of the form
//! `shm:file?path=<absolute path>|require_hugepages=<true|false>`.
//! Paths are canonicalized and checked against the configured allowed
//! roots *before* any file is opened.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, TpError};
use crate::shm::layout::{RegionType, Superblock, LAYOUT_VERSION, SUPERBLOCK_BYTES};

/// Parsed region URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmUri {
    pub path: PathBuf,
    pub require_hugepages: bool,
}

impl ShmUri {
    const SCHEME: &'static str = "shm:file?";

    /// Parse `shm:file?path=...|require_hugepages=...`.
    pub fn parse(uri: &str) -> Result<Self> {
        let params = uri
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| TpError::invalid(format!("unsupported region uri: {uri}")))?;

        let mut path = None;
        let mut require_hugepages = false;
        for part in params.split('|') {
            match part.split_once('=') {
                Some(("path", v)) => path = Some(PathBuf::from(v)),
                Some(("require_hugepages", v)) => {
                    require_hugepages = match v {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(TpError::invalid(format!(
                                "bad require_hugepages value: {other}"
                            )))
                        }
                    }
                }
                _ => return Err(TpError::invalid(format!("bad uri parameter: {part}"))),
            }
        }

        let path = path.ok_or_else(|| TpError::invalid("region uri missing path"))?;
        if !path.is_absolute() {
            return Err(TpError::invalid("region path must be absolute"));
        }
        Ok(Self {
            path,
            require_hugepages,
        })
    }

    /// Format back to the canonical URI string.
    #[must_use]
    pub fn to_uri(&self) -> String {
        format!(
            "shm:file?path={}|require_hugepages={}",
            self.path.display(),
            self.require_hugepages
        )
    }
}

/// Directories a region path may resolve under.
///
/// Empty by default; every configuration supplies at least one. A path
/// outside all roots is rejected before any `open`.
#[derive(Debug, Clone, Default)]
pub struct AllowedRoots {
    roots: Vec<PathBuf>,
}

impl AllowedRoots {
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn push(&mut self, root: PathBuf) {
        self.roots.push(root);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Canonicalize `path` and require it to sit under one of the roots.
    pub fn check(&self, path: &Path) -> Result<PathBuf> {
        let canonical = path
            .canonicalize()
            .map_err(|e| TpError::invalid(format!("cannot resolve {}: {e}", path.display())))?;

        for root in &self.roots {
            let Ok(root) = root.canonicalize() else {
                continue;
            };
            if canonical.starts_with(&root) {
                return Ok(canonical);
            }
        }
        Err(TpError::invalid(format!(
            "path {} outside allowed roots",
            canonical.display()
        )))
    }
}

/// How a region is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Producer and driver: PROT_READ | PROT_WRITE.
    ReadWrite,
    /// Consumers: PROT_READ.
    ReadOnly,
}

/// A mapped ring file. Unmapped on drop; the driver owns the file itself.
pub struct ShmRegion {
    ptr: *mut u8,
    len: usize,
    path: PathBuf,
    mode: AccessMode,
}

// SAFETY: the mapping is shared memory whose concurrent access is mediated
// by the slot seq_commit protocol; the struct itself is just pointer + len.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Map a region file named by `uri`, after the allowed-roots check.
    pub fn open(uri: &ShmUri, roots: &AllowedRoots, mode: AccessMode) -> Result<Self> {
        let path = roots.check(&uri.path)?;
        Self::map(&path, mode)
    }

    fn map(path: &Path, mode: AccessMode) -> Result<Self> {
        let mut bytes = path.as_os_str().as_encoded_bytes().to_vec();
        bytes.push(0);
        let (oflag, prot) = match mode {
            AccessMode::ReadWrite => (libc::O_RDWR, libc::PROT_READ | libc::PROT_WRITE),
            AccessMode::ReadOnly => (libc::O_RDONLY, libc::PROT_READ),
        };

        // SAFETY: bytes is a NUL-terminated path buffer; open reads it and
        // returns a fd or -1 (checked below).
        let fd = unsafe { libc::open(bytes.as_ptr() as *const libc::c_char, oflag) };
        if fd < 0 {
            return Err(TpError::Io(io::Error::last_os_error()));
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is valid from the open above; fstat writes the stat
        // buffer and returns -1 on error (checked below).
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after this error path.
            unsafe { libc::close(fd) };
            return Err(TpError::Io(err));
        }
        // SAFETY: fstat succeeded, so the buffer is initialized.
        let len = unsafe { stat.assume_init() }.st_size as usize;
        if len < SUPERBLOCK_BYTES {
            // SAFETY: fd is valid and not used after this error path.
            unsafe { libc::close(fd) };
            return Err(TpError::invalid(format!(
                "region file {} smaller than superblock",
                path.display()
            )));
        }

        // SAFETY: null hint lets the kernel pick the address; len is the
        // file size from fstat; MAP_SHARED with a valid fd at offset 0 is a
        // well-formed call. MAP_FAILED is checked below.
        let ptr = unsafe {
            libc::mmap(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0)
        };
        // SAFETY: the mapping (if any) holds its own reference; fd is not
        // used again either way.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(TpError::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            path: path.to_path_buf(),
            mode,
        })
    }

    /// Decode and sanity-check the superblock against expectations.
    ///
    /// On any mismatch the attach fails with an Invalid error; callers
    /// translate that into the FALLBACK consumer state.
    pub fn validate_superblock(
        &self,
        region_type: RegionType,
        stream_id: u32,
        epoch: u64,
        pool_id: u16,
        expected_slot_bytes: u32,
    ) -> Result<Superblock> {
        let sb = Superblock::decode(self.as_slice())?;
        if sb.layout_version != LAYOUT_VERSION {
            return Err(TpError::invalid(format!(
                "layout version {} != {LAYOUT_VERSION}",
                sb.layout_version
            )));
        }
        if sb.region_type != region_type {
            return Err(TpError::invalid("region type mismatch"));
        }
        if sb.stream_id != stream_id {
            return Err(TpError::invalid(format!(
                "superblock stream {} != {stream_id}",
                sb.stream_id
            )));
        }
        if sb.epoch != epoch {
            return Err(TpError::invalid(format!(
                "superblock epoch {} != {epoch}",
                sb.epoch
            )));
        }
        if sb.pool_id != pool_id {
            return Err(TpError::invalid(format!(
                "superblock pool {} != {pool_id}",
                sb.pool_id
            )));
        }
        if region_type == RegionType::HeaderRing && sb.slot_bytes != expected_slot_bytes {
            return Err(TpError::invalid(format!(
                "slot bytes {} != {expected_slot_bytes}",
                sb.slot_bytes
            )));
        }
        if sb.nslots == 0 || !sb.nslots.is_power_of_two() {
            return Err(TpError::invalid(format!(
                "nslots {} not a power of two",
                sb.nslots
            )));
        }
        Ok(sb)
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// The whole mapping as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping for the life of &self.
        // Concurrent writers exist, but superblock fields are written once
        // at provisioning time and the slot area is only accessed through
        // SlotView.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Pointer to the slot/payload area past the superblock.
    #[inline]
    #[must_use]
    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: len >= SUPERBLOCK_BYTES was checked at map time.
        unsafe { self.ptr.add(SUPERBLOCK_BYTES) }
    }

    /// Bytes available past the superblock.
    #[inline]
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.len - SUPERBLOCK_BYTES
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and Drop runs once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::layout::HEADER_SLOT_BYTES;
    use std::io::Write;

    fn write_region_file(dir: &Path, name: &str, sb: &Superblock, extra: usize) -> PathBuf {
        let path = dir.join(name);
        let mut buf = vec![0u8; SUPERBLOCK_BYTES + extra];
        sb.encode(&mut buf).expect("encode failed");
        let mut f = std::fs::File::create(&path).expect("create failed");
        f.write_all(&buf).expect("write failed");
        path
    }

    fn header_sb() -> Superblock {
        Superblock {
            layout_version: LAYOUT_VERSION,
            region_type: RegionType::HeaderRing,
            stream_id: 7,
            pool_id: 0,
            epoch: 42,
            nslots: 4,
            slot_bytes: HEADER_SLOT_BYTES as u32,
            stride_bytes: 0,
            producer_pid: 1,
            start_timestamp_ns: 0,
            last_activity_ns: 0,
        }
    }

    #[test]
    fn test_uri_round_trip() {
        let uri = ShmUri::parse("shm:file?path=/dev/shm/tp/h.ring|require_hugepages=false")
            .expect("parse failed");
        assert_eq!(uri.path, PathBuf::from("/dev/shm/tp/h.ring"));
        assert!(!uri.require_hugepages);
        assert_eq!(
            uri.to_uri(),
            "shm:file?path=/dev/shm/tp/h.ring|require_hugepages=false"
        );
    }

    #[test]
    fn test_uri_rejects_relative_and_garbage() {
        assert!(ShmUri::parse("shm:file?path=relative/x|require_hugepages=false").is_err());
        assert!(ShmUri::parse("file:///x").is_err());
        assert!(ShmUri::parse("shm:file?path=/x|require_hugepages=maybe").is_err());
        assert!(ShmUri::parse("shm:file?bogus=1").is_err());
    }

    #[test]
    fn test_allowed_roots_blocks_outside_paths() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let other = tempfile::tempdir().expect("tempdir failed");
        let path = write_region_file(dir.path(), "h.ring", &header_sb(), 4 * HEADER_SLOT_BYTES);

        let roots = AllowedRoots::new(vec![dir.path().to_path_buf()]);
        assert!(roots.check(&path).is_ok());

        let outside = write_region_file(other.path(), "h.ring", &header_sb(), 0);
        assert!(roots.check(&outside).is_err());

        // Empty roots reject everything.
        assert!(AllowedRoots::default().check(&path).is_err());
    }

    #[test]
    fn test_open_and_validate() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = write_region_file(dir.path(), "h.ring", &header_sb(), 4 * HEADER_SLOT_BYTES);
        let roots = AllowedRoots::new(vec![dir.path().to_path_buf()]);
        let uri = ShmUri {
            path,
            require_hugepages: false,
        };

        let region = ShmRegion::open(&uri, &roots, AccessMode::ReadOnly).expect("open failed");
        let sb = region
            .validate_superblock(RegionType::HeaderRing, 7, 42, 0, HEADER_SLOT_BYTES as u32)
            .expect("validate failed");
        assert_eq!(sb.nslots, 4);
        assert_eq!(region.data_len(), 4 * HEADER_SLOT_BYTES);
    }

    #[test]
    fn test_validate_rejects_wrong_epoch_and_stream() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = write_region_file(dir.path(), "h.ring", &header_sb(), 4 * HEADER_SLOT_BYTES);
        let roots = AllowedRoots::new(vec![dir.path().to_path_buf()]);
        let uri = ShmUri {
            path,
            require_hugepages: false,
        };
        let region = ShmRegion::open(&uri, &roots, AccessMode::ReadOnly).expect("open failed");

        assert!(region
            .validate_superblock(RegionType::HeaderRing, 7, 43, 0, HEADER_SLOT_BYTES as u32)
            .is_err());
        assert!(region
            .validate_superblock(RegionType::HeaderRing, 8, 42, 0, HEADER_SLOT_BYTES as u32)
            .is_err());
        assert!(region
            .validate_superblock(RegionType::PayloadPool, 7, 42, 0, HEADER_SLOT_BYTES as u32)
            .is_err());
    }

    #[test]
    fn test_open_truncated_file_rejected() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("short.ring");
        std::fs::write(&path, b"tiny").expect("write failed");
        let roots = AllowedRoots::new(vec![dir.path().to_path_buf()]);
        let uri = ShmUri {
            path,
            require_hugepages: false,
        };
        assert!(ShmRegion::open(&uri, &roots, AccessMode::ReadOnly).is_err());
    }
}
