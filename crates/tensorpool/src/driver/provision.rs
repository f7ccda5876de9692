// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Ring-file provisioning and epoch garbage collection.
//!
//! Files live under `<base>/tensorpool-<uid>/<namespace>/<stream>/<epoch>/`
//! as `header.ring` and `<pool_id>.pool`. Directories are created with the
//! configured mode plus execute bits; files get the mode as-is. Hugepages
//! mode is policed against the base directory's filesystem type.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::codec::PoolDescriptor;
use crate::config::{DriverConfig, StreamProfile};
use crate::error::{Result, TpError};
use crate::shm::{
    RegionType, ShmUri, Superblock, HEADER_SLOT_BYTES, LAYOUT_VERSION, SUPERBLOCK_BYTES,
};

const HUGETLBFS_MAGIC: i64 = 0x958458f6;

/// Whether `path` sits on a hugetlbfs mount.
pub fn is_hugepages_dir(path: &Path) -> Result<bool> {
    let mut bytes = path.as_os_str().as_encoded_bytes().to_vec();
    bytes.push(0);
    let mut stat = std::mem::MaybeUninit::<libc::statfs>::uninit();
    // SAFETY: bytes is a NUL-terminated path and stat is a writable buffer;
    // statfs only writes through the pointer.
    let rc = unsafe { libc::statfs(bytes.as_ptr() as *const libc::c_char, stat.as_mut_ptr()) };
    if rc < 0 {
        return Err(TpError::Io(io::Error::last_os_error()));
    }
    // SAFETY: statfs succeeded, so the buffer is initialized.
    let stat = unsafe { stat.assume_init() };
    Ok(stat.f_type as i64 == HUGETLBFS_MAGIC)
}

/// Strip anything that could escape the directory tree.
fn sanitize_component(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Validate a namespace before it becomes a path component.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.len() > 64 {
        return Err(TpError::invalid("namespace must be 1..=64 characters"));
    }
    if !namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TpError::invalid(format!(
            "namespace {namespace:?} has characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// `<base>/tensorpool-<uid>/<namespace>/<stream>`.
#[must_use]
pub fn stream_dir(config: &DriverConfig, stream_id: u32) -> PathBuf {
    // SAFETY: geteuid cannot fail and takes no pointers.
    let uid = unsafe { libc::geteuid() };
    config
        .shm_base_dir
        .join(format!("tensorpool-{uid}"))
        .join(sanitize_component(&config.shm_namespace))
        .join(stream_id.to_string())
}

/// A freshly provisioned epoch directory.
#[derive(Debug, Clone)]
pub struct ProvisionedEpoch {
    pub epoch_dir: PathBuf,
    pub header_uri: String,
    pub header_nslots: u32,
    pub pools: Vec<PoolDescriptor>,
}

fn dir_mode(file_mode: u32) -> u32 {
    // Directories add execute bits wherever the file mode grants read.
    let mut mode = file_mode;
    if mode & 0o400 != 0 {
        mode |= 0o100;
    }
    if mode & 0o040 != 0 {
        mode |= 0o010;
    }
    if mode & 0o004 != 0 {
        mode |= 0o001;
    }
    mode
}

fn create_region_file(
    path: &Path,
    file_mode: u32,
    superblock: &Superblock,
    body_bytes: usize,
    prefault: bool,
    mlock: bool,
) -> Result<()> {
    let total = SUPERBLOCK_BYTES + body_bytes;
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .mode(file_mode)
        .open(path)?;
    // Re-apply the mode: open() honors the umask, the configuration wins.
    file.set_permissions(fs::Permissions::from_mode(file_mode))?;
    file.set_len(total as u64)?;

    let mut head = vec![0u8; SUPERBLOCK_BYTES];
    superblock.encode(&mut head)?;
    {
        let mut f = &file;
        f.write_all(&head)?;
    }

    if prefault || mlock {
        prefault_file(&file, total, mlock)?;
    }

    file.sync_all()?;
    Ok(())
}

fn prefault_file(file: &fs::File, len: usize, mlock: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: fd is a live, read-write file of `len` bytes; MAP_SHARED at
    // offset 0 is well-formed and MAP_FAILED is checked below.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(TpError::Io(io::Error::last_os_error()));
    }

    let page = 4096;
    let mut offset = 0usize;
    while offset < len {
        // SAFETY: offset < len, so the write is inside the mapping. The
        // read-modify-write touches each page to fault it in.
        unsafe {
            let p = (ptr as *mut u8).add(offset);
            p.write_volatile(p.read_volatile());
        }
        offset += page;
    }

    if mlock {
        // SAFETY: ptr/len describe the live mapping created above.
        let rc = unsafe { libc::mlock(ptr, len) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: unmapping the region created above.
            unsafe { libc::munmap(ptr, len) };
            return Err(TpError::Io(err));
        }
    }

    // SAFETY: unmapping the region created above; pages stay resident in
    // the page cache for the real consumers to map.
    unsafe { libc::munmap(ptr, len) };
    Ok(())
}

/// Create `header.ring` and every `<pool_id>.pool` for one epoch.
pub fn create_epoch(
    config: &DriverConfig,
    profile: &StreamProfile,
    stream_id: u32,
    epoch: u64,
    require_hugepages: bool,
    now_realtime_ns: u64,
) -> Result<ProvisionedEpoch> {
    validate_namespace(&config.shm_namespace)?;
    if !profile.header_nslots.is_power_of_two() {
        return Err(TpError::invalid(format!(
            "profile {} header_nslots {} not a power of two",
            profile.name, profile.header_nslots
        )));
    }

    let base_is_huge = is_hugepages_dir(&config.shm_base_dir)?;
    if require_hugepages && !base_is_huge {
        return Err(TpError::Rejected("hugepages not available".to_string()));
    }
    if !require_hugepages && base_is_huge {
        return Err(TpError::Rejected(
            "base directory is hugetlbfs but standard pages requested".to_string(),
        ));
    }

    let epoch_dir = stream_dir(config, stream_id).join(epoch.to_string());
    fs::DirBuilder::new()
        .recursive(true)
        .mode(dir_mode(config.permissions_mode))
        .create(&epoch_dir)?;

    let nslots = profile.header_nslots;
    // SAFETY: getpid cannot fail and takes no pointers.
    let pid = unsafe { libc::getpid() } as u64;

    let header_path = epoch_dir.join("header.ring");
    create_region_file(
        &header_path,
        config.permissions_mode,
        &Superblock {
            layout_version: LAYOUT_VERSION,
            region_type: RegionType::HeaderRing,
            stream_id,
            pool_id: 0,
            epoch,
            nslots,
            slot_bytes: HEADER_SLOT_BYTES as u32,
            stride_bytes: 0,
            producer_pid: pid,
            start_timestamp_ns: now_realtime_ns,
            last_activity_ns: now_realtime_ns,
        },
        nslots as usize * HEADER_SLOT_BYTES,
        config.prefault_shm,
        config.mlock_shm,
    )?;

    let mut pools = Vec::with_capacity(profile.pools.len());
    for pool in &profile.pools {
        let pool_path = epoch_dir.join(format!("{}.pool", pool.pool_id));
        create_region_file(
            &pool_path,
            config.permissions_mode,
            &Superblock {
                layout_version: LAYOUT_VERSION,
                region_type: RegionType::PayloadPool,
                stream_id,
                pool_id: pool.pool_id,
                epoch,
                nslots,
                slot_bytes: HEADER_SLOT_BYTES as u32,
                stride_bytes: pool.stride_bytes,
                producer_pid: pid,
                start_timestamp_ns: now_realtime_ns,
                last_activity_ns: now_realtime_ns,
            },
            nslots as usize * pool.stride_bytes as usize,
            config.prefault_shm,
            config.mlock_shm,
        )?;
        pools.push(PoolDescriptor {
            pool_id: pool.pool_id,
            stride_bytes: pool.stride_bytes,
            nslots,
            uri: ShmUri {
                path: pool_path,
                require_hugepages,
            }
            .to_uri(),
        });
    }

    log::info!(
        "[driver] provisioned stream {} epoch {} at {}",
        stream_id,
        epoch,
        epoch_dir.display()
    );

    Ok(ProvisionedEpoch {
        epoch_dir,
        header_uri: ShmUri {
            path: header_path,
            require_hugepages,
        }
        .to_uri(),
        header_nslots: nslots,
        pools,
    })
}

/// Remove old epoch directories for one stream: keep the newest `keep`,
/// and of the rest only remove those whose mtime is older than
/// `min_age_ns`. Returns the number removed.
pub fn gc_stream(
    config: &DriverConfig,
    stream_id: u32,
    now_realtime_ns: u64,
) -> Result<usize> {
    if !config.epoch_gc.enabled {
        return Ok(0);
    }

    let dir = stream_dir(config, stream_id);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(TpError::Io(e)),
    };

    let mut epochs: Vec<(u64, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let epoch: u64 = name.to_str()?.parse().ok()?;
            entry.path().is_dir().then_some((epoch, entry.path()))
        })
        .collect();
    epochs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (epoch, path) in epochs.into_iter().skip(config.epoch_gc.keep) {
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as u64);
        if now_realtime_ns.saturating_sub(mtime_ns) < config.epoch_gc.min_age_ns {
            continue;
        }
        if fs::remove_dir_all(&path).is_ok() {
            log::debug!("[driver] gc removed stream {stream_id} epoch {epoch}");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base: &Path) -> DriverConfig {
        DriverConfig {
            shm_base_dir: base.to_path_buf(),
            ..DriverConfig::default()
        }
    }

    #[test]
    fn test_namespace_validation() {
        assert!(validate_namespace("lab-1").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("a/b").is_err());
        assert!(validate_namespace("..").is_err());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("../etc"), "___etc");
        assert_eq!(sanitize_component("ok-name_2"), "ok-name_2");
        assert_eq!(sanitize_component(""), "_");
    }

    #[test]
    fn test_dir_mode_adds_execute() {
        assert_eq!(dir_mode(0o600), 0o700);
        assert_eq!(dir_mode(0o640), 0o750);
        assert_eq!(dir_mode(0o644), 0o755);
    }

    #[test]
    fn test_create_epoch_writes_regions() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let config = test_config(dir.path());
        let profile = &config.profiles[0];

        let provisioned =
            create_epoch(&config, profile, 10_000, 7, false, 1_000).expect("provision failed");

        assert!(provisioned.epoch_dir.ends_with("10000/7"));
        let header_uri = ShmUri::parse(&provisioned.header_uri).expect("uri parse failed");
        let header_len = fs::metadata(&header_uri.path).expect("stat failed").len();
        assert_eq!(
            header_len,
            (SUPERBLOCK_BYTES + profile.header_nslots as usize * HEADER_SLOT_BYTES) as u64
        );

        let head = fs::read(&header_uri.path).expect("read failed");
        let sb = Superblock::decode(&head).expect("superblock decode failed");
        assert_eq!(sb.stream_id, 10_000);
        assert_eq!(sb.epoch, 7);
        assert_eq!(sb.region_type, RegionType::HeaderRing);

        assert_eq!(provisioned.pools.len(), 1);
        let pool_uri = ShmUri::parse(&provisioned.pools[0].uri).expect("uri parse failed");
        assert!(pool_uri.path.exists());
    }

    #[test]
    fn test_gc_keeps_newest() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let mut config = test_config(dir.path());
        config.epoch_gc.enabled = true;
        config.epoch_gc.keep = 1;
        config.epoch_gc.min_age_ns = 0;
        let profile = config.profiles[0].clone();

        for epoch in [1u64, 2, 3] {
            create_epoch(&config, &profile, 10_000, epoch, false, 0).expect("provision failed");
        }

        let removed = gc_stream(&config, 10_000, u64::MAX / 2).expect("gc failed");
        assert_eq!(removed, 2);
        let dir = stream_dir(&config, 10_000);
        assert!(!dir.join("1").exists());
        assert!(!dir.join("2").exists());
        assert!(dir.join("3").exists());
    }

    #[test]
    fn test_gc_respects_min_age() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let mut config = test_config(dir.path());
        config.epoch_gc.enabled = true;
        config.epoch_gc.keep = 0;
        config.epoch_gc.min_age_ns = u64::MAX;
        let profile = config.profiles[0].clone();
        create_epoch(&config, &profile, 10_000, 1, false, 0).expect("provision failed");

        // Everything is younger than min_age; nothing goes.
        assert_eq!(gc_stream(&config, 10_000, 0).expect("gc failed"), 0);
    }

    #[test]
    fn test_hugepages_rejected_on_regular_fs() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let config = test_config(dir.path());
        let profile = &config.profiles[0];
        match create_epoch(&config, profile, 1, 1, true, 0) {
            Err(TpError::Rejected(_)) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
