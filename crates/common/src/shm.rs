//! Named POSIX shared-memory segments.
//!
//! The broker creates segments and unlinks them when it shuts down; clients
//! only ever attach. A segment that outlives a crashed broker is simply
//! unlinked and recreated by the next owner.

use crate::error::{Error, Result};
use memmap2::{MmapOptions, MmapRaw};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;

/// A mapped named shared-memory segment.
#[derive(Debug)]
pub struct SharedSegment {
    map: MmapRaw,
    name: String,
    unlink_on_drop: bool,
}

// The mapping is a raw region of process-shared memory; all concurrent
// access goes through atomics inside it.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a fresh segment of `len` bytes, replacing any stale one left
    /// behind by a dead owner. The new mapping is zero-filled.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let shm_name = shm_path(name);
        // A previous owner may have crashed without unlinking.
        let _ = shm_unlink(shm_name.as_str());
        let fd = shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )?;
        let file = File::from(fd);
        file.set_len(len as u64)?;
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        Ok(Self {
            map,
            name: name.to_string(),
            unlink_on_drop: true,
        })
    }

    /// Create the segment if it does not exist, otherwise attach to the
    /// existing one. Returns whether this call created it.
    pub fn create_or_attach(name: &str, len: usize) -> Result<(Self, bool)> {
        let shm_name = shm_path(name);
        match shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        ) {
            Ok(fd) => {
                let file = File::from(fd);
                file.set_len(len as u64)?;
                let map = MmapOptions::new().len(len).map_raw(&file)?;
                Ok((
                    Self {
                        map,
                        name: name.to_string(),
                        unlink_on_drop: true,
                    },
                    true,
                ))
            }
            Err(nix::errno::Errno::EEXIST) => {
                let mut seg = Self::attach(name, len)?;
                // Whoever created it owns the unlink.
                seg.unlink_on_drop = false;
                Ok((seg, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attach to an existing segment. Fails with [`Error::SegmentMissing`]
    /// until the owner has created it.
    pub fn attach(name: &str, min_len: usize) -> Result<Self> {
        let shm_name = shm_path(name);
        let fd = match shm_open(shm_name.as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::ENOENT) => {
                return Err(Error::SegmentMissing(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        if len < min_len {
            return Err(Error::SegmentTruncated {
                name: name.to_string(),
                len,
                expected: min_len,
            });
        }
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        Ok(Self {
            map,
            name: name.to_string(),
            unlink_on_drop: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.unlink_on_drop {
            let _ = shm_unlink(shm_path(&self.name).as_str());
        }
    }
}

fn shm_path(name: &str) -> String {
    format!("/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("wsmux_shm_test_{tag}_{}", std::process::id())
    }

    #[test]
    fn create_then_attach_shares_bytes() {
        let name = unique("share");
        let owner = SharedSegment::create(&name, 4096).unwrap();
        let peer = SharedSegment::attach(&name, 4096).unwrap();
        unsafe {
            owner.as_ptr().write(0xAB);
            assert_eq!(peer.as_ptr().read(), 0xAB);
        }
    }

    #[test]
    fn attach_missing_segment_fails() {
        let err = SharedSegment::attach(&unique("missing"), 8).unwrap_err();
        assert!(matches!(err, Error::SegmentMissing(_)));
    }

    #[test]
    fn owner_drop_unlinks() {
        let name = unique("unlink");
        {
            let _owner = SharedSegment::create(&name, 64).unwrap();
            assert!(SharedSegment::attach(&name, 64).is_ok());
        }
        assert!(matches!(
            SharedSegment::attach(&name, 64),
            Err(Error::SegmentMissing(_))
        ));
    }

    #[test]
    fn create_or_attach_reports_creation() {
        let name = unique("coa");
        let (seg, created) = SharedSegment::create_or_attach(&name, 8).unwrap();
        assert!(created);
        let (_peer, created_again) = SharedSegment::create_or_attach(&name, 8).unwrap();
        assert!(!created_again);
        drop(seg);
    }
}
