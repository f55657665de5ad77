#![allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS

use std::time::{SystemTime, UNIX_EPOCH};

use crate::metadata::{Node, NodeId, NodeKind};

/// Attributes of a node, as reported by `getattr`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: NodeId,
    pub kind: NodeKind,
    /// Sum of all block lengths for files, 0 for directories.
    pub size: u64,
    pub nlink: u32,
    pub permissions: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttr {
    pub(crate) fn new(node: &Node, size: u64, nlink: u32) -> Self {
        Self {
            ino: node.id,
            kind: node.kind,
            size,
            nlink,
            permissions: node.permissions,
            atime: node.accessed_at,
            mtime: node.updated_at,
            ctime: node.updated_at,
        }
    }

    /// File type and permission bits, like `st_mode`.
    pub fn mode(&self) -> u32 {
        file_type(self.kind) | (self.permissions & 0o7777)
    }
}

/// The `S_IF*` bits for a node kind.
pub fn file_type(kind: NodeKind) -> u32 {
    match kind {
        NodeKind::Directory => libc::S_IFDIR as u32,
        NodeKind::File => libc::S_IFREG as u32,
    }
}

/// Filesystem statistics, as reported by `statfs`.
/// There's no meaningful capacity of a remote object store, so these are
/// fixed figures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatFs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub namemax: u64,
}

pub const STATFS: StatFs = StatFs {
    bsize: 512 * 1024,
    frsize: 512 * 1024,
    blocks: 20_000_000_000,
    bfree: 20_000_000_000,
    bavail: 20_000_000_000,
    namemax: 256,
};

/// Splits a timestamp into seconds and nanoseconds since the epoch.
pub fn unix_time(t: SystemTime) -> (u64, u32) {
    t.duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs(), d.subsec_nanos()))
        .unwrap_or_default()
}

#[cfg(feature = "fuse")]
impl From<&FileAttr> for fuse_backend_rs::abi::fuse_abi::Attr {
    fn from(attr: &FileAttr) -> Self {
        let (atime, atimensec) = unix_time(attr.atime);
        let (mtime, mtimensec) = unix_time(attr.mtime);
        let (ctime, ctimensec) = unix_time(attr.ctime);

        Self {
            ino: attr.ino,
            size: attr.size,
            blksize: 1024,
            blocks: attr.size.div_ceil(512),
            mode: attr.mode(),
            atime,
            mtime,
            ctime,
            atimensec,
            mtimensec,
            ctimensec,
            nlink: attr.nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            #[cfg(target_os = "macos")]
            crtime: 0,
            #[cfg(target_os = "macos")]
            crtimensec: 0,
            #[cfg(target_os = "macos")]
            padding: 0,
        }
    }
}

#[cfg(feature = "fuse")]
impl From<StatFs> for fuse_backend_rs::abi::fuse_abi::statvfs64 {
    fn from(s: StatFs) -> Self {
        // SAFETY: statvfs64 is a plain C struct, all zeroes is a valid value.
        let mut out: Self = unsafe { std::mem::zeroed() };
        out.f_bsize = s.bsize as _;
        out.f_frsize = s.frsize as _;
        out.f_blocks = s.blocks as _;
        out.f_bfree = s.bfree as _;
        out.f_bavail = s.bavail as _;
        out.f_namemax = s.namemax as _;
        out
    }
}
