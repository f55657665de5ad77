#![allow(clippy::unnecessary_cast)] // mode_t is u32 on Linux and u16 on MacOS

use std::{
    ffi::CStr,
    io::{self, Read, Write},
    time::Duration,
};

use fuse_backend_rs::{
    abi::fuse_abi::{stat64, statvfs64, Attr, CreateIn, SetattrValid},
    api::filesystem::{
        Context, DirEntry, Entry, FileSystem, FsOptions, OpenOptions, ZeroCopyReader,
        ZeroCopyWriter,
    },
};
use tracing::{debug, instrument};

use crate::{
    fs::{file_type, CloudFs, FileAttr, STATFS},
    metadata::{NodeId, NodeKind},
    Error,
};

/// How long the kernel may cache attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// Exposes a [CloudFs] through [FileSystem]. Node ids are used as inode
/// numbers, which works as the root node id is [fuse_backend_rs::api::filesystem::ROOT_ID].
/// File handles are node ids too, there's no per-handle state.
pub struct FuseFs {
    fs: CloudFs,
    tokio_handle: tokio::runtime::Handle,
}

impl FuseFs {
    pub fn new(fs: CloudFs, tokio_handle: tokio::runtime::Handle) -> Self {
        Self { fs, tokio_handle }
    }

    /// Runs a filesystem call to completion on the runtime.
    fn block_on<T>(&self, fut: impl std::future::Future<Output = Result<T, Error>>) -> io::Result<T> {
        self.tokio_handle.block_on(fut).map_err(|e| {
            debug!(err=%e, "fuse request failed");
            io::Error::from(e)
        })
    }
}

fn name_str(name: &CStr) -> io::Result<&str> {
    name.to_str()
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Converts to a stat, owned by the caller.
fn to_stat(attr: &FileAttr, ctx: &Context) -> stat64 {
    let mut attr = Attr::from(attr);
    attr.uid = ctx.uid;
    attr.gid = ctx.gid;
    attr.into()
}

fn to_entry(attr: &FileAttr, ctx: &Context) -> Entry {
    Entry {
        inode: attr.ino,
        attr: to_stat(attr, ctx),
        attr_timeout: TTL,
        entry_timeout: TTL,
        ..Default::default()
    }
}

impl FileSystem for FuseFs {
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn lookup(&self, ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let name = name_str(name)?;
        let attr = self.block_on(self.fs.lookup_node(parent, name))?;

        Ok(to_entry(&attr, ctx))
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let attr = self.block_on(self.fs.getattr_node(inode))?;
        Ok((to_stat(&attr, ctx), TTL))
    }

    /// Only size and mode changes are supported, other changes are ignored.
    #[instrument(skip_all, fields(rq.inode = inode))]
    fn setattr(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        attr: stat64,
        _handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        if valid.contains(SetattrValid::SIZE) {
            self.block_on(self.fs.truncate_node(inode, attr.st_size as u64))?;
        }
        if valid.contains(SetattrValid::MODE) {
            self.block_on(self.fs.chmod_node(inode, attr.st_mode as u32))?;
        }

        let attr = self.block_on(self.fs.getattr_node(inode))?;
        Ok((to_stat(&attr, ctx), TTL))
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let children = self.block_on(self.fs.readdir_node(inode))?;

        for (i, child) in children.iter().enumerate().skip(offset as usize) {
            // the offset field will become the "offset" parameter on the next call.
            let written = add_entry(DirEntry {
                ino: child.id,
                offset: i as u64 + 1,
                type_: file_type(child.kind),
                name: child.name.as_bytes(),
            })?;
            // If the buffer is full, add_entry will return `Ok(0)`.
            if written == 0 {
                break;
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        let handle: NodeId = self.block_on(self.fs.open_node(inode))?;
        Ok((Some(handle), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let data = self.block_on(self.fs.read_node(inode, offset, size as u64))?;
        w.write(&data)
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn write(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let mut data = vec![0; size as usize];
        r.read_exact(&mut data)?;

        self.block_on(self.fs.write_node(inode, offset, &data))
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn create(
        &self,
        ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        args: CreateIn,
    ) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions)> {
        let name = name_str(name)?;
        let attr = self.block_on(self.fs.create_node(
            parent,
            name,
            NodeKind::File,
            args.mode & !args.umask,
        ))?;

        Ok((to_entry(&attr, ctx), Some(attr.ino), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn mkdir(
        &self,
        ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        mode: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        let name = name_str(name)?;
        let attr = self.block_on(self.fs.create_node(
            parent,
            name,
            NodeKind::Directory,
            mode & !umask,
        ))?;

        Ok(to_entry(&attr, ctx))
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn unlink(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let name = name_str(name)?;
        self.block_on(self.fs.unlink_node(parent, name))
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn rmdir(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let name = name_str(name)?;
        self.block_on(self.fs.rmdir_node(parent, name))
    }

    #[instrument(skip_all, fields(rq.olddir = olddir, rq.oldname = ?oldname, rq.newdir = newdir, rq.newname = ?newname))]
    fn rename(
        &self,
        _ctx: &Context,
        olddir: Self::Inode,
        oldname: &CStr,
        newdir: Self::Inode,
        newname: &CStr,
        _flags: u32,
    ) -> io::Result<()> {
        let oldname = name_str(oldname)?;
        let newname = name_str(newname)?;
        self.block_on(self.fs.rename_node(olddir, oldname, newdir, newname))
    }

    fn statfs(&self, _ctx: &Context, _inode: Self::Inode) -> io::Result<statvfs64> {
        Ok(STATFS.into())
    }
}
