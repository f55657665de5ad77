use std::{io, path::Path, sync::Arc};

use fuse_backend_rs::{api::server::Server, transport::FuseSession};
use parking_lot::Mutex;
use threadpool::ThreadPool;
use tracing::{error, info, instrument};

use super::CloudFs;

mod filesystem;

pub use self::filesystem::FuseFs;

#[cfg(target_os = "macos")]
const BADFD: libc::c_int = libc::EBADF;
#[cfg(target_os = "linux")]
const BADFD: libc::c_int = libc::EBADFD;

fn other_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Handles requests arriving on one channel of a session, until the session
/// is shut down.
fn serve(server: Arc<Server<Arc<FuseFs>>>, mut channel: fuse_backend_rs::transport::FuseChannel) {
    loop {
        let (reader, writer) = match channel.get_request() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(error) => {
                error!(?error, "failed to receive fuse request");
                break;
            }
        };

        match server.handle_message(reader, writer.into(), None, None) {
            Ok(_) => {}
            // This indicates the session has been shut down.
            Err(fuse_backend_rs::Error::EncodeMessage(e)) if e.raw_os_error() == Some(BADFD) => {
                break;
            }
            Err(error) => error!(?error, "failed to handle fuse request"),
        }
    }
}

/// Mounts a [CloudFs] and serves it with the specified number of threads.
/// Provides functions to unmount, and wait for it to have completed.
#[derive(Clone)]
pub struct FuseDaemon {
    session: Arc<Mutex<FuseSession>>,
    threads: Arc<ThreadPool>,
}

impl FuseDaemon {
    /// Needs to be called from within a tokio runtime, which is used to
    /// drive all filesystem calls.
    #[instrument(skip(fs, mountpoint), fields(mountpoint=?mountpoint), err)]
    pub fn new<P>(
        fs: CloudFs,
        mountpoint: P,
        num_threads: usize,
        allow_other: bool,
    ) -> Result<Self, io::Error>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        let fs = FuseFs::new(fs, tokio::runtime::Handle::current());
        let server = Arc::new(Server::new(Arc::new(fs)));

        let mut session =
            FuseSession::new(mountpoint.as_ref(), "cloudfs", "", false).map_err(other_error)?;

        #[cfg(target_os = "linux")]
        session.set_allow_other(allow_other);
        session.mount().map_err(other_error)?;

        let threads = threadpool::Builder::new()
            .num_threads(num_threads)
            .thread_name("fuse_server".to_string())
            .build();

        for _ in 0..num_threads {
            let channel = session.new_channel().map_err(other_error)?;
            let server = server.clone();
            threads.execute(move || serve(server, channel));
        }

        info!(threads = num_threads, "mounted");

        Ok(FuseDaemon {
            session: Arc::new(Mutex::new(session)),
            threads: Arc::new(threads),
        })
    }

    /// Waits for all threads to finish.
    #[instrument(skip_all)]
    pub fn wait(&self) {
        self.threads.join()
    }

    /// Send the unmount command, and waits for all threads to finish.
    #[instrument(skip_all, err)]
    pub fn unmount(&self) -> Result<(), io::Error> {
        self.session.lock().umount().map_err(other_error)?;

        self.wait();
        Ok(())
    }
}

impl Drop for FuseDaemon {
    fn drop(&mut self) {
        if let Err(error) = self.unmount() {
            error!(?error, "failed to unmount fuse filesystem")
        }
    }
}
