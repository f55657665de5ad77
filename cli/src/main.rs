use std::{io, path::Path};

use clap::Parser;
use cloudfs::{backend, fs::unix_time, metadata, metadata::NodeKind, path, CloudFs, Config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, instrument};

mod args;

use args::{Cli, Commands};

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Creates all directories along `dir`, skipping the existing ones.
async fn mkdir_parents(fs: &CloudFs, dir: &str) -> Result<(), Error> {
    let mut current = String::new();
    for component in path::components(dir)? {
        current.push('/');
        current.push_str(component);

        if let Err(e) = fs.mkdir(&current, 0o755).await {
            if e.kind() != io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
            if fs.getattr(&current).await?.kind != NodeKind::Directory {
                return Err(format!("{} exists and is not a directory", current).into());
            }
        }
    }

    Ok(())
}

/// Copies a local file into the filesystem, one block at a time.
#[instrument(skip(fs), err)]
async fn put(fs: &CloudFs, src: &Path, dest: &str) -> Result<u64, Error> {
    let mut file = tokio::fs::File::open(src).await?;

    match fs.getattr(dest).await {
        Ok(_) => fs.truncate(dest, 0).await?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs.create(dest, 0o644).await?;
        }
        Err(e) => return Err(e.into()),
    }

    let mut buf = vec![0; fs.blocks().config().block_size as usize];
    let mut offset = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        fs.write(dest, &buf[..n], offset).await?;
        offset += n as u64;
    }

    Ok(offset)
}

async fn cat(fs: &CloudFs, path: &str) -> Result<(), Error> {
    let chunk = fs.blocks().config().block_size;
    let mut stdout = tokio::io::stdout();
    let mut offset = 0u64;

    loop {
        let data = fs.read(path, chunk, offset).await?;
        if data.is_empty() {
            break;
        }
        stdout.write_all(&data).await?;
        offset += data.len() as u64;
    }

    stdout.flush().await?;
    Ok(())
}

async fn stat(fs: &CloudFs, path: &str) -> Result<(), Error> {
    let attr = fs.getattr(path).await?;

    println!("  Path: {}", path);
    println!(" Inode: {}", attr.ino);
    println!("  Type: {:?}", attr.kind);
    println!("  Size: {}", attr.size);
    println!(" Links: {}", attr.nlink);
    println!("  Mode: {:o}", attr.mode());
    for (label, time) in [
        ("Access", attr.atime),
        ("Modify", attr.mtime),
        ("Change", attr.ctime),
    ] {
        let (secs, nanos) = unix_time(time);
        println!("{}: {}.{:09}", label, secs, nanos);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    cloudfs_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .format(cli.log_format.into())
        .build()?;

    let backend = backend::from_addr(&cli.backend_addr).await?;
    let metadata = metadata::from_addr(&cli.metadata_addr).await?;
    let fs = CloudFs::new(
        backend,
        metadata,
        Config {
            block_size: cli.block_size,
            write_attempts: cli.write_attempts,
        },
    )
    .await?;

    match cli.command {
        #[cfg(feature = "fuse")]
        Commands::Mount {
            dest,
            threads,
            allow_other,
        } => {
            use cloudfs::fs::fuse::FuseDaemon;

            let fuse_daemon = tokio::task::spawn_blocking(move || {
                FuseDaemon::new(fs, &dest, threads, allow_other)
            })
            .await??;

            // grab a handle to unmount the file system, and register a signal handler.
            let unmount_daemon = fuse_daemon.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await?;
                info!("interrupt received, unmounting…");
                tokio::task::spawn_blocking(move || unmount_daemon.unmount()).await??;
                info!("unmount occured, terminating…");
                Ok::<_, io::Error>(())
            });

            // Wait for the server to finish, which can either happen through it
            // being unmounted externally, or receiving a signal invoking the
            // handler above.
            tokio::task::spawn_blocking(move || fuse_daemon.wait()).await?
        }
        Commands::Ls { path } => {
            for name in fs.readdir(&path).await? {
                println!("{}", name);
            }
        }
        Commands::Stat { path } => stat(&fs, &path).await?,
        Commands::Cat { path } => cat(&fs, &path).await?,
        Commands::Put { src, dest } => {
            let written = put(&fs, &src, &dest).await?;
            info!(path = %dest, size = written, "stored");
        }
        Commands::Mkdir { path, parents } => {
            if parents {
                mkdir_parents(&fs, &path).await?
            } else {
                fs.mkdir(&path, 0o755).await?;
            }
        }
        Commands::Rm { path } => fs.unlink(&path).await?,
        Commands::Rmdir { path } => fs.rmdir(&path).await?,
        Commands::Mv { src, dest } => fs.rename(&src, &dest).await?,
        Commands::Truncate { path, length } => fs.truncate(&path, length).await?,
        Commands::Chmod { mode, path } => fs.chmod(&path, mode).await?,
    }

    Ok(())
}
