use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use cloudfs::blocks::{DEFAULT_BLOCK_SIZE, DEFAULT_WRITE_ATTEMPTS};
use cloudfs_tracing::LogFormat;
use tracing::Level;

/// Stores a tree of files in an object store, split into content-addressed
/// blocks.
///
/// Paths passed to the subcommands are absolute paths inside the
/// filesystem, like `/docs/a.txt`.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t=Level::INFO)]
    pub log_level: Level,

    /// How log lines are rendered.
    #[arg(long, value_enum, default_value_t=Format::Compact)]
    pub log_format: Format,

    /// Where block objects are stored.
    /// One of `memory://`, `simplefs:///path` or `objectstore+<url>`.
    #[arg(long, env, default_value = "simplefs:///var/lib/cloudfs/blocks")]
    pub backend_addr: String,

    /// Where the namespace tree and the block lists are stored.
    /// One of `memory://`, `redb://` or `redb:///path`.
    #[arg(long, env, default_value = "redb:///var/lib/cloudfs/metadata.redb")]
    pub metadata_addr: String,

    /// Size of a full block, in bytes. Can't be changed once a filesystem
    /// has been created.
    #[arg(long, env, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u64,

    /// How often a block upload is attempted before a write fails.
    #[arg(long, env, default_value_t = DEFAULT_WRITE_ATTEMPTS)]
    pub write_attempts: usize,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Format {
    Compact,
    Json,
}

impl From<Format> for LogFormat {
    fn from(value: Format) -> Self {
        match value {
            Format::Compact => LogFormat::Compact,
            Format::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mounts the filesystem at the given mountpoint
    #[cfg(feature = "fuse")]
    Mount {
        #[clap(value_name = "PATH")]
        dest: PathBuf,

        /// Number of FUSE threads to spawn.
        #[arg(long, env, default_value_t = default_threads())]
        threads: usize,

        #[arg(long, default_value_t = false)]
        /// Whether to configure the mountpoint with allow_other.
        /// Requires /etc/fuse.conf to contain the `user_allow_other`
        /// option.
        allow_other: bool,
    },
    /// Lists the entries of a directory
    Ls {
        #[clap(default_value = "/")]
        path: String,
    },
    /// Prints the attributes of a file or directory
    Stat { path: String },
    /// Writes the contents of a file to stdout
    Cat { path: String },
    /// Copies a local file into the filesystem, replacing the target if it
    /// exists
    Put {
        #[clap(value_name = "LOCAL")]
        src: PathBuf,
        dest: String,
    },
    /// Creates a directory
    Mkdir {
        path: String,

        /// Create missing parent directories too.
        #[arg(long, short = 'p')]
        parents: bool,
    },
    /// Removes a file
    Rm { path: String },
    /// Removes an empty directory
    Rmdir { path: String },
    /// Moves a file or directory
    Mv { src: String, dest: String },
    /// Shrinks or extends a file to the given length
    Truncate { path: String, length: u64 },
    /// Changes the permission bits of a file or directory
    Chmod {
        #[clap(value_parser = parse_mode)]
        mode: u32,
        path: String,
    },
}

#[cfg(feature = "fuse")]
fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.into())
        .unwrap_or(4)
}

/// Parses an octal mode, like `644` or `0o755`.
fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("invalid mode: {}", s))
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use rstest::rstest;

    use super::{parse_mode, Cli, Commands};

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case::plain("644", Some(0o644))]
    #[case::prefixed("0o755", Some(0o755))]
    #[case::setuid("4755", Some(0o4755))]
    #[case::not_octal("9", None)]
    #[case::too_large("17777", None)]
    fn modes(#[case] input: &str, #[case] expected: Option<u32>) {
        assert_eq!(expected, parse_mode(input).ok());
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["cloudfs", "ls"]).expect("must parse");
        assert_eq!(cloudfs::blocks::DEFAULT_BLOCK_SIZE, cli.block_size);
        assert!(matches!(cli.command, Commands::Ls { path } if path == "/"));
    }
}
