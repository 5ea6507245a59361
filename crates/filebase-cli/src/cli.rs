use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use filebase::{FileHandle, HandleConfig, LockMode, LockOptions, OpenFlags, OpenMode};

#[derive(Parser)]
#[command(name = "fbctl")]
#[command(about = "Inspect, lock and map files through filebase handles", long_about = None)]
pub struct Cli {
    /// Handle configuration file (.toml or .json).
    #[arg(short, long, env = "FBCTL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print size and identity of a file.
    Stat { path: String },
    /// Report whether a path still names the file a fresh handle opened.
    Check {
        path: String,
        /// Wait this long before checking, to race against replacements.
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },
    /// Take an advisory lock and hold it.
    Lock {
        path: String,
        #[arg(short, long, value_enum, default_value = "write")]
        mode: LockArg,
        /// Wait in the kernel instead of polling.
        #[arg(long)]
        blocking: bool,
        #[arg(long)]
        max_retry: Option<u32>,
        #[arg(long)]
        interval_us: Option<u64>,
        /// How long to hold the lock before releasing it.
        #[arg(long, default_value = "0")]
        hold_ms: u64,
    },
    /// Map a byte range read-only and hex dump it.
    Map {
        path: String,
        #[arg(short, long, default_value = "0")]
        offset: u64,
        #[arg(short, long)]
        length: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LockArg {
    Read,
    Write,
}

impl From<LockArg> for LockMode {
    fn from(arg: LockArg) -> Self {
        match arg {
            LockArg::Read => LockMode::Read,
            LockArg::Write => LockMode::Write,
        }
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => HandleConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => HandleConfig::default(),
        };

        match self.command {
            Command::Stat { ref path } => stat(path, config),
            Command::Check { ref path, delay_ms } => check(path, config, delay_ms),
            Command::Lock {
                ref path,
                mode,
                blocking,
                max_retry,
                interval_us,
                hold_ms,
            } => {
                let options = lock_options(&config, blocking, max_retry, interval_us);
                lock(path, config, mode.into(), options, hold_ms)
            }
            Command::Map {
                ref path,
                offset,
                length,
            } => map(path, config, offset, length),
        }
    }
}

pub fn lock_options(
    config: &HandleConfig,
    blocking: bool,
    max_retry: Option<u32>,
    interval_us: Option<u64>,
) -> LockOptions {
    LockOptions {
        nonblocking: !blocking && config.lock.nonblocking,
        max_retry: max_retry.unwrap_or(config.lock.max_retry),
        retry_interval_micros: interval_us.unwrap_or(config.lock.retry_interval_micros),
    }
}

fn open(path: &str, mode: OpenMode, config: HandleConfig) -> Result<FileHandle> {
    let handle = FileHandle::open_with_config(path, mode, OpenFlags::BINARY, config);
    if let Some(err) = handle.error() {
        bail!("{}", err);
    }
    Ok(handle)
}

fn stat(path: &str, config: HandleConfig) -> Result<()> {
    let mut handle = open(path, OpenMode::Read, config)?;
    let size = handle.size()?;
    println!("path: {}", handle.name());
    println!("size: {}", size);
    if let Some(id) = handle.identity() {
        println!("dev: {}", id.dev);
        println!("ino: {}", id.ino);
    }
    Ok(())
}

fn check(path: &str, config: HandleConfig, delay_ms: u64) -> Result<()> {
    let mut handle = open(path, OpenMode::Read, config)?;
    if delay_ms > 0 {
        thread::sleep(Duration::from_millis(delay_ms));
    }
    if handle.check_integrity() {
        println!("intact");
        Ok(())
    } else {
        bail!("{} was replaced or removed", path)
    }
}

fn lock(
    path: &str,
    config: HandleConfig,
    mode: LockMode,
    options: LockOptions,
    hold_ms: u64,
) -> Result<()> {
    let open_mode = match mode {
        LockMode::Read => OpenMode::Read,
        LockMode::Write => OpenMode::ReadWrite,
    };
    let mut handle = open(path, open_mode, config)?;
    handle.lock_with(mode, &options)?;
    tracing::info!(path, ?mode, "lock held");
    println!("locked ({:?})", mode);
    let stats = handle.stats();
    println!(
        "attempts: {}, contention ratio: {:.2}",
        stats.lock_attempts,
        stats.contention_ratio()
    );

    if hold_ms > 0 {
        thread::sleep(Duration::from_millis(hold_ms));
    }
    handle.unlock()?;
    println!("released");
    Ok(())
}

fn map(path: &str, config: HandleConfig, offset: u64, length: usize) -> Result<()> {
    let mut handle = open(path, OpenMode::Read, config)?;
    let view = handle.create_map(offset, length, true)?;
    drop(handle);

    for (row, chunk) in view.chunks(16).enumerate() {
        println!("{}", hex_row(offset + (row * 16) as u64, chunk));
    }
    Ok(())
}

pub fn hex_row(address: u64, bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let ascii: String = bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    format!("{:08x}  {:<47}  |{}|", address, hex.join(" "), ascii)
}
