//! Purpose: `palog` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Process exit code is derived from `core::error::to_exit_code`.
//! Invariants: All pool mutations go through `LogPool` (lock + mmap safety).
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use palog::{
    check, to_exit_code, CheckStatus, CreateConfig, Error, ErrorKind, LogPool, OpenConfig,
};

#[derive(Parser)]
#[command(
    name = "palog",
    version,
    about = "Crash-consistent append-only log pools over memory-mapped files"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Create a new log pool")]
    Create {
        path: PathBuf,
        #[arg(long, value_parser = parse_size, help = "Pool size in bytes (K/M/G suffixes accepted)")]
        size: u64,
        #[arg(long, value_parser = parse_mode, default_value = "644", help = "Permission bits for the pool file (octal)")]
        mode: u32,
    },
    #[command(about = "Print pool capacity and fill level as JSON")]
    Info { path: PathBuf },
    #[command(about = "Check pool consistency without mutating it")]
    Check {
        path: PathBuf,
        #[arg(long, help = "Emit the full report as JSON")]
        json: bool,
    },
    #[command(about = "Write the log contents to stdout")]
    Dump {
        path: PathBuf,
        #[arg(long, default_value_t = 0, help = "Chunk size per read; 0 reads everything at once")]
        chunk: u64,
    },
    #[command(about = "Discard all data, resetting the pool to empty")]
    Rewind { path: PathBuf },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("palog: {err}");
            if let Some(hint) = err.hint() {
                eprintln!("hint: {hint}");
            }
            exit_code(err.kind())
        }
    }
}

fn run(command: Command) -> Result<ExitCode, Error> {
    match command {
        Command::Create { path, size, mode } => {
            LogPool::create(&path, size, CreateConfig { mode })?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Info { path } => {
            let pool = LogPool::open_with(
                &path,
                OpenConfig {
                    read_only: true,
                    copy_on_write: false,
                },
            )?;
            let info = json!({
                "path": path.display().to_string(),
                "capacity": pool.capacity(),
                "tell": pool.tell(),
            });
            println!("{info}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { path, json } => {
            let report = check(&path)?;
            if json {
                let issues: Vec<_> = report
                    .issues
                    .iter()
                    .map(|issue| json!({"code": issue.code, "message": issue.message}))
                    .collect();
                let rendered = json!({
                    "path": report.path.display().to_string(),
                    "status": match report.status {
                        CheckStatus::Consistent => "consistent",
                        CheckStatus::Inconsistent => "inconsistent",
                    },
                    "issues": issues,
                });
                println!("{rendered}");
            } else if report.is_consistent() {
                println!("{}: consistent", report.path.display());
            } else {
                println!("{}: inconsistent", report.path.display());
                for issue in &report.issues {
                    println!("  {}: {}", issue.code, issue.message);
                }
            }
            if report.is_consistent() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(exit_code(ErrorKind::Corrupt))
            }
        }
        Command::Dump { path, chunk } => {
            let pool = LogPool::open_with(
                &path,
                OpenConfig {
                    read_only: true,
                    copy_on_write: false,
                },
            )?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let mut write_error = None;
            pool.walk(chunk, |bytes| match out.write_all(bytes) {
                Ok(()) => true,
                Err(err) => {
                    write_error = Some(err);
                    false
                }
            });
            match write_error {
                Some(err) => Err(Error::new(ErrorKind::Io)
                    .with_message("writing log contents to stdout failed")
                    .with_source(err)),
                None => Ok(ExitCode::SUCCESS),
            }
        }
        Command::Rewind { path } => {
            let pool = LogPool::open(&path)?;
            pool.rewind()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(kind: ErrorKind) -> ExitCode {
    ExitCode::from(to_exit_code(kind) as u8)
}

fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('K' | 'k') => (&value[..value.len() - 1], 1024),
        Some('M' | 'm') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {value:?}"))?;
    base.checked_mul(multiplier)
        .ok_or_else(|| format!("size {value:?} is out of range"))
}

fn parse_mode(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8).map_err(|_| format!("invalid octal mode {value:?}"))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
