//! Build automation tasks for the topic-inspector workspace.
//!
//! Run with: `cargo xt <command>`
//!
//! # Available Commands
//!
//! - `check`: Run all checks (fmt, clippy, test)
//! - `fmt`: Format code with rustfmt
//! - `lint`: Run clippy with all targets
//! - `test`: Run all tests
//! - `build`: Build release binary
//! - `clean`: Clean build artifacts
//! - `doc`: Generate documentation

// xtask is a build tool - printing to stderr is expected
#![allow(clippy::print_stderr)]

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

/// Build automation for topic-inspector
#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for topic-inspector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all checks (fmt --check, clippy, test)
    Check,
    /// Format code with rustfmt
    Fmt {
        /// Check formatting without modifying files
        #[arg(long)]
        check: bool,
    },
    /// Run clippy lints
    Lint {
        /// Automatically fix lint warnings
        #[arg(long)]
        fix: bool,
    },
    /// Run all tests
    Test {
        /// Run tests with release optimizations
        #[arg(long)]
        release: bool,
    },
    /// Build release binary
    Build {
        /// Build in debug mode
        #[arg(long)]
        debug: bool,
    },
    /// Clean build artifacts
    Clean,
    /// Generate documentation
    Doc {
        /// Open in browser after building
        #[arg(long)]
        open: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.command {
        Commands::Check => check(&sh),
        Commands::Fmt { check } => fmt(&sh, check),
        Commands::Lint { fix } => lint(&sh, fix),
        Commands::Test { release } => test(&sh, release),
        Commands::Build { debug } => build(&sh, debug),
        Commands::Clean => {
            cmd!(sh, "cargo clean").run()?;
            Ok(())
        }
        Commands::Doc { open } => doc(&sh, open),
    }
}

/// The workspace root: the parent of this crate's manifest directory.
fn workspace_root() -> Result<Utf8PathBuf> {
    let manifest_dir = Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(ToOwned::to_owned)
        .context("xtask manifest has no parent directory")
}

fn check(sh: &Shell) -> Result<()> {
    eprintln!("=== Format Check ===");
    fmt(sh, true)?;

    eprintln!("=== Clippy ===");
    lint(sh, false)?;

    eprintln!("=== Tests ===");
    test(sh, false)?;

    eprintln!("All checks passed");
    Ok(())
}

fn fmt(sh: &Shell, check: bool) -> Result<()> {
    let check = check.then_some("--check");
    cmd!(sh, "cargo fmt --all {check...}").run()?;
    Ok(())
}

fn lint(sh: &Shell, fix: bool) -> Result<()> {
    if fix {
        cmd!(sh, "cargo clippy --workspace --all-targets --fix --allow-dirty").run()?;
    } else {
        cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    }
    Ok(())
}

fn test(sh: &Shell, release: bool) -> Result<()> {
    let release = release.then_some("--release");
    cmd!(sh, "cargo test --workspace {release...}").run()?;
    Ok(())
}

fn build(sh: &Shell, debug: bool) -> Result<()> {
    let release = (!debug).then_some("--release");
    cmd!(sh, "cargo build -p ti-cli {release...}").run()?;
    Ok(())
}

fn doc(sh: &Shell, open: bool) -> Result<()> {
    let open = open.then_some("--open");
    cmd!(sh, "cargo doc --workspace --no-deps {open...}").run()?;
    Ok(())
}
