use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace automation for strata")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run fmt, clippy, tests and docs
    Check,
    /// Run cargo fmt --check on all crates
    Fmt,
    /// Run clippy on all crates, warnings denied
    Clippy,
    /// Run all tests; `--crate` limits the run to one package
    Test {
        #[arg(long = "crate")]
        package: Option<String>,
    },
    /// Run the terrain streaming benchmark in release mode
    Bench,
    /// Smoke-run every CLI subcommand with small inputs
    Smoke,
    /// Build rustdoc for the workspace
    Doc,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            run_fmt()?;
            run_clippy()?;
            run_tests(None)?;
            run_doc()?;
        }
        Commands::Fmt => run_fmt()?,
        Commands::Clippy => run_clippy()?,
        Commands::Test { package } => run_tests(package.as_deref())?,
        Commands::Bench => run_bench()?,
        Commands::Smoke => run_smoke()?,
        Commands::Doc => run_doc()?,
    }

    Ok(())
}

fn cargo(step: &str, args: &[&str]) -> Result<()> {
    println!("==> {step}: cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{step} failed ({status})");
    }
    Ok(())
}

fn run_fmt() -> Result<()> {
    cargo("fmt", &["fmt", "--all", "--", "--check"])
}

fn run_clippy() -> Result<()> {
    cargo(
        "clippy",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    )
}

fn run_tests(package: Option<&str>) -> Result<()> {
    match package {
        Some(package) => cargo("test", &["test", "-p", package]),
        None => cargo("test", &["test", "--workspace"]),
    }
}

fn run_bench() -> Result<()> {
    cargo(
        "bench",
        &["bench", "-p", "strata-terrain", "--bench", "bench_terrain_streaming"],
    )
}

fn run_smoke() -> Result<()> {
    let runs: [&[&str]; 4] = [
        &["info"],
        &["octree", "--objects", "2000"],
        &["simulate", "--frames", "40", "--threads", "2", "--dig"],
        &["raycast"],
    ];
    for args in runs {
        let mut full = vec!["run", "--release", "-p", "strata-cli", "--"];
        full.extend_from_slice(args);
        cargo("smoke", &full)?;
    }
    Ok(())
}

fn run_doc() -> Result<()> {
    cargo("doc", &["doc", "--workspace", "--no-deps"])
}
