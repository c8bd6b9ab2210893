use std::path::Path;
use std::process::{exit, Command, ExitStatus};

use clap::{Parser, Subcommand, ValueEnum};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the ride dispatch workspace",
    long_about = "A unified CLI for checks, tests, benchmarks and script replays\n\
                  in the ride dispatch workspace."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Formatting and clippy
    Check,
    /// Run the dispatch_core and dispatch_replay test suites
    Test,
    /// Replay a JSON-lines script against an in-process engine
    Replay {
        /// Script to replay
        #[arg(default_value = "demos/reassignment.jsonl")]
        script: String,
        /// Geo backend override (`scan` or `cell`)
        #[arg(long, env = "GEO_BACKEND")]
        geo_backend: Option<String>,
    },
    /// Run Criterion benchmarks
    Bench,
    /// Compare benchmarks: stash changes, create baseline, restore, compare
    BenchCompare,
    /// Run CI checks (fmt, clippy, tests, demo replays, benchmarks)
    Ci {
        /// Job to run
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting, clippy, and tests
    Check,
    /// Replay every demo script with both geo backends
    Replay,
    /// Run benchmarks
    Bench,
    /// Run check + replay + bench
    All,
}

const DEMO_SCRIPTS: [&str; 2] = ["demos/lifecycle.jsonl", "demos/reassignment.jsonl"];

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn spawn(program: &str, args: &[&str]) -> ExitStatus {
    eprintln!("+ {program} {}", args.join(" "));
    Command::new(program)
        .args(args)
        .status()
        .unwrap_or_else(|error| {
            eprintln!("failed to execute {program}: {error}");
            exit(1)
        })
}

fn run(program: &str, args: &[&str]) {
    let status = spawn(program, args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

fn run_cargo(args: &[&str]) {
    run("cargo", args);
}

fn run_git(args: &[&str]) {
    run("git", args);
}

fn replay(script: &str, geo_backend: Option<&str>) {
    let mut args = vec!["run", "-p", "dispatch_replay", "--", script];
    if let Some(backend) = geo_backend {
        args.extend(["--geo-backend", backend]);
    }
    run_cargo(&args);
}

fn bench(extra: &[&str]) {
    let mut args = vec!["bench", "--package", "dispatch_core", "--bench", "performance"];
    if !extra.is_empty() {
        args.push("--");
        args.extend_from_slice(extra);
    }
    run_cargo(&args);
}

// ── CI jobs ────────────────────────────────────────────────────────

fn ci_check() {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"]);

    step("Clippy");
    run_cargo(&[
        "clippy",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ]);

    step("Test dispatch_core");
    run_cargo(&["test", "-p", "dispatch_core"]);

    step("Test dispatch_replay");
    run_cargo(&["test", "-p", "dispatch_replay"]);
}

fn ci_replay() {
    for script in DEMO_SCRIPTS {
        for backend in ["scan", "cell"] {
            step(&format!("Replay {script} ({backend})"));
            replay(script, Some(backend));
        }
    }
}

fn ci_bench() {
    step("Run benchmarks");
    bench(&[]);
}

// ── main ───────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            run_cargo(&["fmt", "--all", "--", "--check"]);
            run_cargo(&["clippy", "--all-targets", "--", "-D", "warnings"]);
        }
        Commands::Test => {
            run_cargo(&["test", "-p", "dispatch_core"]);
            run_cargo(&["test", "-p", "dispatch_replay"]);
        }
        Commands::Replay {
            script,
            geo_backend,
        } => {
            replay(&script, geo_backend.as_deref());
        }
        Commands::Bench => bench(&[]),
        Commands::BenchCompare => {
            let baseline_dir = Path::new("target/criterion");
            if baseline_dir.exists() {
                step("Removing existing benchmark data");
                if let Err(error) = std::fs::remove_dir_all(baseline_dir) {
                    eprintln!("failed to remove target/criterion: {error}");
                    exit(1);
                }
            }

            step("Stashing current changes");
            run_git(&[
                "stash",
                "push",
                "-m",
                "Temporary stash for benchmark comparison",
            ]);

            step("Running benchmark to create baseline");
            bench(&["--save-baseline", "main"]);

            step("Reapplying changes");
            run_git(&["stash", "pop"]);

            step("Running benchmark comparing against baseline");
            bench(&["--baseline", "main"]);

            eprintln!("\nDone! Check the output above to see performance comparison.");
        }
        Commands::Ci { job } => {
            match job {
                CiJob::Check => ci_check(),
                CiJob::Replay => ci_replay(),
                CiJob::Bench => ci_bench(),
                CiJob::All => {
                    ci_check();
                    ci_replay();
                    ci_bench();
                }
            }
            eprintln!("\nCI job passed.");
        }
    }
}
