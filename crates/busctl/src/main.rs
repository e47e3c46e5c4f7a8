//! CLI entry point for the `busctl` binary.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use busctl::{parse_script, run, PlatformConfig};
use peripherals as _;
use regbank_core as _;
use serde as _;
use serde_json as _;
#[cfg(test)]
use tempfile as _;
use thiserror as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE_TEXT: &str = "\
Usage: busctl <command> [options]

Commands:
  run <script> [--config <file>] [--verbose]  Execute a bus script
  map [--config <file>]                       Print the address map

Options:
  -c, --config <file>  Platform description in JSON (default: built-in map)
  -v, --verbose        Log bus traffic at debug level (run only)
  -h, --help           Show this help message

Logging honours RUST_LOG when --verbose is not given.

Examples:
  busctl map
  busctl run smoke.bus
  busctl run smoke.bus --config platform.json -v
";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(RunArgs),
    Map(MapArgs),
}

#[derive(Debug, PartialEq, Eq)]
struct RunArgs {
    script: PathBuf,
    config: Option<PathBuf>,
    verbose: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct MapArgs {
    config: Option<PathBuf>,
}

#[derive(Debug)]
enum ParseResult {
    Command(Command),
    Help,
}

fn parse_args(mut args: impl Iterator<Item = OsString>) -> Result<ParseResult, String> {
    let first = args.next().ok_or_else(|| "missing command".to_string())?;

    if first == "--help" || first == "-h" {
        return Ok(ParseResult::Help);
    }

    let command_str = first.to_string_lossy().to_string();

    match command_str.as_str() {
        "run" => parse_run_args(args)
            .map(Command::Run)
            .map(ParseResult::Command),
        "map" => parse_map_args(args)
            .map(Command::Map)
            .map(ParseResult::Command),
        other => Err(format!("unknown command: {other}")),
    }
}

#[allow(clippy::while_let_on_iterator)]
fn parse_run_args(mut args: impl Iterator<Item = OsString>) -> Result<RunArgs, String> {
    let mut script: Option<PathBuf> = None;
    let mut config: Option<PathBuf> = None;
    let mut verbose = false;

    while let Some(arg) = args.next() {
        if arg == "--help" || arg == "-h" {
            return Err(USAGE_TEXT.to_string());
        }

        if arg == "--verbose" || arg == "-v" {
            verbose = true;
            continue;
        }

        if arg == "-c" || arg == "--config" {
            let value = args
                .next()
                .ok_or_else(|| "missing value for --config".to_string())?;
            config = Some(PathBuf::from(value));
            continue;
        }

        if arg.to_string_lossy().starts_with('-') {
            return Err(format!("unknown option: {}", arg.to_string_lossy()));
        }

        if script.is_some() {
            return Err("multiple script paths provided".to_string());
        }
        script = Some(PathBuf::from(arg));
    }

    let script = script.ok_or_else(|| "missing script path".to_string())?;
    Ok(RunArgs {
        script,
        config,
        verbose,
    })
}

#[allow(clippy::while_let_on_iterator)]
fn parse_map_args(mut args: impl Iterator<Item = OsString>) -> Result<MapArgs, String> {
    let mut config: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        if arg == "--help" || arg == "-h" {
            return Err(USAGE_TEXT.to_string());
        }

        if arg == "-c" || arg == "--config" {
            let value = args
                .next()
                .ok_or_else(|| "missing value for --config".to_string())?;
            config = Some(PathBuf::from(value));
            continue;
        }

        if arg.to_string_lossy().starts_with('-') {
            return Err(format!("unknown option: {}", arg.to_string_lossy()));
        }

        return Err(format!("unexpected argument: {}", arg.to_string_lossy()));
    }

    Ok(MapArgs { config })
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_platform(config: Option<&Path>) -> Result<PlatformConfig, i32> {
    let Some(path) = config else {
        return Ok(PlatformConfig::default());
    };
    PlatformConfig::load(path).map_err(|e| {
        eprintln!("error: {e}");
        1
    })
}

fn run_script(args: &RunArgs) -> Result<(), i32> {
    let platform = load_platform(args.config.as_deref())?;
    let mut bus = platform.build().map_err(|e| {
        eprintln!("error: {e}");
        1
    })?;

    let source = fs::read_to_string(&args.script).map_err(|e| {
        eprintln!("error: cannot read {}: {e}", args.script.display());
        1
    })?;
    let statements = parse_script(&source).map_err(|e| {
        eprintln!("{}:{}: error: {}", args.script.display(), e.line, e.kind);
        1
    })?;

    info!(script = %args.script.display(), statements = statements.len(), "running");
    let report = run(&mut bus, &statements);

    for failure in &report.failures {
        println!("{}:{}: FAIL {}", args.script.display(), failure.line, failure.message);
    }

    println!();
    println!("Summary: {report}");

    if report.passed() {
        Ok(())
    } else {
        Err(1)
    }
}

fn run_map(args: &MapArgs) -> Result<(), i32> {
    let platform = load_platform(args.config.as_deref())?;
    let bus = platform.build().map_err(|e| {
        eprintln!("error: {e}");
        1
    })?;

    for window in bus.windows() {
        let lines = bus
            .peripheral(&window.name)
            .map(|p| p.line_names().join(", "))
            .unwrap_or_default();
        if lines.is_empty() {
            println!("{window}");
        } else {
            println!("{window}  [{lines}]");
        }
    }

    Ok(())
}

fn main() {
    let exit_code = match parse_args(env::args_os().skip(1)) {
        Ok(ParseResult::Help) => {
            println!("{USAGE_TEXT}");
            0
        }
        Ok(ParseResult::Command(Command::Run(args))) => {
            init_logging(args.verbose);
            match run_script(&args) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
        Ok(ParseResult::Command(Command::Map(args))) => {
            init_logging(false);
            match run_map(&args) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
        Err(error) => {
            if error.starts_with("Usage:") {
                println!("{error}");
            } else {
                eprintln!("error: {error}");
                eprintln!("{USAGE_TEXT}");
            }
            1
        }
    };

    std::process::exit(exit_code);
}
