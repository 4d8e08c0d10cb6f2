use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use scx_core::registry::ContractRegistry;
use scx_core::{
    shell, value, BackendKind, EngineConfig, Error, ExecutionRecord, InvocationRequest, Invoker,
    Result,
};
use tracing_subscriber::EnvFilter;

/// SCX: sandboxed smart-contract invocation
///
/// Run compiled contract endpoints inside an isolation backend and persist
/// the resulting contract state.
#[derive(Parser)]
#[command(name = "scx", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a contract endpoint and print the execution record
    Invoke(InvokeArgs),

    /// Guest entry: read a payload on stdin, run it, write the report on stdout
    Shell {
        /// Staged compiled artifact
        artifact: PathBuf,
    },

    /// List the endpoints a contract declares
    Endpoints {
        /// Directory holding interface documents
        interfaces: PathBuf,
        /// Contract name
        contract: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

#[derive(Args)]
struct InvokeArgs {
    /// Directory holding compiled artifacts (<contract>.scb)
    binaries: PathBuf,
    /// Directory holding interface documents (<contract>.json)
    interfaces: PathBuf,
    /// Contract name
    contract: String,
    /// Endpoint to call
    endpoint: String,
    /// Arguments as name/value pairs; values are JSON literals or bare text
    #[arg(long, num_args = 1.., value_names = ["NAME", "VALUE"], allow_negative_numbers = true)]
    kwargs: Vec<String>,
    /// Record whose state the run starts from
    #[arg(long, value_name = "PATH")]
    last_exec: Option<PathBuf>,
    /// Where to write the new execution record
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Update the canonical state file when the run succeeds
    #[arg(long)]
    commit: bool,
    /// Directory for canonical state and lock files
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,
    /// Isolation backend: isolated, or none/direct to run in-process
    #[arg(long, value_name = "BACKEND")]
    sandbox: Option<BackendKind>,
    /// Engine configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// JSON indentation; 0 prints a single line
    #[arg(long, default_value_t = 2)]
    indent: usize,
}

/// Exit code clap uses for usage errors
const USAGE_EXIT: i32 = 2;

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Invoke(args) => run_invoke(args),
        Commands::Shell { artifact } => run_shell(&artifact),
        Commands::Endpoints {
            interfaces,
            contract,
            json,
        } => run_endpoints(interfaces, &contract, json),
        Commands::Version => {
            println!("scx {} (scx-core {})", env!("CARGO_PKG_VERSION"), scx_core::VERSION);
            0
        }
    };

    process::exit(exit_code);
}

/// Log to stderr so stdout only ever carries the result document
fn init_tracing() {
    let filter = EnvFilter::try_from_env("SCX_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn report(err: &Error) -> i32 {
    eprintln!("{} {}", "error:".red().bold(), err);
    err.category().exit_code()
}

// ── invoke ────────────────────────────────────────────────

fn run_invoke(args: InvokeArgs) -> i32 {
    let kwargs = match value::parse_kwargs(&args.kwargs) {
        Ok(kwargs) => kwargs,
        Err(e) => {
            eprintln!("{} --kwargs: {}", "error:".red().bold(), e);
            return USAGE_EXIT;
        }
    };
    let indent = args.indent;

    match invoke(args, kwargs) {
        Ok(record) => {
            if let Err(e) = print_record(&record, indent) {
                return report(&e);
            }
            match record.failure() {
                None => 0,
                Some(err) => {
                    eprintln!("{} {}", "failed:".yellow().bold(), err);
                    err.category().exit_code()
                }
            }
        }
        Err(e) => report(&e),
    }
}

fn invoke(
    args: InvokeArgs,
    kwargs: std::collections::BTreeMap<String, scx_core::Value>,
) -> Result<ExecutionRecord> {
    let mut config =
        EngineConfig::load(args.config.as_deref())?.with_env_overrides(std::env::vars())?;
    if let Some(backend) = args.sandbox {
        config.backend = backend;
    }
    if let Some(dir) = args.state_dir {
        config.state_dir = dir;
    }
    config.check()?;

    let registry = ContractRegistry::new(args.binaries, args.interfaces);
    let invoker = Invoker::from_config(config, registry)?;

    let mut request = InvocationRequest::new(args.contract, args.endpoint)
        .args(kwargs)
        .commit(args.commit);
    if let Some(path) = args.last_exec {
        request = request.prior_state(path);
    }
    if let Some(path) = args.output {
        request = request.output(path);
    }

    Ok(invoker.invoke(&request)?.record)
}

fn print_record(record: &ExecutionRecord, indent: usize) -> Result<()> {
    let mut out = Vec::new();
    let written = if indent == 0 {
        serde_json::to_writer(&mut out, record)
    } else {
        let pad = " ".repeat(indent);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(pad.as_bytes());
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        record.serialize(&mut ser)
    };
    written.map_err(|e| Error::Serialization(format!("cannot print record: {}", e)))?;
    out.push(b'\n');
    std::io::stdout()
        .write_all(&out)
        .map_err(|e| Error::StatePersistence(format!("cannot write to stdout: {}", e)))
}

// ── shell ─────────────────────────────────────────────────

fn run_shell(artifact: &Path) -> i32 {
    let code = match std::fs::read(artifact) {
        Ok(code) => code,
        Err(e) => {
            return report(&Error::Artifact(format!(
                "cannot read {}: {}",
                artifact.display(),
                e
            )))
        }
    };
    let mut payload = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut payload) {
        return report(&Error::Serialization(format!("cannot read payload: {}", e)));
    }

    let report_bytes = shell::run(&code, &payload);
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = stdout.write_all(&report_bytes).and_then(|_| stdout.flush()) {
        return report(&Error::Serialization(format!("cannot write report: {}", e)));
    }
    0
}

// ── endpoints ─────────────────────────────────────────────

fn run_endpoints(interfaces: PathBuf, contract: &str, json: bool) -> i32 {
    // Only interfaces are read; the binaries directory is never touched
    let registry = ContractRegistry::new(PathBuf::new(), interfaces);
    let interface = match registry.load_interface(contract) {
        Ok(i) => i,
        Err(e) => return report(&e),
    };

    if json {
        let listing: Vec<serde_json::Value> = interface
            .endpoints
            .iter()
            .map(|ep| {
                serde_json::json!({
                    "name": ep.name,
                    "signature": ep.signature(),
                    "doc": ep.doc,
                })
            })
            .collect();
        match serde_json::to_string_pretty(&listing) {
            Ok(text) => println!("{}", text),
            Err(e) => return report(&Error::Serialization(e.to_string())),
        }
    } else {
        println!("{} {}", "contract".bold(), interface.name.cyan());
        for ep in &interface.endpoints {
            match &ep.doc {
                Some(doc) => println!("  {}  {}", ep.signature(), doc.dimmed()),
                None => println!("  {}", ep.signature()),
            }
        }
    }
    0
}
