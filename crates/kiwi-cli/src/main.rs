// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use kiwi_core::{ErrorKind, ItemType, Source};
use kiwi_kernel::Kernel;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Exit code for success.
const EXIT_SUCCESS: i32 = 0;
/// Exit code for a generic (unmapped) kernel error.
const EXIT_GENERIC_ERROR: i32 = 1;
/// Exit code for a usage/argument error.
const EXIT_USAGE_ERROR: i32 = 2;
/// Exit code for `not_found`.
const EXIT_NOT_FOUND: i32 = 3;
/// Exit code for `permission_denied`.
const EXIT_PERMISSION_DENIED: i32 = 4;
/// Exit code for `integrity_failed`.
const EXIT_INTEGRITY_FAILED: i32 = 5;
/// Exit code for `budget_exceeded`.
const EXIT_BUDGET_EXCEEDED: i32 = 6;

#[derive(Parser, Debug)]
#[command(name = "kiwi", version, about = "kiwi kernel CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Path to a kernel config file (defaults to the kernel's own search order).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project root to resolve `.ai/` content under (defaults to none — user/package roots only).
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Filename-substring search over project/user/package content roots.
    Search {
        #[arg(value_enum)]
        item_type: ItemTypeArg,
        query: String,
        #[arg(long, value_enum)]
        source: Option<SourceArg>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Resolve, parse, and integrity-verify one artifact.
    Load {
        #[arg(value_enum)]
        item_type: ItemTypeArg,
        item_id: String,
        #[arg(long, value_enum)]
        source: Option<SourceArg>,
    },

    /// Run, create, update, or sign a directive/tool/knowledge artifact.
    Execute {
        #[arg(value_enum)]
        item_type: ItemTypeArg,
        /// `run`, `create`, `update`, or `sign`.
        action: String,
        item_id: String,
        /// JSON object of parameters (defaults to `{}`).
        #[arg(long)]
        parameters: Option<String>,
        /// Project root write actions resolve relative to.
        #[arg(long)]
        project_path: Option<PathBuf>,
    },

    /// Print static help text for a topic (search, load, execute, directive, tool).
    Help {
        #[arg(default_value = "")]
        topic: String,
    },

    /// Run the stdio request/response server over stdin/stdout.
    Serve,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ItemTypeArg {
    Directive,
    Tool,
    Knowledge,
}

impl From<ItemTypeArg> for ItemType {
    fn from(v: ItemTypeArg) -> Self {
        match v {
            ItemTypeArg::Directive => ItemType::Directive,
            ItemTypeArg::Tool => ItemType::Tool,
            ItemTypeArg::Knowledge => ItemType::Knowledge,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Project,
    User,
    Package,
}

impl From<SourceArg> for Source {
    fn from(v: SourceArg) -> Self {
        match v {
            SourceArg::Project => Source::Project,
            SourceArg::User => Source::User,
            SourceArg::Package => Source::Package,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { EnvFilter::new("kiwi=debug") } else { EnvFilter::new("kiwi=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let kernel = match Kernel::new(cli.config.as_deref(), cli.project_root.clone()) {
        Ok(kernel) => kernel,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_GENERIC_ERROR);
        }
    };
    for warning in &kernel.config_warnings {
        tracing::warn!("{warning}");
    }

    let exit_code = match cli.command {
        Commands::Search { item_type, query, source, limit } => {
            cmd_search(&kernel, item_type.into(), &query, source.map(Into::into), limit)
        }
        Commands::Load { item_type, item_id, source } => {
            cmd_load(&kernel, item_type.into(), &item_id, source.map(Into::into)).await
        }
        Commands::Execute { item_type, action, item_id, parameters, project_path } => {
            cmd_execute(&kernel, item_type.into(), &action, &item_id, parameters, project_path).await
        }
        Commands::Help { topic } => {
            println!("{}", kernel.help(&topic));
            EXIT_SUCCESS
        }
        Commands::Serve => cmd_serve(&kernel).await,
    };

    std::process::exit(exit_code);
}

fn cmd_search(kernel: &Kernel, item_type: ItemType, query: &str, source: Option<Source>, limit: usize) -> i32 {
    let results = kernel.search(item_type, query, source, limit);
    let json: Vec<Value> = results
        .into_iter()
        .map(|r| serde_json::json!({"id": r.id, "item_type": r.item_type, "source": r.source, "path": r.path}))
        .collect();
    print_json(&json);
    EXIT_SUCCESS
}

async fn cmd_load(kernel: &Kernel, item_type: ItemType, item_id: &str, source: Option<Source>) -> i32 {
    match kernel.load(item_type, item_id, source).await {
        Ok(item) => {
            let payload = match item.payload {
                kiwi_dispatch::LoadedPayload::Tool(m) => serde_json::to_value(m).expect("tool manifest serializes"),
                kiwi_dispatch::LoadedPayload::Directive(d) => serde_json::to_value(d).expect("directive serializes"),
                kiwi_dispatch::LoadedPayload::Knowledge(v) => v,
            };
            print_json(&serde_json::json!({
                "source": item.source,
                "path": item.path,
                "verified": item.verification.verified,
                "payload": payload,
            }));
            EXIT_SUCCESS
        }
        Err(e) => print_error(&e.kind, &e.to_envelope()),
    }
}

async fn cmd_execute(
    kernel: &Kernel,
    item_type: ItemType,
    action: &str,
    item_id: &str,
    parameters: Option<String>,
    project_path: Option<PathBuf>,
) -> i32 {
    let parameters = match parameters {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("error: --parameters is not valid JSON: {e}");
                return EXIT_USAGE_ERROR;
            }
        },
        None => serde_json::json!({}),
    };

    match kernel.execute(item_type, action, item_id, parameters, project_path.as_deref(), None).await {
        Ok(result) => {
            print_json(&result);
            EXIT_SUCCESS
        }
        Err(e) => print_error(&e.kind, &e.to_envelope()),
    }
}

async fn cmd_serve(kernel: &Kernel) -> i32 {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    match kernel.serve_stdio(stdin, stdout).await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_GENERIC_ERROR
        }
    }
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).expect("value always serializes"));
}

fn print_error(kind: &ErrorKind, envelope: &Value) -> i32 {
    eprintln!("{}", serde_json::to_string_pretty(envelope).expect("envelope always serializes"));
    match kind {
        ErrorKind::NotFound => EXIT_NOT_FOUND,
        ErrorKind::PermissionDenied => EXIT_PERMISSION_DENIED,
        ErrorKind::IntegrityFailed => EXIT_INTEGRITY_FAILED,
        ErrorKind::BudgetExceeded => EXIT_BUDGET_EXCEEDED,
        ErrorKind::InvalidArgument | ErrorKind::UnknownOperation => EXIT_USAGE_ERROR,
        _ => EXIT_GENERIC_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_mapping() {
        let ok = serde_json::json!({});
        assert_eq!(print_error(&ErrorKind::NotFound, &ok), EXIT_NOT_FOUND);
        assert_eq!(print_error(&ErrorKind::PermissionDenied, &ok), EXIT_PERMISSION_DENIED);
        assert_eq!(print_error(&ErrorKind::IntegrityFailed, &ok), EXIT_INTEGRITY_FAILED);
        assert_eq!(print_error(&ErrorKind::BudgetExceeded, &ok), EXIT_BUDGET_EXCEEDED);
        assert_eq!(print_error(&ErrorKind::InvalidArgument, &ok), EXIT_USAGE_ERROR);
        assert_eq!(print_error(&ErrorKind::UnknownOperation, &ok), EXIT_USAGE_ERROR);
        assert_eq!(print_error(&ErrorKind::NetworkError, &ok), EXIT_GENERIC_ERROR);
    }

    #[test]
    fn item_type_arg_maps_onto_core_item_type() {
        assert_eq!(ItemType::from(ItemTypeArg::Directive), ItemType::Directive);
        assert_eq!(ItemType::from(ItemTypeArg::Tool), ItemType::Tool);
        assert_eq!(ItemType::from(ItemTypeArg::Knowledge), ItemType::Knowledge);
    }
}
