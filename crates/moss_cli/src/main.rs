//! `moss` command-line front end.
//!
//! # Responsibility
//! - Map subcommands onto `CapsuleService` calls.
//! - Print results as JSON on stdout and failures as JSON on stderr.

use clap::{Args, Parser, Subcommand};
use log::info;
use moss_core::{
    init_logging, BulkUpdateFields, CancellationToken, CapsuleDraft, CapsuleError, CapsuleFilter,
    CapsuleListQuery, CapsulePatch, CapsuleRef, CapsuleService, ComposeFormat, ComposeRequest,
    ComposeStoreTarget, ImportMode, LoggingOptions, SearchQuery, StoreConfig, StoreMode,
    StoreRequest,
};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "moss", version, about = "Local capsule store for agent context")]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "MOSS_DB", value_name = "PATH")]
    db: PathBuf,
    /// Directory for rolling log files; logging is off when unset
    #[arg(long, env = "MOSS_LOG_DIR", value_name = "DIR")]
    log_dir: Option<PathBuf>,
    /// trace|debug|info|warn|error
    #[arg(long, env = "MOSS_LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a capsule; text is read from stdin unless --text is given
    Store(StoreArgs),
    Fetch(FetchArgs),
    /// Replace text or metadata of an active capsule
    Update(UpdateArgs),
    /// Append text after a blank line
    Append(AppendArgs),
    Delete(RefArgs),
    List(ListArgs),
    /// Most recently updated capsule
    Latest(LatestArgs),
    Search(SearchArgs),
    Compose(ComposeArgs),
    BulkDelete(FilterArgs),
    BulkUpdate(BulkUpdateArgs),
    /// Hard-delete tombstoned capsules
    Purge(PurgeArgs),
    Export(ExportArgs),
    Import(ImportArgs),
}

#[derive(Args)]
struct RefArgs {
    #[arg(long, conflicts_with_all = ["workspace", "name"])]
    id: Option<String>,
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long)]
    name: Option<String>,
}

impl RefArgs {
    fn to_ref(&self) -> CapsuleRef {
        CapsuleRef {
            id: self.id.clone(),
            workspace: self.workspace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Args)]
struct StoreArgs {
    #[arg(long, default_value = "")]
    workspace: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    text: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    phase: Option<String>,
    #[arg(long)]
    role: Option<String>,
    /// error|replace
    #[arg(long, default_value = "error")]
    mode: String,
    /// Skip the required-sections check
    #[arg(long)]
    allow_thin: bool,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    target: RefArgs,
    #[arg(long)]
    include_deleted: bool,
}

#[derive(Args)]
struct UpdateArgs {
    #[command(flatten)]
    target: RefArgs,
    #[arg(long)]
    title: Option<String>,
    /// New text; `-` reads stdin
    #[arg(long)]
    text: Option<String>,
    /// Replaces all tags
    #[arg(long = "tag")]
    tags: Option<Vec<String>>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    phase: Option<String>,
    #[arg(long)]
    role: Option<String>,
    #[arg(long)]
    allow_thin: bool,
}

#[derive(Args)]
struct AppendArgs {
    #[command(flatten)]
    target: RefArgs,
    #[arg(long)]
    text: Option<String>,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    name_prefix: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    phase: Option<String>,
    #[arg(long)]
    role: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> CapsuleFilter {
        CapsuleFilter {
            workspace: self.workspace.clone(),
            tag: self.tag.clone(),
            name_prefix: self.name_prefix.clone(),
            run_id: self.run_id.clone(),
            phase: self.phase.clone(),
            role: self.role.clone(),
        }
    }
}

#[derive(Args)]
struct ListArgs {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long)]
    include_deleted: bool,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Args)]
struct LatestArgs {
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long)]
    include_deleted: bool,
}

#[derive(Args)]
struct SearchArgs {
    query: String,
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long)]
    include_deleted: bool,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Args)]
struct ComposeArgs {
    /// Capsule refs: `<id>` or `<workspace>/<name>`
    #[arg(required = true)]
    refs: Vec<String>,
    /// markdown|json
    #[arg(long, default_value = "markdown")]
    format: String,
    /// Keep only these section headings
    #[arg(long = "section")]
    sections: Vec<String>,
    /// Persist the bundle under this name
    #[arg(long)]
    store_name: Option<String>,
    #[arg(long, default_value = "")]
    store_workspace: String,
    #[arg(long)]
    store_title: Option<String>,
    #[arg(long, default_value = "error")]
    store_mode: String,
    #[arg(long)]
    allow_thin: bool,
}

#[derive(Args)]
struct BulkUpdateArgs {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long = "set-tag")]
    set_tags: Option<Vec<String>>,
    #[arg(long)]
    set_source: Option<String>,
    #[arg(long)]
    set_run_id: Option<String>,
    #[arg(long)]
    set_phase: Option<String>,
    #[arg(long)]
    set_role: Option<String>,
}

#[derive(Args)]
struct PurgeArgs {
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long)]
    older_than_days: Option<u32>,
}

#[derive(Args)]
struct ExportArgs {
    /// Absolute output path; stdout when omitted
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long)]
    include_deleted: bool,
}

#[derive(Args)]
struct ImportArgs {
    /// Absolute JSONL path; stdin when omitted
    #[arg(long = "in", value_name = "PATH")]
    input: Option<PathBuf>,
    /// error|replace|rename
    #[arg(long, default_value = "error")]
    mode: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(log_dir) = cli.log_dir.as_ref() {
        let options = LoggingOptions {
            level: cli.log_level.clone(),
            log_dir: log_dir.clone(),
            echo_stderr: true,
        };
        if let Err(err) = init_logging(&options) {
            eprintln!("moss: {err}");
            return ExitCode::from(2);
        }
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let envelope = ErrorEnvelope {
                error: ErrorBody {
                    code: err.code().as_str(),
                    message: err.to_string(),
                },
            };
            match serde_json::to_string(&envelope) {
                Ok(line) => eprintln!("{line}"),
                Err(_) => eprintln!("moss: {err}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CapsuleError> {
    let config = StoreConfig::from_env()
        .map_err(|err| CapsuleError::InvalidRequest(err.to_string()))?;
    let mut service = CapsuleService::open(&cli.db, config)?;
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Store(args) => {
            let text = text_or_stdin(args.text)?;
            let request = StoreRequest {
                draft: CapsuleDraft {
                    workspace: args.workspace,
                    name: args.name,
                    title: args.title,
                    text,
                    tags: args.tags,
                    source: args.source,
                    run_id: args.run_id,
                    phase: args.phase,
                    role: args.role,
                },
                mode: args.mode.parse::<StoreMode>()?,
                allow_thin: args.allow_thin,
            };
            print_json(&service.store(request)?)
        }
        Commands::Fetch(args) => {
            print_json(&service.fetch(&args.target.to_ref(), args.include_deleted)?)
        }
        Commands::Update(args) => {
            let text = match args.text {
                Some(text) if text == "-" => Some(read_stdin()?),
                other => other,
            };
            let patch = CapsulePatch {
                title: args.title,
                text,
                tags: args.tags,
                source: args.source,
                run_id: args.run_id,
                phase: args.phase,
                role: args.role,
                allow_thin: args.allow_thin,
            };
            print_json(&service.update(&args.target.to_ref(), &patch)?)
        }
        Commands::Append(args) => {
            let text = text_or_stdin(args.text)?;
            print_json(&service.append(&args.target.to_ref(), &text)?)
        }
        Commands::Delete(args) => print_json(&service.delete(&args.to_ref())?),
        Commands::List(args) => {
            let query = CapsuleListQuery {
                filter: args.filter.to_filter(),
                include_deleted: args.include_deleted,
                limit: args.limit,
                offset: args.offset,
            };
            print_json(&service.list(&query)?)
        }
        Commands::Latest(args) => {
            print_json(&service.latest(args.workspace.as_deref(), args.include_deleted)?)
        }
        Commands::Search(args) => {
            let query = SearchQuery {
                text: args.query,
                filter: args.filter.to_filter(),
                include_deleted: args.include_deleted,
                limit: args.limit,
                offset: args.offset,
            };
            print_json(&service.search(&query)?)
        }
        Commands::Compose(args) => {
            let store = match args.store_name {
                Some(name) => Some(ComposeStoreTarget {
                    workspace: args.store_workspace,
                    name,
                    title: args.store_title,
                    mode: args.store_mode.parse::<StoreMode>()?,
                    tags: Vec::new(),
                    allow_thin: args.allow_thin,
                }),
                None => None,
            };
            let request = ComposeRequest {
                refs: args.refs.iter().map(|raw| parse_ref(raw)).collect(),
                format: args.format.parse::<ComposeFormat>()?,
                sections: args.sections,
                store,
            };
            print_json(&service.compose(&request, &cancel)?)
        }
        Commands::BulkDelete(args) => print_json(&service.bulk_delete(&args.to_filter())?),
        Commands::BulkUpdate(args) => {
            let fields = BulkUpdateFields {
                tags: args.set_tags,
                source: args.set_source,
                run_id: args.set_run_id,
                phase: args.set_phase,
                role: args.set_role,
            };
            print_json(&service.bulk_update(&args.filter.to_filter(), &fields)?)
        }
        Commands::Purge(args) => {
            print_json(&service.purge(args.workspace.as_deref(), args.older_than_days)?)
        }
        Commands::Export(args) => {
            let summary = match args.out.as_ref() {
                Some(path) => {
                    service.export_file(path, args.workspace.as_deref(), args.include_deleted)?
                }
                None => service.export_jsonl(
                    std::io::stdout().lock(),
                    args.workspace.as_deref(),
                    args.include_deleted,
                )?,
            };
            info!(
                "event=cli_export module=cli status=ok exported={}",
                summary.exported
            );
            if args.out.is_some() {
                print_json(&summary)?;
            }
            Ok(())
        }
        Commands::Import(args) => {
            let mode = args.mode.parse::<ImportMode>()?;
            let result = match args.input.as_ref() {
                Some(path) => service.import_file(path, mode, &cancel)?,
                None => service.import_jsonl(std::io::stdin().lock(), mode, &cancel)?,
            };
            print_json(&result)
        }
    }
}

/// `<workspace>/<name>` is a name ref; anything else is treated as an ID.
fn parse_ref(raw: &str) -> CapsuleRef {
    match raw.split_once('/') {
        Some((workspace, name)) => CapsuleRef::by_name(workspace, name),
        None => CapsuleRef::by_id(raw),
    }
}

fn text_or_stdin(text: Option<String>) -> Result<String, CapsuleError> {
    match text {
        Some(text) if text != "-" => Ok(text),
        _ => read_stdin(),
    }
}

fn read_stdin() -> Result<String, CapsuleError> {
    let mut buffer = String::new();
    std::io::stdin()
        .read_to_string(&mut buffer)
        .map_err(|err| CapsuleError::InvalidRequest(format!("cannot read stdin: {err}")))?;
    Ok(buffer)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CapsuleError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| CapsuleError::Internal(err.to_string()))?;
    println!("{rendered}");
    Ok(())
}
