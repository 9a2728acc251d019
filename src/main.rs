//! # cb-admin CLI
//!
//! Design-document reconciliation and bulk document administration for
//! Couchbase buckets.
//!
//! ## Usage
//!
//! ```bash
//! cb-admin --config ./config/cb-admin.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cb-admin dd export` | Snapshot all design documents of a bucket to a file |
//! | `cb-admin dd diff` | Compare design documents of a bucket or file against a bucket |
//! | `cb-admin dd upgrade` | Diff, confirm, then install the differences |
//! | `cb-admin docs copy` | Copy documents selected by key prefix to another bucket |
//! | `cb-admin docs move` | Copy, then remove from the source |
//! | `cb-admin docs delete` | Remove documents selected by key prefix |
//! | `cb-admin docs dump` | Write selected documents as JSON lines |
//! | `cb-admin views create` | Create an administrative filter view |
//! | `cb-admin views remove` | Remove an administrative filter view |
//! | `cb-admin views cleanup` | Drop the administrative design document |
//!
//! ## Examples
//!
//! ```bash
//! # Snapshot production design docs
//! cb-admin dd export -s 10.0.2.16:8091 -b travel
//!
//! # What would change on staging?
//! cb-admin dd diff -s ddocs-travel-20240309T140507Z.json -d 10.0.2.20:8091 -B travel
//!
//! # Move every user document to another bucket
//! cb-admin docs move -s 10.0.2.16:8091 -b travel -d 10.0.2.16:8091 -B archive --prefix user::
//! ```

use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use cb_admin::admin_views::{cleanup_filter_views, create_filter_view, remove_filter_view};
use cb_admin::bulk::{run_bulk, run_dump, BulkMode, BulkOptions};
use cb_admin::config::{self, is_connection_string, ClusterConfig, Config};
use cb_admin::connection::{release, Connection};
use cb_admin::dd::{self, DesignSource, UpgradeOutcome};
use cb_admin::logging;
use cb_admin::progress::ProgressMode;
use cb_admin::report::{write_report, write_report_json};
use cb_admin_core::admin_view::{FilterMode, FilterSpec};
use cb_admin_core::diff::CompareOptions;
use clap::{Args, Parser, Subcommand};

/// cb-admin: design-document reconciliation and bulk document
/// administration for Couchbase buckets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Connection flags on the command line override the file.
#[derive(Parser)]
#[command(
    name = "cb-admin",
    about = "Design-document reconciliation and bulk document administration for Couchbase",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cb-admin.toml`. A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/cb-admin.toml")]
    config: PathBuf,

    /// Debug logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Design document management.
    Dd {
        #[command(subcommand)]
        action: DdAction,
    },

    /// Bulk document operations over an administrative filter view.
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },

    /// Administrative filter views.
    Views {
        #[command(subcommand)]
        action: ViewsAction,
    },
}

#[derive(Subcommand)]
enum DdAction {
    /// Snapshot every design document of the source bucket to a JSON file.
    Export {
        #[command(flatten)]
        src: SourceArgs,

        /// Output file. Defaults to `ddocs-<bucket>-<UTC timestamp>.json`.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Compare source design documents against the destination.
    ///
    /// `--src` is either a `host:port` connection string or a file
    /// written by `dd export`.
    Diff {
        #[command(flatten)]
        compare: CompareArgs,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Diff, confirm, then install every differing design document on
    /// the destination.
    Upgrade {
        #[command(flatten)]
        compare: CompareArgs,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum DocsAction {
    /// Copy selected documents into the destination bucket.
    Copy {
        #[command(flatten)]
        src: SourceArgs,
        #[command(flatten)]
        dst: DestinationArgs,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        bulk: BulkArgs,

        /// Replace documents that already exist on the destination.
        #[arg(long)]
        overwrite: bool,
    },

    /// Copy selected documents, then remove them from the source.
    Move {
        #[command(flatten)]
        src: SourceArgs,
        #[command(flatten)]
        dst: DestinationArgs,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        bulk: BulkArgs,

        /// Replace documents that already exist on the destination.
        #[arg(long)]
        overwrite: bool,
    },

    /// Remove selected documents from the source bucket.
    Delete {
        #[command(flatten)]
        src: SourceArgs,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        bulk: BulkArgs,
    },

    /// Write selected documents as JSON lines.
    Dump {
        #[command(flatten)]
        src: SourceArgs,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        bulk: BulkArgs,

        /// Output file. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Fetch the whole view in one query instead of paging. Only for
        /// selections that fit in memory.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum ViewsAction {
    /// Create the filter view for the given prefixes (no-op if present).
    Create {
        #[command(flatten)]
        src: SourceArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Remove the filter view for the given prefixes.
    Remove {
        #[command(flatten)]
        src: SourceArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Drop the administrative design document and its staging copy.
    Cleanup {
        #[command(flatten)]
        src: SourceArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Source cluster (`host:port`). Falls back to `[source].conn`.
    #[arg(short, long)]
    src: Option<String>,

    /// Source bucket. Falls back to `[source].bucket`.
    #[arg(short, long)]
    bucket: Option<String>,
}

#[derive(Args)]
struct DestinationArgs {
    /// Destination cluster (`host:port`). Falls back to `[destination].conn`.
    #[arg(short, long)]
    dst: Option<String>,

    /// Destination bucket. Falls back to `[destination].bucket`.
    #[arg(short = 'B', long)]
    dst_bucket: Option<String>,
}

#[derive(Args)]
struct CompareArgs {
    #[command(flatten)]
    src: SourceArgs,
    #[command(flatten)]
    dst: DestinationArgs,

    /// Only compare this design document (repeatable).
    #[arg(short, long = "include")]
    include: Vec<String>,

    /// Skip this design document (repeatable).
    #[arg(short, long = "exclude")]
    exclude: Vec<String>,
}

#[derive(Args)]
struct FilterArgs {
    /// Key prefix to select (repeatable). No prefix selects everything.
    #[arg(short, long = "prefix")]
    prefix: Vec<String>,

    /// Select keys matching none of the prefixes instead.
    #[arg(long)]
    not_matching: bool,
}

impl FilterArgs {
    fn spec(&self) -> FilterSpec {
        let mode = if self.not_matching {
            FilterMode::NotMatching
        } else {
            FilterMode::Matching
        };
        FilterSpec::new(self.prefix.iter().map(String::as_str), mode)
    }
}

#[derive(Args)]
struct BulkArgs {
    /// Rows per view page. Falls back to `[bulk].page_size`.
    #[arg(long)]
    page_size: Option<usize>,

    /// Items in flight per page (1 to 100).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Remove the filter view after a successful run.
    #[arg(long)]
    cleanup_view: bool,

    /// Progress output: off, human, or json. Defaults to human on a TTY.
    #[arg(long, value_enum)]
    progress: Option<ProgressMode>,
}

/// Resolve one side's connection string and cluster settings.
fn resolve(
    side: &str,
    base: &ClusterConfig,
    conn: Option<&str>,
    bucket: Option<&str>,
) -> Result<(String, ClusterConfig)> {
    let mut cluster = base.clone();
    if let Some(bucket) = bucket {
        cluster.bucket = bucket.to_string();
    }
    let conn = conn
        .map(str::to_string)
        .or_else(|| cluster.conn.clone())
        .with_context(|| format!("missing --{} connection string", side))?;
    Ok((conn, cluster))
}

fn open_source(cfg: &Config, args: &SourceArgs) -> Result<Connection> {
    let (conn, cluster) = resolve("src", &cfg.source, args.src.as_deref(), args.bucket.as_deref())?;
    Connection::open(&conn, &cluster, &cfg.retry)
}

fn open_destination(cfg: &Config, args: &DestinationArgs) -> Result<Connection> {
    let (conn, cluster) = resolve(
        "dst",
        &cfg.destination,
        args.dst.as_deref(),
        args.dst_bucket.as_deref(),
    )?;
    Connection::open(&conn, &cluster, &cfg.retry)
}

fn compare_options(args: &CompareArgs) -> CompareOptions {
    let opts = args
        .include
        .iter()
        .fold(CompareOptions::new(), |o, name| o.include(name.as_str()));
    args.exclude.iter().fold(opts, |o, name| o.exclude(name.as_str()))
}

fn bulk_options(
    cfg: &Config,
    filter: &FilterArgs,
    args: &BulkArgs,
    default_concurrency: usize,
) -> Result<BulkOptions> {
    let mut checked = cfg.clone();
    if let Some(page_size) = args.page_size {
        checked.bulk.page_size = page_size;
    }
    checked.bulk.mutation_concurrency = args.concurrency.unwrap_or(default_concurrency);
    config::validate(&checked).context("invalid bulk options")?;

    Ok(BulkOptions {
        filter: filter.spec(),
        admin_design_document: cfg.admin.design_document.clone(),
        page_size: checked.bulk.page_size,
        concurrency: checked.bulk.mutation_concurrency,
        progress_every: cfg.bulk.progress_every,
        cleanup_view: args.cleanup_view,
    })
}

/// Run a diff or upgrade, with `--src` naming either a bucket or a file.
async fn run_compare(cfg: &Config, args: &CompareArgs, verbose: bool, mode: CompareMode) -> Result<()> {
    let src_spec = args.src.src.clone().or_else(|| cfg.source.conn.clone());
    let src_conn = match src_spec.as_deref() {
        Some(s) if is_connection_string(s) => Some(open_source(cfg, &args.src)?),
        _ => None,
    };
    let file = match (&src_conn, src_spec) {
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => bail!("missing --src connection string or file"),
        (Some(_), _) => PathBuf::new(),
    };

    let dst = match open_destination(cfg, &args.dst) {
        Ok(dst) => dst,
        Err(e) => {
            let conns: Vec<&Connection> = src_conn.iter().collect();
            return release(Err(e), &conns).await;
        }
    };

    let source = match &src_conn {
        Some(conn) => DesignSource::Bucket(conn),
        None => DesignSource::File(&file),
    };
    let opts = compare_options(args);

    let result = async {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        match mode {
            CompareMode::Diff { json } => {
                let report = dd::run_diff(&source, &dst, &opts).await?;
                if json {
                    write_report_json(&mut out, &report)?;
                } else {
                    write_report(&mut out, &report, verbose)?;
                }
            }
            CompareMode::Upgrade { yes } => {
                let stdin = std::io::stdin();
                let mut input = stdin.lock();
                let outcome =
                    dd::run_upgrade(&source, &dst, &opts, verbose, yes, &mut input, &mut out)
                        .await?;
                if outcome == UpgradeOutcome::Declined {
                    writeln!(out, "Upgrade cancelled")?;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    let mut conns = vec![&dst];
    conns.extend(src_conn.iter());
    release(result, &conns).await
}

enum CompareMode {
    Diff { json: bool },
    Upgrade { yes: bool },
}

async fn run_docs(cfg: &Config, action: DocsAction) -> Result<()> {
    let (src_args, dst_args, filter, bulk, mode) = match &action {
        DocsAction::Copy {
            src,
            dst,
            filter,
            bulk,
            overwrite,
        } => (src, Some(dst), filter, bulk, Some(BulkMode::Copy { overwrite: *overwrite })),
        DocsAction::Move {
            src,
            dst,
            filter,
            bulk,
            overwrite,
        } => (src, Some(dst), filter, bulk, Some(BulkMode::Move { overwrite: *overwrite })),
        DocsAction::Delete { src, filter, bulk } => {
            (src, None, filter, bulk, Some(BulkMode::Delete))
        }
        DocsAction::Dump {
            src, filter, bulk, ..
        } => (src, None, filter, bulk, None),
    };

    let default_concurrency = match mode {
        Some(_) => cfg.bulk.mutation_concurrency,
        None => cfg.bulk.read_concurrency,
    };
    let opts = bulk_options(cfg, filter, bulk, default_concurrency)?;
    let progress = bulk.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let reporter = progress.reporter();

    let src = open_source(cfg, src_args)?;
    let dst = match dst_args.map(|d| open_destination(cfg, d)).transpose() {
        Ok(dst) => dst,
        Err(e) => return release(Err(e), &[&src]).await,
    };

    let result = match mode {
        Some(mode) => run_bulk(&src, dst.as_ref(), mode, &opts, reporter.as_ref()).await,
        None => {
            let (output, single_query) = match &action {
                DocsAction::Dump { output, all, .. } => (output.clone(), *all),
                _ => (None, false),
            };
            match output {
                Some(path) => match std::fs::File::create(&path) {
                    Ok(file) => {
                        run_dump(
                            &src,
                            &opts,
                            single_query,
                            BufWriter::new(file),
                            reporter.as_ref(),
                        )
                        .await
                    }
                    Err(e) => Err(anyhow::Error::new(e)
                        .context(format!("failed to create [{}]", path.display()))),
                },
                None => {
                    let stdout = std::io::stdout();
                    run_dump(
                        &src,
                        &opts,
                        single_query,
                        BufWriter::new(stdout.lock()),
                        reporter.as_ref(),
                    )
                    .await
                }
            }
        }
    };

    let result = result.map(|summary| {
        eprintln!(
            "{} items processed, {} skipped in {:.2}s (view {})",
            summary.processed,
            summary.skipped,
            summary.elapsed.as_secs_f64(),
            summary.view_id
        );
    });

    let mut conns = vec![&src];
    conns.extend(dst.iter());
    release(result, &conns).await
}

async fn run_views(cfg: &Config, action: ViewsAction) -> Result<()> {
    let admin = cfg.admin.design_document.as_str();
    match action {
        ViewsAction::Create { src, filter } => {
            let conn = open_source(cfg, &src)?;
            let result = create_filter_view(&conn, admin, &filter.spec())
                .await
                .map(|id| println!("{}", id))
                .map_err(anyhow::Error::from);
            release(result, &[&conn]).await
        }
        ViewsAction::Remove { src, filter } => {
            let conn = open_source(cfg, &src)?;
            let spec = filter.spec();
            let result = remove_filter_view(&conn, admin, &spec)
                .await
                .map(|removed| {
                    if removed {
                        println!("Removed view {}", spec.view_id());
                    } else {
                        println!("View {} not found", spec.view_id());
                    }
                })
                .map_err(anyhow::Error::from);
            release(result, &[&conn]).await
        }
        ViewsAction::Cleanup { src } => {
            let conn = open_source(cfg, &src)?;
            let result = cleanup_filter_views(&conn, admin)
                .await
                .map(|n| println!("Removed {} design document(s)", n));
            release(result, &[&conn]).await
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Dd { action } => match action {
            DdAction::Export { src, file } => {
                let conn = open_source(&cfg, &src)?;
                let result = dd::run_export(&conn, file.as_deref()).await.map(|(path, n)| {
                    println!("Exported {} design document(s) to {}", n, path.display());
                });
                release(result, &[&conn]).await?;
            }
            DdAction::Diff { compare, json } => {
                run_compare(&cfg, &compare, cli.verbose, CompareMode::Diff { json }).await?;
            }
            DdAction::Upgrade { compare, yes } => {
                run_compare(&cfg, &compare, cli.verbose, CompareMode::Upgrade { yes }).await?;
            }
        },
        Commands::Docs { action } => run_docs(&cfg, action).await?,
        Commands::Views { action } => run_views(&cfg, action).await?,
    }

    Ok(())
}
