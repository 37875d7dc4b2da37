use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use update_engine::cli::{Cli, Command, OutputFormat};
use update_engine::config::{self, RunnerConfig};
use update_engine::engine::{Engine, EngineContext, EngineDelegate, EngineSettings};
use update_engine::error::EngineError;
use update_engine::fetch::HttpFetcher;
use update_engine::logging;
use update_engine::paths;
use update_engine::progress::{OutputMode, UpdateProgress};
use update_engine::stats::StatsCollection;
use update_engine::ticket::{ExistenceChecker, Ticket};
use update_engine::ticket_store::{FileTicketStore, TicketStore};
use update_engine::update_info::UpdateInfo;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let output_format = resolve_output_format(&cli.output);
    let mode = resolve_output_mode(&output_format, cli.verbose, cli.quiet);

    // Tracing on stderr would corrupt indicatif's line tracking, so the
    // terminal layer is off while progress bars own the terminal.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("update_engine=debug,engine_runner=debug"),
        OutputMode::Normal | OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::from_default_env()
            .add_directive("update_engine=warn".parse().expect("valid log directive")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures debug, discards until a run activates it
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("update_engine=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(paths::config_path);
    let runner = config::load_config(&config_path)?;
    let store_path = cli.store.clone().unwrap_or_else(|| runner.store_path());
    let store: Arc<dyn TicketStore> = Arc::new(FileTicketStore::new(store_path));

    match cli.command {
        Command::List => list_tickets(store.as_ref(), &output_format)?,
        Command::Add {
            product_id,
            version,
            server_url,
            path,
            tag,
            version_from,
        } => {
            let checker = match path {
                Some(path) => ExistenceChecker::Path(path),
                None => ExistenceChecker::AlwaysTrue,
            };
            let mut ticket = Ticket::new(&product_id, &version, checker, &server_url);
            if let Some(tag) = tag {
                ticket = ticket.with_tag(tag);
            }
            if let Some([file, key]) = version_from.as_deref() {
                ticket = ticket.with_version_path(file, key);
            }
            store.store_ticket(ticket)?;
            println!("Registered {product_id} {version}");
        }
        Command::Delete { product_id } => {
            if !store.delete_ticket_for_product_id(&product_id)? {
                return Err(EngineError::TicketNotFound { product_id }.into());
            }
            println!("Removed {product_id}");
        }
        Command::DryRun { product } => {
            dry_run(&runner, store, product.as_deref(), &output_format).await?;
        }
        Command::Run {
            product,
            user_initiated,
        } => {
            let logs_dir = paths::logs_dir();
            std::fs::create_dir_all(&logs_dir).ok();
            file_handle.set_file(&logs_dir.join("engine-runner.log")).ok();

            run_updates(&runner, store, product.as_deref(), user_initiated, mode).await?;
        }
    }

    Ok(())
}

// ── list ────────────────────────────────────────────────────────────

#[derive(facet::Facet)]
struct TicketJson {
    product_id: String,
    version: String,
    server_url: String,
    existence_checker: String,
}

fn list_tickets(store: &dyn TicketStore, format: &OutputFormat) -> miette::Result<()> {
    let tickets = store.tickets()?;

    if matches!(format, OutputFormat::Json) {
        let rows: Vec<TicketJson> = tickets
            .iter()
            .map(|t| TicketJson {
                product_id: t.product_id().to_string(),
                version: t.determine_version(),
                server_url: t.server_url().to_string(),
                existence_checker: t.existence_checker().to_string(),
            })
            .collect();
        let json = facet_json::to_string(&rows).map_err(|e| miette::miette!("{e}"))?;
        println!("{json}");
        return Ok(());
    }

    if tickets.is_empty() {
        println!("No products registered.");
        return Ok(());
    }
    for ticket in &tickets {
        println!(
            "{}  {}  {}  [{}]",
            ticket.product_id(),
            ticket.determine_version(),
            ticket.server_url(),
            ticket.existence_checker()
        );
    }
    Ok(())
}

// ── engine setup ────────────────────────────────────────────────────

fn engine_settings(runner: &RunnerConfig) -> Result<EngineSettings, EngineError> {
    let fetcher = Arc::new(HttpFetcher::new(runner.download_timeout())?);
    let mut settings = EngineSettings::new(runner.download_dir(), fetcher);
    settings.install.script_prefix = runner.script_prefix().to_string();
    settings.install.script_log_dir = Some(runner.script_log_dir());
    Ok(settings)
}

async fn start(engine: &Engine, product: Option<&str>) -> Result<(), EngineError> {
    let run = async {
        match product {
            Some(id) => engine.update_product_with_product_id(id).await,
            None => engine.update_all_products().await,
        }
    };
    tokio::select! {
        result = run => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping update run");
            engine.stop_and_reset();
            Ok(())
        }
    }
}

// ── dry-run ─────────────────────────────────────────────────────────

/// Collects what would be installed and declines everything.
#[derive(Default)]
struct DryRunDelegate {
    available: Mutex<Vec<UpdateInfo>>,
}

impl DryRunDelegate {
    fn record(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        self.available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(products);
        Vec::new()
    }
}

impl EngineDelegate for DryRunDelegate {
    fn should_prefetch_products(&self, _: &EngineContext, _: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        Vec::new()
    }

    fn should_silently_update_products(
        &self,
        _: &EngineContext,
        products: Vec<UpdateInfo>,
    ) -> Vec<UpdateInfo> {
        self.record(products)
    }

    fn should_update_products(&self, _: &EngineContext, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        self.record(products)
    }
}

#[derive(facet::Facet)]
struct UpdateJson {
    product_id: String,
    version: Option<String>,
    codebase: String,
    size: u64,
}

async fn dry_run(
    runner: &RunnerConfig,
    store: Arc<dyn TicketStore>,
    product: Option<&str>,
    format: &OutputFormat,
) -> miette::Result<()> {
    let delegate = Arc::new(DryRunDelegate::default());
    let weak: Weak<dyn EngineDelegate> = Arc::downgrade(&delegate) as Weak<dyn EngineDelegate>;
    let context = EngineContext::new(engine_settings(runner)?)
        .with_params(runner.engine_params())
        .with_delegate(weak);
    let engine = Engine::new(store, context);

    start(&engine, product).await?;
    if !engine.context().was_successful() {
        return Err(miette::miette!("update check failed"));
    }

    let available = std::mem::take(
        &mut *delegate
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner),
    );

    if matches!(format, OutputFormat::Json) {
        let rows: Vec<UpdateJson> = available
            .iter()
            .map(|info| UpdateJson {
                product_id: info.product_id.clone(),
                version: info.shown_version().map(str::to_string),
                codebase: info.codebase_url.clone(),
                size: info.size,
            })
            .collect();
        let json = facet_json::to_string(&rows).map_err(|e| miette::miette!("{e}"))?;
        println!("{json}");
        return Ok(());
    }

    if available.is_empty() {
        println!("No updates available.");
    }
    for info in &available {
        println!(
            "{} {} -> {} ({} bytes)",
            info.product_id,
            info.shown_version().unwrap_or("?"),
            info.codebase_url,
            info.size
        );
    }
    Ok(())
}

// ── run ─────────────────────────────────────────────────────────────

/// Renders per-update progress and approves every update.
struct RunnerDelegate {
    progress: UpdateProgress,
    reboot_needed: Mutex<Vec<String>>,
}

impl EngineDelegate for RunnerDelegate {
    fn should_prefetch_products(&self, _: &EngineContext, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        if !products.is_empty() {
            self.progress
                .info(&format!("{} update(s) available", products.len()));
        }
        products
    }

    fn starting_update(&self, _: &EngineContext, update: &UpdateInfo) {
        let label = match update.shown_version() {
            Some(version) => format!("updating to {version}"),
            None => "updating".to_string(),
        };
        self.progress.start(&update.product_id, &label);
    }

    fn running_update(&self, _: &EngineContext, update: &UpdateInfo, progress: f32) {
        self.progress.set_progress(&update.product_id, progress);
    }

    fn finished_update(
        &self,
        _: &EngineContext,
        update: &UpdateInfo,
        was_success: bool,
        wants_reboot: bool,
    ) {
        let message = match (was_success, wants_reboot) {
            (true, true) => "updated, restart required",
            (true, false) => "updated",
            (false, _) => "update failed",
        };
        if wants_reboot {
            self.reboot_needed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(update.product_id.clone());
        }
        self.progress.finish(&update.product_id, was_success, message);
    }
}

async fn run_updates(
    runner: &RunnerConfig,
    store: Arc<dyn TicketStore>,
    product: Option<&str>,
    user_initiated: bool,
    mode: OutputMode,
) -> miette::Result<()> {
    let delegate = Arc::new(RunnerDelegate {
        progress: UpdateProgress::new(mode),
        reboot_needed: Mutex::new(Vec::new()),
    });
    let weak: Weak<dyn EngineDelegate> = Arc::downgrade(&delegate) as Weak<dyn EngineDelegate>;

    let stats_path: PathBuf = runner.stats_path();
    let stats = StatsCollection::open(&stats_path)?;

    let mut params = runner.engine_params();
    params.user_initiated = user_initiated;
    let context = EngineContext::new(engine_settings(runner)?)
        .with_params(params)
        .with_delegate(weak)
        .with_stats(Arc::new(stats));
    let engine = Engine::new(store, context);

    start(&engine, product).await?;

    let reboot = delegate
        .reboot_needed
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if !reboot.is_empty() {
        delegate
            .progress
            .println(&format!("Restart required for: {}", reboot.join(", ")));
    }

    if !engine.context().was_successful() {
        let log = paths::logs_dir().join("engine-runner.log");
        return Err(miette::miette!(
            "update run failed (see {} for details)",
            log.display()
        ));
    }
    delegate.progress.println("Update run complete.");
    Ok(())
}

// ── output mode ─────────────────────────────────────────────────────

/// Resolve `Auto` to a concrete format based on terminal detection.
fn resolve_output_format(format: &OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if std::io::stdout().is_terminal() {
                OutputFormat::Interactive
            } else {
                OutputFormat::Plain
            }
        }
        other => other.clone(),
    }
}

/// Map the resolved output format (plus `--verbose`/`--quiet` modifiers)
/// into the `OutputMode` used by `UpdateProgress`.
fn resolve_output_mode(format: &OutputFormat, verbose: bool, quiet: bool) -> OutputMode {
    match format {
        OutputFormat::Json => OutputMode::Quiet,
        OutputFormat::Plain | OutputFormat::Auto => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Plain
            }
        }
        OutputFormat::Interactive => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Normal
            }
        }
    }
}
