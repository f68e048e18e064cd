use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use rowmirror::backup;
use rowmirror::codec;
use rowmirror::config::{MirrorSettings, Settings};
use rowmirror::io::csv_import;
use rowmirror::mirror::discovery::{self, CommandStarter, SqlProbe};
use rowmirror::mirror::{self, RelationalMirror};
use rowmirror::model::{Schema, SheetRow};
use rowmirror::monitor::Monitor;
use rowmirror::sync::{BatchSummary, MirrorStatus, MutationOutcome, SyncOrchestrator};
use rowmirror::{Result, StoreError, logging};
use tokio::sync::watch;
use tracing::debug;

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    logging::init()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(cli))
}

async fn execute(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(Settings::default_config_path);
    let settings = Settings::load(Some(&config_path))?;
    let workbook = cli
        .workbook
        .clone()
        .unwrap_or_else(|| settings.default_file_path.clone());
    let sheet = cli
        .sheet
        .clone()
        .unwrap_or_else(|| settings.default_sheet_name.clone());

    if let Command::Discover = cli.command {
        return discover(settings, &config_path, &sheet).await;
    }

    let schema = Schema::production_entry();
    let mut orchestrator = SyncOrchestrator::new(&workbook, &sheet, schema.clone());
    if let Some(config) = settings.mirror_config(&sheet)? {
        orchestrator = orchestrator.with_mirror(RelationalMirror::new(config, schema)?);
    }
    if let MirrorStatus::Failed(reason) = orchestrator.prepare().await? {
        eprintln!("warning: mirror unavailable: {reason}");
    }

    match cli.command {
        Command::Import { csv } => {
            auto_backup(&settings, &workbook)?;
            report_batch("imported", &orchestrator.import_csv(&csv).await?);
        }
        Command::Export => {
            report_batch("exported", &orchestrator.push_to_mirror().await?);
        }
        Command::Pull => {
            auto_backup(&settings, &workbook)?;
            let rows = orchestrator.pull_from_mirror().await?;
            println!("replaced sheet '{sheet}' with {rows} mirror rows");
        }
        Command::Backup => {
            let copy = backup::backup_workbook(&workbook, &settings.backup_dir)?;
            println!("workbook backup: {}", copy.display());
            if let Some(mirror) = orchestrator.mirror() {
                let dump = mirror.dump(&settings.backup_dir).await?;
                println!("mirror backup: {}", dump.display());
            }
            let removed = backup::prune_backups(&settings.backup_dir, settings.backup_retention_days)?;
            if removed > 0 {
                println!("removed {removed} expired backups");
            }
        }
        Command::Restore { file } => {
            let mirror = orchestrator.mirror().ok_or_else(|| {
                StoreError::Validation("no mirror database is configured".into())
            })?;
            let script = match file {
                Some(file) => file,
                None => mirror::dump_files(&settings.backup_dir, mirror.config().table())?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        StoreError::NotFound(format!(
                            "mirror backup in {}",
                            settings.backup_dir.display()
                        ))
                    })?,
            };
            println!("restoring from {}", script.display());
            report_batch("restored", &mirror.restore(&script).await?);
        }
        Command::Status => {
            println!("workbook: {} (sheet '{sheet}')", workbook.display());
            println!("data rows: {}", orchestrator.rows()?.len());
            match orchestrator.mirror() {
                None => println!("mirror: not configured"),
                Some(mirror) => {
                    let info = mirror.server_info().await?;
                    println!("mirror: {:?} server {}", mirror.config().dialect(), info.version);
                    println!("database: {}", info.database.as_deref().unwrap_or("-"));
                    println!("table {}: {} rows", mirror.config().table(), mirror.count().await?);
                }
            }
        }
        Command::Show => print_rows(&orchestrator.rows()?),
        Command::Search { keyword } => print_rows(&orchestrator.search(&keyword)?),
        Command::Add { values } => {
            let record = codec::decode(&csv_import::split_line(&values)?, orchestrator.schema());
            report_outcome("added", &orchestrator.add(&record).await?);
        }
        Command::Update { row, values } => {
            let record = codec::decode(&csv_import::split_line(&values)?, orchestrator.schema());
            match orchestrator.update(row, &record).await? {
                Some(outcome) => report_outcome("updated", &outcome),
                None => return Err(StoreError::NotFound(format!("row {row}"))),
            }
        }
        Command::Delete { row } => match orchestrator.delete(row).await? {
            Some(outcome) => report_outcome("deleted", &outcome),
            None => return Err(StoreError::NotFound(format!("row {row}"))),
        },
        Command::Clear { yes } => {
            if !yes {
                return Err(StoreError::Validation(
                    "refusing to delete every row without --yes".into(),
                ));
            }
            auto_backup(&settings, &workbook)?;
            report_batch("deleted", &orchestrator.delete_all().await?);
        }
        Command::Monitor { interval_ms } => {
            let (shutdown, signal) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() && shutdown.send(true).is_err() {
                    debug!("monitor already stopped");
                }
            });
            println!("watching {} (Ctrl+C to stop)", workbook.display());
            let monitor = Monitor::new(&workbook, &sheet, Duration::from_millis(interval_ms));
            monitor
                .run(
                    |rows| match rows {
                        Ok(rows) => print_rows(&rows),
                        Err(error) => eprintln!("error: {error}"),
                    },
                    signal,
                )
                .await;
        }
        Command::Discover => {}
    }

    Ok(())
}

/// Runs the opt-in credential search and stores the result as the mirror URL.
async fn discover(mut settings: Settings, config_path: &Path, sheet: &str) -> Result<()> {
    let discovery_settings = settings
        .discovery
        .clone()
        .filter(|discovery| discovery.enabled)
        .ok_or_else(|| {
            StoreError::Validation("credential discovery is disabled in the configuration".into())
        })?;
    let candidates = if discovery_settings.candidates.is_empty() {
        discovery::common_local_profiles()
    } else {
        discovery_settings.candidates.clone()
    };

    let probe = SqlProbe::new(Duration::from_secs(5));
    let starter = CommandStarter::new(discovery_settings.service_commands.clone());
    let starter = discovery_settings.start_service.then_some(&starter);
    let profile = discovery::discover_connection(&candidates, &probe, starter, Duration::from_secs(3))
        .await
        .ok_or_else(|| StoreError::NotFound("working database credentials".into()))?;

    mirror::ensure_database(
        &profile.server_url(),
        &discovery_settings.database,
        Duration::from_secs(10),
    )
    .await?;
    let url = profile.with_database(discovery_settings.database.clone()).url();

    match &mut settings.mirror {
        Some(mirror) => mirror.url = url,
        None => {
            let mut mirror = MirrorSettings::new(url);
            mirror.table = Some(sheet.to_string());
            settings.mirror = Some(mirror);
        }
    }
    settings.save(config_path)?;
    println!("mirror connection saved to {}", config_path.display());
    Ok(())
}

fn auto_backup(settings: &Settings, workbook: &Path) -> Result<()> {
    if settings.auto_backup && workbook.is_file() {
        backup::backup_workbook(workbook, &settings.backup_dir)?;
        backup::prune_backups(&settings.backup_dir, settings.backup_retention_days)?;
    }
    Ok(())
}

fn print_rows(rows: &[SheetRow]) {
    for row in rows {
        println!("{:>5}  {}", row.index, row.values.join("\t"));
    }
    println!("{} rows", rows.len());
}

fn report_outcome(action: &str, outcome: &MutationOutcome) {
    let id = outcome
        .id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{action} row {} (id {id}, {})", outcome.row_index, outcome.mirror);
}

fn report_batch(action: &str, summary: &BatchSummary) {
    println!("{action}: {} succeeded, {} failed", summary.succeeded, summary.failed);
    for failure in &summary.failures {
        println!("  row {}: {}", failure.row, failure.reason);
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Keep a spreadsheet of production entries and its database mirror in sync."
)]
struct Cli {
    /// Settings file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workbook file; overrides the configured default.
    #[arg(long, global = true)]
    workbook: Option<PathBuf>,

    /// Sheet name; overrides the configured default.
    #[arg(long, global = true)]
    sheet: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add every line of a CSV file as a new row.
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Copy every sheet row into the mirror database.
    Export,
    /// Replace the sheet rows with the mirror database content.
    Pull,
    /// Back up the workbook (and the mirror table) and prune old backups.
    Backup,
    /// Replace the mirror table content with a dump; the newest dump in
    /// the backup directory when no file is given.
    Restore {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Test the mirror connection and print row counts.
    Status,
    /// Print every data row.
    Show,
    /// Print rows containing a keyword.
    Search {
        #[arg(long)]
        keyword: String,
    },
    /// Add one row from comma-separated values.
    Add {
        #[arg(long)]
        values: String,
    },
    /// Replace the values of an existing row.
    Update {
        #[arg(long)]
        row: u32,
        #[arg(long)]
        values: String,
    },
    /// Delete one row.
    Delete {
        #[arg(long)]
        row: u32,
    },
    /// Delete every data row, keeping the header.
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Re-print the sheet whenever the workbook file changes.
    Monitor {
        #[arg(long, default_value_t = 300)]
        interval_ms: u64,
    },
    /// Search for working database credentials and save them.
    Discover,
}
