/*!
modvault CLI - command-line front end for the modvault core engine.

Installs and removes mods, manages save backups and soundpacks under a game
root directory.
*/

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use modvault_core::{
    init_observability, BackgroundTask, ChannelProgress, LayoutConfig, ProgressSink,
    RegistryManager, Snapshot, SnapshotManager, SoundpackManager, SqliteStore,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use tabled::{Table, Tabled};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "modvault")]
#[command(about = "Manage game mods, save backups and soundpacks")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Game root directory holding mods, saves, backups and sounds
    #[arg(short, long, global = true, env = "MODVAULT_ROOT", default_value = ".")]
    root: PathBuf,

    /// Layout configuration file (JSON); overrides the default layout under --root
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print the operation counters in Prometheus text format when done
    #[cfg(feature = "metrics")]
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install, remove and list mods
    #[command(subcommand)]
    Mod(ModCommand),
    /// Create, restore and organize save backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Install, remove and list soundpacks
    #[command(subcommand)]
    Soundpack(SoundpackCommand),
    /// Show the layout and a summary of installed content
    Status,
}

#[derive(Subcommand)]
enum ModCommand {
    /// Install or reinstall a mod from a .zip archive or a directory
    Install { source: PathBuf },
    /// Uninstall a mod; its files are moved to the trash
    Uninstall { name: String },
    /// List installed mods
    List {
        /// Show every tracked file
        #[arg(short, long)]
        detailed: bool,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Back up the current save directory
    Create,
    /// List backups, newest first
    List,
    /// Replace the current saves with a backup
    Restore {
        name: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Rename a backup
    Rename { name: String, new_name: String },
    /// Permanently delete a backup
    Delete {
        name: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum SoundpackCommand {
    /// Copy a soundpack directory into the sound directory
    Install { source: PathBuf },
    /// List installed soundpacks
    List,
    /// Permanently delete a soundpack
    Delete {
        name: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct ModRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Files")]
    files: usize,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Installed")]
    created: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "Mod")]
    package: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "SHA-256")]
    hash: String,
}

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Modified")]
    modified: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    if cli.json_logs {
        init_observability(true)?;
    } else {
        init_logging(cli.verbose);
    }

    let layout = resolve_layout(&cli)?;
    debug!(?layout, "Resolved layout");

    #[cfg(feature = "metrics")]
    let print_metrics = cli.metrics;

    let result = match cli.command {
        Commands::Mod(command) => run_mod(command, layout),
        Commands::Backup(command) => run_backup(command, layout),
        Commands::Soundpack(command) => run_soundpack(command, layout),
        Commands::Status => status(layout),
    };

    #[cfg(feature = "metrics")]
    if print_metrics {
        if let Some(metrics) = modvault_core::VaultMetrics::global() {
            eprintln!("{}", metrics.gather_metrics()?);
        }
    }

    result
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn resolve_layout(cli: &Cli) -> Result<LayoutConfig, anyhow::Error> {
    let layout = match &cli.config {
        Some(path) => LayoutConfig::from_json_file(path)
            .with_context(|| format!("loading layout from {}", path.display()))?,
        None => LayoutConfig::under_root(&cli.root),
    };
    layout.validate()?;
    layout.ensure_dirs()?;
    Ok(layout)
}

fn registry(layout: LayoutConfig) -> Result<Arc<RegistryManager>, anyhow::Error> {
    let store = Arc::new(SqliteStore::open(&layout.database_path)?);
    Ok(Arc::new(RegistryManager::new(store, layout)?))
}

fn run_mod(command: ModCommand, layout: LayoutConfig) -> Result<(), anyhow::Error> {
    let registry = registry(layout)?;

    match command {
        ModCommand::Install { source } => {
            let package = run_with_progress("Installing", |sink| {
                registry.install_task(source.clone(), sink)
            })?;
            println!(
                "✓ Installed '{}' ({} files)",
                package.name,
                package.files.len()
            );
        }
        ModCommand::Uninstall { name } => {
            let package = registry
                .find_package_by_name(&name)?
                .ok_or_else(|| anyhow!("no installed mod named '{name}'"))?;
            let outcome = registry.uninstall(&package, |trashed| {
                info!(trashed = %trashed.display(), "Mod moved to trash");
            })?;
            match outcome.trashed {
                Some(path) => println!("✓ Uninstalled '{name}', files moved to {}", path.display()),
                None => println!("✓ Uninstalled '{name}' (its directory was already gone)"),
            }
        }
        ModCommand::List { detailed } => {
            let packages = registry.list_packages()?;
            if packages.is_empty() {
                println!("No mods installed");
                return Ok(());
            }

            if detailed {
                let rows: Vec<FileRow> = packages
                    .iter()
                    .flat_map(|p| {
                        p.files.iter().map(move |f| FileRow {
                            package: p.name.clone(),
                            path: f.path.clone(),
                            hash: f.hash.clone(),
                        })
                    })
                    .collect();
                println!("{}", Table::new(rows));
            } else {
                let rows: Vec<ModRow> = packages
                    .iter()
                    .map(|p| ModRow {
                        name: p.name.clone(),
                        files: p.files.len(),
                        size: format_size(registry.package_size(p)),
                        created: format_timestamp(p.created_at),
                        updated: format_timestamp(p.updated_at),
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
        }
    }
    Ok(())
}

fn run_backup(command: BackupCommand, layout: LayoutConfig) -> Result<(), anyhow::Error> {
    let snapshots = SnapshotManager::new(layout)?;

    match command {
        BackupCommand::Create => {
            let snapshot = run_with_progress("Backing up", |sink| snapshots.backup(sink))?;
            println!("✓ Created backup {} ({})", snapshot.name, format_size(snapshot.size));
        }
        BackupCommand::List => {
            let rows: Vec<EntryRow> = snapshots
                .list()?
                .into_iter()
                .map(|s| EntryRow {
                    name: s.name,
                    size: format_size(s.size),
                    modified: format_timestamp(s.modified),
                })
                .collect();
            if rows.is_empty() {
                println!("No backups found");
            } else {
                println!("{}", Table::new(rows));
            }
        }
        BackupCommand::Restore { name, force } => {
            let snapshot = find_snapshot(&snapshots, &name)?;
            if !force && !confirm(&format!("Replace the current saves with '{}'?", snapshot.name))? {
                println!("Restore cancelled");
                return Ok(());
            }
            run_with_progress("Restoring", |sink| snapshots.restore(&snapshot, sink))?;
            println!("✓ Restored {}; previous saves were moved to the trash", snapshot.name);
        }
        BackupCommand::Rename { name, new_name } => {
            let snapshot = find_snapshot(&snapshots, &name)?;
            let renamed = snapshots.rename(&snapshot, &new_name)?;
            println!("✓ Renamed {} to {}", snapshot.name, renamed.name);
        }
        BackupCommand::Delete { name, force } => {
            let snapshot = find_snapshot(&snapshots, &name)?;
            if !force
                && !confirm(&format!(
                    "Permanently delete backup '{}'? This cannot be undone",
                    snapshot.name
                ))?
            {
                println!("Deletion cancelled");
                return Ok(());
            }
            snapshots.delete(&snapshot)?;
            println!("✓ Backup deleted");
        }
    }
    Ok(())
}

fn run_soundpack(command: SoundpackCommand, layout: LayoutConfig) -> Result<(), anyhow::Error> {
    let soundpacks = SoundpackManager::new(layout)?;

    match command {
        SoundpackCommand::Install { source } => {
            let pack = run_with_progress("Installing", |sink| {
                soundpacks.install_task(source.clone(), sink)
            })?;
            println!("✓ Installed soundpack '{}' ({})", pack.name, format_size(pack.size));
        }
        SoundpackCommand::List => {
            let rows: Vec<EntryRow> = soundpacks
                .list()?
                .into_iter()
                .map(|p| EntryRow {
                    name: p.name,
                    size: format_size(p.size),
                    modified: format_timestamp(p.modified),
                })
                .collect();
            if rows.is_empty() {
                println!("No soundpacks installed");
            } else {
                println!("{}", Table::new(rows));
            }
        }
        SoundpackCommand::Delete { name, force } => {
            let pack = soundpacks
                .list()?
                .into_iter()
                .find(|p| p.name == name)
                .ok_or_else(|| anyhow!("no soundpack named '{name}'"))?;
            if !force
                && !confirm(&format!(
                    "Permanently delete soundpack '{}'? This cannot be undone",
                    pack.name
                ))?
            {
                println!("Deletion cancelled");
                return Ok(());
            }
            soundpacks.delete(&pack)?;
            println!("✓ Soundpack deleted");
        }
    }
    Ok(())
}

fn status(layout: LayoutConfig) -> Result<(), anyhow::Error> {
    let snapshots = SnapshotManager::new(layout.clone())?;
    let soundpacks = SoundpackManager::new(layout.clone())?;
    let registry = registry(layout.clone())?;

    println!("Layout:");
    println!("  Mods:        {}", layout.packages_dir.display());
    println!("  Saves:       {}", layout.save_dir.display());
    println!("  Backups:     {}", layout.backups_dir.display());
    println!("  Soundpacks:  {}", layout.soundpacks_dir.display());
    println!("  Registry:    {}", layout.database_path.display());
    println!("  Backup on exit: {}", if layout.backup_on_exit { "yes" } else { "no" });

    println!("Content:");
    println!("  Mods installed:  {}", registry.list_packages()?.len());
    println!("  Soundpacks:      {}", soundpacks.list()?.len());
    println!(
        "  Save files:      {}",
        if snapshots.save_files_exist() { "present" } else { "none" }
    );
    if let Some(world) = snapshots.latest_save()? {
        println!("  Latest world:    {}", world.display());
    }
    match snapshots.latest_snapshot()? {
        Some(latest) => println!(
            "  Latest backup:   {} ({})",
            latest.name,
            format_timestamp(latest.modified)
        ),
        None => println!("  Latest backup:   none"),
    }
    Ok(())
}

/// Start a task on its own thread and draw its progress on stderr
fn run_with_progress<T, F>(label: &str, build: F) -> Result<T, anyhow::Error>
where
    T: Send + 'static,
    F: FnOnce(Arc<dyn ProgressSink>) -> BackgroundTask<T>,
{
    let (sender, receiver) = mpsc::channel();
    let handle = build(Arc::new(ChannelProgress::new(sender))).start()?;

    // the channel closes when the task drops its sink
    for percent in receiver {
        eprint!("\r{label}... {percent:>3}%");
        io::stderr().flush()?;
    }
    eprintln!();

    Ok(handle.join()?)
}

fn find_snapshot(snapshots: &SnapshotManager, name: &str) -> Result<Snapshot, anyhow::Error> {
    snapshots
        .list()?
        .into_iter()
        .find(|s| s.name == name || s.stem() == name)
        .ok_or_else(|| anyhow!("no backup named '{name}'"))
}

fn confirm(question: &str) -> Result<bool, anyhow::Error> {
    print!("{question} (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        bail!("no answer on stdin; pass --force to skip confirmation");
    }
    Ok(input.trim().to_lowercase().starts_with('y'))
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_flag_is_global() {
        let cli = Cli::try_parse_from(["modvault", "backup", "list", "--metrics"]).unwrap();
        assert!(cli.metrics);
        assert!(modvault_core::VaultMetrics::global()
            .unwrap()
            .gather_metrics()
            .unwrap()
            .contains("modvault_backups_total"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_parse_nested_commands() {
        let cli = Cli::try_parse_from([
            "modvault",
            "--root",
            "/games/cdda",
            "backup",
            "rename",
            "2024-01-01_00-00-00",
            "before boss",
        ])
        .unwrap();
        assert_eq!(cli.root, PathBuf::from("/games/cdda"));
        assert!(matches!(
            cli.command,
            Commands::Backup(BackupCommand::Rename { ref name, ref new_name })
                if name == "2024-01-01_00-00-00" && new_name == "before boss"
        ));
    }
}
