use clap::{Args, Parser, Subcommand};
use overlay_core::config::Settings;
use overlay_core::logging::init_logging;
use overlay_core::{FileOverlayStore, Owner};
use overlay_service::{MergeOptions, OverlayService};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "overlay",
    about = "Per-user customization overlays for source files"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to .overlay data directory
    #[arg(long, default_value = ".overlay")]
    data_dir: PathBuf,
}

#[derive(Args)]
struct OwnerArgs {
    /// Scope the overlay to a user
    #[arg(long)]
    user: Option<String>,
    /// Scope the overlay to a tenant
    #[arg(long)]
    tenant: Option<String>,
}

impl OwnerArgs {
    fn owner(&self) -> Option<Owner> {
        Owner::from_parts(self.user.clone(), self.tenant.clone())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default settings.json
    Init,
    /// Print the unified diff between two files
    Diff { old: PathBuf, new: PathBuf },
    /// Record an edit of FILE as a new snapshot
    Record {
        /// Logical path of the customized file
        file: String,
        /// File holding the code before the edit
        #[arg(long)]
        old: PathBuf,
        /// File holding the code after the edit
        #[arg(long)]
        new: PathBuf,
        /// Change summary (defaults to the diff stats)
        #[arg(long)]
        summary: Option<String>,
        #[command(flatten)]
        owner: OwnerArgs,
    },
    /// Print the merged code for FILE as JSON
    Merge {
        file: String,
        /// Include finalized snapshots
        #[arg(long)]
        pending: bool,
        #[command(flatten)]
        owner: OwnerArgs,
    },
    /// Print the browser-ready projection for FILE as JSON
    Project {
        file: String,
        #[arg(long)]
        pending: bool,
        #[command(flatten)]
        owner: OwnerArgs,
    },
    /// Mark a snapshot finalized
    Finalize { snapshot_id: String },
    /// Discard a snapshot
    Discard { snapshot_id: String },
    /// Archive the overlay for FILE
    Archive {
        file: String,
        #[command(flatten)]
        owner: OwnerArgs,
    },
}

fn settings_path(cli: &Cli) -> PathBuf {
    cli.data_dir.join("settings.json")
}

/// Settings from the data directory; without a settings file the store
/// and logs live under the data directory.
fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let path = settings_path(cli);
    if path.exists() {
        return Settings::load(&path);
    }
    Ok(default_settings(cli))
}

fn default_settings(cli: &Cli) -> Settings {
    let mut settings = Settings::default();
    settings.store.data_dir = cli.data_dir.join("store");
    settings.logging.dir = cli.data_dir.join("logs");
    settings
}

async fn open_service(settings: &Settings) -> anyhow::Result<OverlayService> {
    let store = FileOverlayStore::new(&settings.store.data_dir).await?;
    Ok(OverlayService::from_settings(Arc::new(store), settings))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let _guard = init_logging(&settings.logging)?;
    tracing::debug!(data_dir = %cli.data_dir.display(), "overlay cli starting");

    match &cli.command {
        Commands::Init => cmd_init(&cli),
        Commands::Diff { old, new } => cmd_diff(&settings, old, new),
        Commands::Record {
            file,
            old,
            new,
            summary,
            owner,
        } => cmd_record(&settings, file, old, new, summary.clone(), owner).await,
        Commands::Merge {
            file,
            pending,
            owner,
        } => cmd_merge(&settings, file, *pending, owner).await,
        Commands::Project {
            file,
            pending,
            owner,
        } => cmd_project(&settings, file, *pending, owner).await,
        Commands::Finalize { snapshot_id } => cmd_finalize(&settings, snapshot_id, true).await,
        Commands::Discard { snapshot_id } => cmd_finalize(&settings, snapshot_id, false).await,
        Commands::Archive { file, owner } => cmd_archive(&settings, file, owner).await,
    }
}

fn cmd_init(cli: &Cli) -> anyhow::Result<()> {
    let path = settings_path(cli);
    if path.exists() {
        println!("Settings already exist at {}", path.display());
        return Ok(());
    }
    default_settings(cli).save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))
}

fn cmd_diff(settings: &Settings, old: &Path, new: &Path) -> anyhow::Result<()> {
    let engine = merge_engine::MergeEngine::new(merge_engine::EngineConfig {
        context_lines: settings.engine.diff_context_lines,
        ..Default::default()
    });
    let label = new.to_string_lossy();
    let patch = engine
        .codec()
        .create_file_diff(&read_file(old)?, &read_file(new)?, &label);
    print!("{}", patch.patch);
    eprintln!("{}", patch.stats.summary());
    Ok(())
}

async fn cmd_record(
    settings: &Settings,
    file: &str,
    old: &Path,
    new: &Path,
    summary: Option<String>,
    owner: &OwnerArgs,
) -> anyhow::Result<()> {
    let service = open_service(settings).await?;
    let meta = overlay_service::EditMeta {
        summary,
        ..Default::default()
    };
    let recorded = service
        .record_edit_with(
            file,
            owner.owner().as_ref(),
            &read_file(old)?,
            &read_file(new)?,
            meta,
        )
        .await?;
    match recorded {
        Some(descriptor) => println!("{}", serde_json::to_string_pretty(&descriptor)?),
        None => println!("No changes."),
    }
    Ok(())
}

async fn cmd_merge(settings: &Settings, file: &str, pending: bool, owner: &OwnerArgs) -> anyhow::Result<()> {
    let service = open_service(settings).await?;
    let options = MergeOptions {
        include_pending: pending,
        ..Default::default()
    };
    let result = service
        .get_merged_code(file, owner.owner().as_ref(), options)
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        anyhow::bail!("merge of {} failed", file);
    }
    Ok(())
}

async fn cmd_project(
    settings: &Settings,
    file: &str,
    pending: bool,
    owner: &OwnerArgs,
) -> anyhow::Result<()> {
    let service = open_service(settings).await?;
    let options = MergeOptions {
        include_pending: pending,
        ..Default::default()
    };
    let result = service
        .get_processed_for_client(file, owner.owner().as_ref(), options)
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.merge.success {
        anyhow::bail!("merge of {} failed", file);
    }
    Ok(())
}

async fn cmd_finalize(settings: &Settings, snapshot_id: &str, finalize: bool) -> anyhow::Result<()> {
    let service = open_service(settings).await?;
    if finalize {
        service.finalize_snapshot(snapshot_id).await?;
        println!("Snapshot {} finalized.", snapshot_id);
    } else {
        service.discard_snapshot(snapshot_id).await?;
        println!("Snapshot {} discarded.", snapshot_id);
    }
    Ok(())
}

async fn cmd_archive(settings: &Settings, file: &str, owner: &OwnerArgs) -> anyhow::Result<()> {
    let service = open_service(settings).await?;
    if service
        .archive_overlay(file, owner.owner().as_ref())
        .await?
    {
        println!("Archived overlay for {}.", file);
    } else {
        println!("No active overlay for {}.", file);
    }
    Ok(())
}
