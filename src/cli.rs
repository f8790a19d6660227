// Trapstore CLI binary

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use trapstore_lib::config::{CsvDateMode, StoreConfig};
use trapstore_lib::constants::STORE_EXTENSION;
use trapstore_lib::error::{diagnostic_lines, Diagnostic};
use trapstore_lib::exchange::{export_csv, import_csv, ExportOptions};
use trapstore_lib::jobs::progress::{LogProgress, Throttled};
use trapstore_lib::jobs::{CancelToken, JobContext};
use trapstore_lib::merge::{checkout, merge, MergeOptions};
use trapstore_lib::recognition::source::RecognitionSource;
use trapstore_lib::records::{RecordStore, SelectionSpec};
use trapstore_lib::schema::definition::{FieldDescriptor, SchemaDefinition};
use trapstore_lib::schema::SchemaSynchronizer;

#[derive(Parser)]
#[command(name = "trapstore")]
#[command(about = "Trapstore - metadata stores for camera-trap image sets", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty store
    Init {
        /// Store file to create
        store: PathBuf,
        /// JSON list of extra field descriptors
        #[arg(short, long)]
        template: Option<PathBuf>,
    },

    /// Summarize a store
    Info {
        store: PathBuf,
    },

    /// Export records as CSV
    Export {
        store: PathBuf,
        /// CSV file to write
        csv: PathBuf,
        /// Write separate Date and Time columns
        #[arg(long)]
        split_date: bool,
        /// Use a T between date and time
        #[arg(long)]
        t_separator: bool,
        /// Prefix date cells with a space
        #[arg(long)]
        leading_space: bool,
        /// Add a RootFolder column
        #[arg(long)]
        root_folder: bool,
        /// Export the store's saved view instead of every record
        #[arg(long)]
        saved_selection: bool,
    },

    /// Update records from a CSV file
    Import {
        store: PathBuf,
        /// CSV file to read
        csv: PathBuf,
    },

    /// Merge another store into this one
    Merge {
        store: PathBuf,
        /// Store to merge in
        source: PathBuf,
        /// Folder (relative to this store's root) the source root maps to
        #[arg(short, long, default_value = "")]
        prefix: String,
        /// Replace what this store holds under the prefix
        #[arg(long)]
        check_in: bool,
    },

    /// Copy the records under a folder into a new store
    Checkout {
        store: PathBuf,
        /// Relative folder to check out
        prefix: String,
        /// Store file to create
        out: PathBuf,
    },

    /// Bring a store's template in line with a reference store
    Sync {
        store: PathBuf,
        /// Store whose template is the reference
        reference: PathBuf,
        /// Treat a removed field as renamed (from=to)
        #[arg(long, value_parser = parse_rename)]
        rename: Vec<(String, String)>,
        /// Only report the differences
        #[arg(long)]
        dry_run: bool,
        /// Keep this store's labels, tooltips and widths
        #[arg(long)]
        keep_cosmetics: bool,
    },

    /// List files recorded more than once
    Duplicates {
        store: PathBuf,
    },

    /// Back up a store now
    Backup {
        store: PathBuf,
    },

    /// Load recognition results from a JSON file
    Recognize {
        store: PathBuf,
        /// Recognition JSON
        json: PathBuf,
    },

    /// List records whose image file is missing on disk
    Missing {
        store: PathBuf,
        /// Image root (defaults to the store's folder)
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init { store, template } => cmd_init(&config, store, template),
        Commands::Info { store } => cmd_info(&config, store),
        Commands::Export {
            store,
            csv,
            split_date,
            t_separator,
            leading_space,
            root_folder,
            saved_selection,
        } => {
            let mut options = ExportOptions::from_config(&config);
            if split_date {
                options.date_mode = CsvDateMode::Split;
            }
            options.t_separator |= t_separator;
            options.leading_space |= leading_space;
            options.include_root_folder |= root_folder;
            cmd_export(&config, store, csv, options, saved_selection)
        }
        Commands::Import { store, csv } => cmd_import(&config, store, csv),
        Commands::Merge {
            store,
            source,
            prefix,
            check_in,
        } => cmd_merge(&config, store, source, prefix, check_in),
        Commands::Checkout { store, prefix, out } => cmd_checkout(&config, store, prefix, out),
        Commands::Sync {
            store,
            reference,
            rename,
            dry_run,
            keep_cosmetics,
        } => cmd_sync(&config, store, reference, rename, dry_run, keep_cosmetics),
        Commands::Duplicates { store } => cmd_duplicates(&config, store),
        Commands::Backup { store } => cmd_backup(&config, store),
        Commands::Recognize { store, json } => cmd_recognize(&config, store, json),
        Commands::Missing { store, root } => cmd_missing(&config, store, root),
    }
}

fn load_config(path: Option<&Path>) -> Result<StoreConfig> {
    let config = match path {
        Some(path) => StoreConfig::load(path).with_context(|| format!("Failed to read config {}", path.display()))?,
        None => StoreConfig::load_or_default()?,
    };
    Ok(config)
}

fn parse_rename(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
            Ok((from.trim().to_string(), to.trim().to_string()))
        }
        _ => Err(format!("expected from=to, got '{}'", s)),
    }
}

fn open_store(config: &StoreConfig, path: &Path) -> Result<RecordStore> {
    RecordStore::open(path, config.clone()).with_context(|| format!("Failed to open store {}", path.display()))
}

/// Run `f` with a logging, throttled job context.
fn run_job<T>(config: &StoreConfig, f: impl FnOnce(&mut JobContext<'_>) -> T) -> T {
    let mut sink = Throttled::new(LogProgress, config.progress_interval());
    let mut ctx = JobContext::new(&mut sink, CancelToken::new(), config);
    f(&mut ctx)
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    println!();
    println!("Warnings:");
    for line in diagnostic_lines(diagnostics) {
        println!("  {}", line);
    }
}

fn cmd_init(config: &StoreConfig, store: PathBuf, template: Option<PathBuf>) -> Result<()> {
    let store = if store.extension().is_none() {
        store.with_extension(STORE_EXTENSION)
    } else {
        store
    };
    let mut definition = SchemaDefinition::image_template();
    if let Some(path) = template {
        // Image template fields are always present; the file only adds to them.
        let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let fields: Vec<FieldDescriptor> =
            serde_json::from_str(&text).with_context(|| format!("Invalid template {}", path.display()))?;
        for field in fields {
            if definition.contains(&field.data_label) {
                continue;
            }
            definition.add(field)?;
        }
    }

    let created = RecordStore::create(&store, &definition, config.clone())?;
    println!("Created store {}", store.display());
    println!("  Fields: {}", created.schema().fields().len());
    Ok(())
}

fn cmd_info(config: &StoreConfig, store: PathBuf) -> Result<()> {
    let store = open_store(config, &store)?;
    let settings = store.image_set()?;

    println!("Store: {}", store.path().map(|p| p.display().to_string()).unwrap_or_default());
    println!("  Root folder:  {}", settings.root_folder);
    println!("  Version:      {}", settings.version);
    println!("  Records:      {}", store.count_all()?);
    println!("  Marker rows:  {}", store.marker_row_count()?);
    if store.has_detections()? {
        println!("  Detections:   {}", store.detection_count()?);
    }

    println!();
    println!("{:>5}  {:<14}  {:<24}  {}", "Order", "Type", "Field", "Label");
    println!("{}", "-".repeat(60));
    for field in store.schema().fields() {
        println!(
            "{:>5}  {:<14}  {:<24}  {}",
            field.control_order,
            field.value_type.as_str(),
            field.data_label,
            field.label
        );
    }

    let levels = store.levels()?;
    if !levels.is_empty() {
        println!();
        println!("Folder levels:");
        for level in &levels {
            println!(
                "  {}  {:<16} {} fields, {} folders",
                level.level,
                level.name(),
                level.schema.fields().len(),
                store.level_rows(level.level)?.len()
            );
        }
    }
    Ok(())
}

fn cmd_export(
    config: &StoreConfig,
    store: PathBuf,
    csv: PathBuf,
    options: ExportOptions,
    saved_selection: bool,
) -> Result<()> {
    let store = open_store(config, &store)?;
    let spec = if saved_selection {
        store.current_selection()?
    } else {
        SelectionSpec::all()
    };
    let written = export_csv(&store, &spec, &options, &csv)?;
    println!("Exported {} records to {}", written, csv.display());
    Ok(())
}

fn cmd_import(config: &StoreConfig, store: PathBuf, csv: PathBuf) -> Result<()> {
    let mut store = open_store(config, &store)?;
    let outcome = run_job(config, |ctx| import_csv(&mut store, &csv, ctx))?;

    println!("Import complete:");
    println!("  Rows read:  {}", outcome.rows_read);
    println!("  Updated:    {}", outcome.updated);
    if outcome.cancelled {
        println!("  Cancelled before all rows were applied");
    }
    print_diagnostics(&outcome.diagnostics);
    Ok(())
}

fn cmd_merge(config: &StoreConfig, store: PathBuf, source: PathBuf, prefix: String, check_in: bool) -> Result<()> {
    let mut destination = open_store(config, &store)?;
    let options = if check_in {
        MergeOptions::check_in(&prefix)
    } else {
        MergeOptions::new(&prefix)
    };
    println!("Merging {} into {}", source.display(), store.display());

    let report = run_job(config, |ctx| merge(&mut destination, &source, &options, ctx))?;
    if report.cancelled {
        println!("Merge cancelled; nothing was changed.");
        return Ok(());
    }

    println!();
    println!("Merge complete:");
    println!("  Files merged:      {}", report.files_merged);
    if check_in {
        println!("  Files replaced:    {}", report.files_replaced);
    }
    println!("  Marker rows:       {}", report.markers_merged);
    println!("  Detections:        {}", report.detections_merged);
    println!("  Classifications:   {}", report.classifications_merged);
    println!("  Folder rows:       {} merged, {} kept", report.level_rows_merged, report.level_rows_kept);
    print_diagnostics(&report.diagnostics);
    Ok(())
}

fn cmd_checkout(config: &StoreConfig, store: PathBuf, prefix: String, out: PathBuf) -> Result<()> {
    let source = open_store(config, &store)?;
    let report = run_job(config, |ctx| checkout(&source, &out, &prefix, ctx))?;
    if report.cancelled {
        println!("Checkout cancelled; {} was not created.", out.display());
        return Ok(());
    }

    println!("Checked out '{}' to {}", prefix, report.path.display());
    println!("  Files:            {}", report.files);
    println!("  Marker rows:      {}", report.markers);
    println!("  Detections:       {}", report.detections);
    println!("  Classifications:  {}", report.classifications);
    println!("  Folder rows:      {}", report.level_rows);
    Ok(())
}

fn cmd_sync(
    config: &StoreConfig,
    store: PathBuf,
    reference: PathBuf,
    rename: Vec<(String, String)>,
    dry_run: bool,
    keep_cosmetics: bool,
) -> Result<()> {
    let reference_store = open_store(config, &reference)?;
    let mut synchronizer = SchemaSynchronizer::new(reference_store.schema().clone())
        .with_levels(reference_store.levels()?);
    for (from, to) in rename {
        synchronizer = synchronizer.with_rename(from, to);
    }
    if keep_cosmetics {
        synchronizer = synchronizer.keep_cosmetics();
    }
    drop(reference_store);

    let mut store = open_store(config, &store)?;
    let report = if dry_run {
        synchronizer.compare(store.schema(), &store.levels()?)?
    } else {
        synchronizer.synchronize(&mut store)?
    };

    if report.is_clean() {
        println!("Templates already match.");
        return Ok(());
    }

    let fields = &report.fields;
    println!("{}", if dry_run { "Differences:" } else { "Applied:" });
    for field in &fields.added {
        println!("  + {}", field);
    }
    for field in &fields.removed {
        println!("  - {}", field);
    }
    for (from, to) in &fields.renamed {
        println!("  ~ {} -> {}", from, to);
    }
    for field in &fields.cosmetically_changed {
        println!("  * {}", field);
    }
    for level in &report.levels {
        println!(
            "  level {}: {} added, {} removed",
            level.level,
            level.changes.added.len(),
            level.changes.removed.len()
        );
    }
    for level in &report.levels_added {
        println!("  + level {} ({})", level.level, level.name());
    }
    if report.level_mismatch {
        println!("  Folder levels differ; level changes were not applied.");
    }
    print_diagnostics(&report.diagnostics);
    Ok(())
}

fn cmd_duplicates(config: &StoreConfig, store: PathBuf) -> Result<()> {
    let store = open_store(config, &store)?;
    let keys = store.find_duplicate_keys()?;
    if keys.is_empty() {
        println!("No duplicate files.");
        return Ok(());
    }

    println!("{:>6}  {}", "Copies", "File");
    println!("{}", "-".repeat(60));
    for (relative_path, file) in &keys {
        let ids = store.ids_for_key(relative_path, file)?;
        let shown = if relative_path.is_empty() {
            file.clone()
        } else {
            format!("{}\\{}", relative_path, file)
        };
        println!("{:>6}  {}", ids.len(), shown);
    }
    Ok(())
}

fn cmd_backup(config: &StoreConfig, store: PathBuf) -> Result<()> {
    let mut store = open_store(config, &store)?;
    match store.backup_now()? {
        Some(path) => println!("Backed up to {}", path.display()),
        None => println!("Backups are disabled in the config."),
    }
    Ok(())
}

fn cmd_recognize(config: &StoreConfig, store: PathBuf, json: PathBuf) -> Result<()> {
    let source = RecognitionSource::load(&json)?;
    let mut store = open_store(config, &store)?;
    let outcome = run_job(config, |ctx| store.populate_recognition(&source, ctx))?;
    if outcome.cancelled {
        println!("Cancelled; no recognition data was stored.");
        return Ok(());
    }

    println!("Recognition data loaded:");
    println!("  Images matched:    {}", outcome.images_matched);
    println!("  Images unmatched:  {}", outcome.images_unmatched);
    println!("  Detections:        {}", outcome.detections);
    println!("  Classifications:   {}", outcome.classifications);
    Ok(())
}

fn cmd_missing(config: &StoreConfig, store: PathBuf, root: Option<PathBuf>) -> Result<()> {
    let store = open_store(config, &store)?;
    let root = match root {
        Some(root) => root,
        None => store
            .path()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let missing = store.missing_files(&root, |p| p.exists())?;
    if missing.is_empty() {
        println!("All files present under {}", root.display());
        return Ok(());
    }

    println!("{} missing files under {}:", missing.len(), root.display());
    for id in missing {
        if let Some(record) = store.get(id)? {
            println!("  {:>6}  {}\\{}", id, record.relative_path, record.file);
        }
    }
    Ok(())
}
