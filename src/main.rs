use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

mod checkpoint;
mod checksum;
mod chunk;
mod cli;
mod device;
mod differ;
mod error;
mod executor;
mod fingerprint;
mod integrity;
mod itunesdb;
mod artworkdb;
mod mapping;
mod prefs;
mod transcode;

use cli::Cli;
use executor::{CancelFlag, ExecuteOptions, SyncExecutor};

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if let Err(e) = run(&cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mount = Path::new(&cli.mount);
    if !mount.is_dir() {
        anyhow::bail!("iPod mount path not found or not mounted: {}", mount.display());
    }

    let test_file = mount.join(".ipod_classic_sync_write_test");
    std::fs::write(&test_file, b"test").context("no write permission on the iPod's mount point")?;
    let _ = std::fs::remove_file(&test_file);

    let cancel = Arc::new(CancelFlag::new());
    let cancel_for_handler = cancel.clone();
    let _ = ctrlc::set_handler(move || {
        eprintln!("\ninterrupt received, finishing the current stage before stopping...");
        cancel_for_handler.request();
    });

    let itunes_dir = mount.join("iPod_Control/iTunes");
    std::fs::create_dir_all(&itunes_dir).ok();
    let mut mapping = mapping::MappingManager::load(&itunes_dir)?;

    if cli.rollback {
        let mut manager = checkpoint::CheckpointManager::new(mount);
        if manager.rollback() {
            info!("rolled back to the most recent checkpoint");
            Ok(())
        } else {
            anyhow::bail!("no checkpoint available to roll back to");
        }
    } else if cli.check_integrity {
        check_integrity_command(cli, mount, &mut mapping)
    } else {
        let library = cli
            .library
            .as_deref()
            .context("a PC library path is required unless --check-integrity or --rollback is given")?;
        let library = Path::new(library);
        if !library.is_dir() {
            anyhow::bail!("PC library path not found: {}", library.display());
        }
        sync_command(cli, mount, library, &mut mapping, &cancel)
    }
}

fn check_integrity_command(cli: &Cli, mount: &Path, mapping: &mut mapping::MappingManager) -> Result<()> {
    let db_path = mount.join("iPod_Control/iTunes/iTunesDB");
    let parsed = itunesdb::parse_itunesdb(&db_path).context("failed to parse iTunesDB")?;
    let mut tracks = parsed.tracks;

    let report = integrity::check_integrity(mount, &mut tracks, mapping, cli.delete_orphans);
    mapping.save().context("failed to save mapping after integrity check")?;

    if report.is_clean() {
        println!("device is consistent: no missing files, stale mapping entries, or orphans");
    } else {
        println!(
            "{} tracks with missing files removed, {} stale mapping entries removed, {} orphan files found{}",
            report.missing_file_titles.len(),
            report.stale_mapping_dbids.len(),
            report.orphan_files.len(),
            if cli.delete_orphans { " (deleted)" } else { " (pass --delete-orphans to remove)" }
        );
    }
    Ok(())
}

fn sync_command(
    cli: &Cli,
    mount: &Path,
    library: &Path,
    mapping: &mut mapping::MappingManager,
    cancel: &Arc<CancelFlag>,
) -> Result<()> {
    let sysinfo = device::read_sysinfo(mount).unwrap_or_default();
    if let Some(model) = sysinfo.model_num_str.as_deref().and_then(device::normalize_model_number) {
        match device::describe_model(&model) {
            Some((name, generation)) => info!("device: {} ({})", name, generation),
            None => info!("device: unrecognized model {}", model),
        }
    }

    let device_prefs = prefs::read_prefs(mount);
    if let Some(warning) = prefs::check_library_owner(&device_prefs) {
        warn!("{}", warning);
    }

    let db_path = mount.join("iPod_Control/iTunes/iTunesDB");
    let mut tracks = match itunesdb::parse_itunesdb(&db_path) {
        Ok(parsed) => parsed.tracks,
        Err(e) => {
            warn!("no existing database to read ({e}); this looks like a first sync");
            Vec::new()
        }
    };

    let report = integrity::check_integrity(mount, &mut tracks, mapping, false);
    if !report.is_clean() {
        info!("pre-sync integrity check found issues; continuing with the cleaned working set");
    }

    let fpcalc = fingerprint::find_fpcalc();
    if fpcalc.is_none() {
        warn!("fpcalc not found on PATH; new tracks will sync without acoustic fingerprints");
    }
    let plan = differ::compute_diff(library, &tracks, mapping, |path| match &fpcalc {
        Some(tool) => fingerprint::get_or_compute_fingerprint(path, tool, true),
        None => Err(error::DifferError::FingerprintToolMissing),
    });

    info!(
        "plan: {} to add, {} to remove, {} metadata update(s), {} file update(s), {} artwork update(s)",
        plan.to_add.len(),
        plan.to_remove.len(),
        plan.to_update_metadata.len(),
        plan.to_update_file.len(),
        plan.to_update_artwork.len()
    );
    if !plan.unresolved_collisions.is_empty() {
        warn!("{} fingerprint collision(s) could not be resolved automatically", plan.unresolved_collisions.len());
    }
    if !plan.fingerprint_errors.is_empty() {
        warn!("{} file(s) could not be fingerprinted and were skipped", plan.fingerprint_errors.len());
    }

    if !plan.has_changes() {
        info!("nothing to sync");
        return Ok(());
    }

    let mut sync_executor = SyncExecutor::new(mount, None).context("failed to initialize sync executor")?;
    let opts = ExecuteOptions {
        dry_run: cli.dry_run,
        write_back_to_pc: cli.write_back_playcounts || cli.write_back_ratings,
        aac_bitrate: cli.aac_bitrate,
        max_workers: cli.workers,
    };

    let cancel_poll = cancel.clone();
    let result = sync_executor.execute(&plan, mapping, &opts, &move || cancel_poll.is_set());

    for (stage, err) in &result.errors {
        log::error!("{stage}: {err}");
    }
    println!(
        "added {}, removed {}, {} metadata updated, {} files updated, {} play count(s) synced, {} rating(s) synced",
        result.tracks_added,
        result.tracks_removed,
        result.tracks_updated_metadata,
        result.tracks_updated_file,
        result.playcounts_synced,
        result.ratings_synced
    );

    if !result.success {
        anyhow::bail!("sync finished with {} error(s)", result.errors.len());
    }
    Ok(())
}
