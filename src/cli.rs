use clap::Parser;

// ─── Constants ───────────────────────────────────────────────────────────────

pub const AUDIO_EXT: &[&str] =
    &["mp3", "m4a", "m4b", "m4p", "flac", "wav", "aif", "aiff", "ogg", "opus", "wma", "alac"];

// ─── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(version, about = "Two-way sync engine for the iPod Classic iTunesDB / ArtworkDB pair")]
pub struct Cli {
    /// Path to the iPod's mount point
    pub mount: String,

    /// Path to the PC-side music library to sync from. Required unless
    /// --check-integrity or --rollback is given.
    pub library: Option<String>,

    /// Show what would change without touching the device
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Show verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Worker threads for file copy/transcode (0 = cpu_count, capped at 8)
    #[arg(short = 'j', long = "workers", default_value_t = 0)]
    pub workers: usize,

    /// AAC bitrate (kbps) used when transcoding lossy non-Apple formats
    #[arg(long = "aac-bitrate", default_value_t = 256)]
    pub aac_bitrate: u32,

    /// Write updated play counts back to the PC library's own tags
    #[arg(long = "write-back-playcounts")]
    pub write_back_playcounts: bool,

    /// Write updated ratings back to the PC library's own tags
    #[arg(long = "write-back-ratings")]
    pub write_back_ratings: bool,

    /// Check device integrity (missing files, stale mapping entries) and exit
    #[arg(long = "check-integrity")]
    pub check_integrity: bool,

    /// With --check-integrity, delete on-device files with no matching track
    #[arg(long = "delete-orphans")]
    pub delete_orphans: bool,

    /// Roll back to the most recent checkpoint and exit
    #[arg(long = "rollback")]
    pub rollback: bool,
}
