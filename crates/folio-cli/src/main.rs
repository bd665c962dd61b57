//! Folio CLI
//!
//! Thin wrapper around folio-core for inspecting and manipulating a
//! local data directory.
//!
//! ## Usage
//!
//! ```bash
//! # Initialize a local tenant
//! folio init
//!
//! # Create a novel
//! folio novel create "The Long Winter"
//!
//! # List novels
//! folio novel list
//!
//! # Create a volume and a chapter
//! folio volume create <novel_id> "Part One"
//! folio chapter create <novel_id> <volume_id> "Thaw"
//!
//! # Write a chapter body
//! folio chapter body <novel_id> <chapter_id> "It began to rain."
//!
//! # Trash, restore, and purge novels
//! folio novel trash <novel_id>
//! folio novel restore <novel_id>
//! folio novel purge <novel_id>
//!
//! # Show store status and the purge watermark
//! folio status
//! folio watermark
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use folio_core::{new_id, Folio};

/// Folio - offline-first novel writing store
#[derive(Parser)]
#[command(name = "folio")]
#[command(version = "0.1.0")]
#[command(about = "Folio - offline-first novel writing store")]
struct Cli {
    /// Data directory (default: ~/.folio/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory for a local tenant
    Init {
        /// Use an existing user id instead of generating one
        #[arg(long)]
        user_id: Option<String>,
    },

    /// Novel management
    Novel {
        #[command(subcommand)]
        action: NovelAction,
    },

    /// Volume management
    Volume {
        #[command(subcommand)]
        action: VolumeAction,
    },

    /// Chapter management
    Chapter {
        #[command(subcommand)]
        action: ChapterAction,
    },

    /// Show tenant store status
    Status,

    /// Show the purge watermark
    Watermark,
}

#[derive(Subcommand)]
enum NovelAction {
    /// Create a new novel
    Create { title: String },
    /// List novels
    List {
        /// List trashed novels instead
        #[arg(long)]
        trashed: bool,
    },
    /// Rename a novel
    Rename { novel_id: String, title: String },
    /// Move a novel to the trash (soft delete)
    Trash { novel_id: String },
    /// Restore a trashed novel
    Restore { novel_id: String },
    /// Delete a novel forever, cascading to its volumes, chapters, and rooms
    Purge { novel_id: String },
}

#[derive(Subcommand)]
enum VolumeAction {
    /// Create a volume in a novel
    Create { novel_id: String, title: String },
    /// List a novel's volumes
    List { novel_id: String },
}

#[derive(Subcommand)]
enum ChapterAction {
    /// Create a chapter at the end of a volume
    Create {
        novel_id: String,
        volume_id: String,
        title: String,
    },
    /// List a volume's chapters in order
    List { novel_id: String, volume_id: String },
    /// Rename a chapter
    Rename { novel_id: String, chapter_id: String, title: String },
    /// Replace a chapter's body text
    Body { novel_id: String, chapter_id: String, text: String },
    /// Move a chapter after another one (or to the front)
    Move {
        novel_id: String,
        chapter_id: String,
        /// Chapter to place it after; first position when omitted
        #[arg(long)]
        after: Option<String>,
    },
    /// Move a chapter to the trash (soft delete)
    Trash { novel_id: String, chapter_id: String },
}

#[derive(Serialize, Deserialize)]
struct UserInfo {
    user_id: String,
}

fn data_dir(cli: &Cli) -> Result<PathBuf> {
    match &cli.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(dirs::home_dir()
            .context("could not determine home directory")?
            .join(".folio")
            .join("data")),
    }
}

fn user_info_path(dir: &PathBuf) -> PathBuf {
    dir.join("user.json")
}

fn load_user_id(dir: &PathBuf) -> Result<String> {
    let path = user_info_path(dir);
    let data = std::fs::read(&path)
        .with_context(|| format!("not initialized; run `folio init` first ({})", path.display()))?;
    let info: UserInfo = serde_json::from_slice(&data).context("corrupt user.json")?;
    Ok(info.user_id)
}

fn open_engine(dir: &PathBuf) -> Result<Folio> {
    let user_id = load_user_id(dir)?;
    Ok(Folio::open(dir, user_id)?)
}

/// Give the purge coordinator a chance to finish the local cascade
/// before the process exits.
async fn wait_for_purge(folio: &Folio) -> Result<()> {
    let store = folio.user_store();
    let target = store.global_head()?;
    for _ in 0..200 {
        if store.ui_state()?.last_novel_purge_global_seq >= target {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let dir = data_dir(&cli)?;

    match cli.command {
        Commands::Init { user_id } => {
            let path = user_info_path(&dir);
            if path.exists() {
                let existing = load_user_id(&dir)?;
                println!("Already initialized");
                println!("  User: {existing}");
                return Ok(());
            }
            std::fs::create_dir_all(&dir)?;
            let info = UserInfo {
                user_id: user_id.unwrap_or_else(new_id),
            };
            std::fs::write(&path, serde_json::to_vec_pretty(&info)?)?;
            println!("Initialized Folio data directory");
            println!("  User: {}", info.user_id);
        }

        Commands::Novel { action } => {
            let folio = open_engine(&dir)?;
            match action {
                NovelAction::Create { title } => {
                    let novel = folio.create_novel(title)?;
                    println!("Created novel '{}'", novel.title);
                    println!("  ID: {}", novel.id);
                }
                NovelAction::List { trashed } => {
                    let novels = if trashed {
                        folio.user_store().trashed_novels()?
                    } else {
                        folio.user_store().novels()?
                    };
                    if novels.is_empty() {
                        println!("No novels");
                    }
                    for novel in novels {
                        println!("{}", novel.title);
                        println!("  ID: {}", novel.id);
                    }
                }
                NovelAction::Rename { novel_id, title } => {
                    folio.rename_novel(&novel_id, title)?;
                    println!("Renamed novel {novel_id}");
                }
                NovelAction::Trash { novel_id } => {
                    folio.trash_novel(&novel_id)?;
                    println!("Trashed novel {novel_id}");
                }
                NovelAction::Restore { novel_id } => {
                    folio.restore_novel(&novel_id)?;
                    println!("Restored novel {novel_id}");
                }
                NovelAction::Purge { novel_id } => {
                    folio.purge_novel(&novel_id)?;
                    wait_for_purge(&folio).await?;
                    println!("Purged novel {novel_id}");
                }
            }
            folio.shutdown();
        }

        Commands::Volume { action } => {
            let folio = open_engine(&dir)?;
            match action {
                VolumeAction::Create { novel_id, title } => {
                    let volume = folio.create_volume(&novel_id, title)?;
                    println!("Created volume '{}'", volume.title);
                    println!("  ID: {}", volume.id);
                }
                VolumeAction::List { novel_id } => {
                    let store = folio.open_novel(&novel_id)?;
                    let volumes = store.volumes()?;
                    if volumes.is_empty() {
                        println!("No volumes");
                    }
                    for volume in volumes {
                        println!("{}", volume.title);
                        println!("  ID: {}", volume.id);
                    }
                }
            }
            folio.shutdown();
        }

        Commands::Chapter { action } => {
            let folio = open_engine(&dir)?;
            match action {
                ChapterAction::Create {
                    novel_id,
                    volume_id,
                    title,
                } => {
                    let chapter = folio.create_chapter(&novel_id, &volume_id, title)?;
                    println!("Created chapter '{}'", chapter.title);
                    println!("  ID: {}", chapter.id);
                }
                ChapterAction::List { novel_id, volume_id } => {
                    let store = folio.open_novel(&novel_id)?;
                    let chapters = store.chapters_of(&volume_id)?;
                    if chapters.is_empty() {
                        println!("No chapters");
                    }
                    for chapter in chapters {
                        println!("{}", chapter.title);
                        println!("  ID: {}", chapter.id);
                    }
                }
                ChapterAction::Rename {
                    novel_id,
                    chapter_id,
                    title,
                } => {
                    folio.rename_chapter(&novel_id, &chapter_id, title)?;
                    println!("Renamed chapter {chapter_id}");
                }
                ChapterAction::Body {
                    novel_id,
                    chapter_id,
                    text,
                } => {
                    folio.update_chapter_body(&novel_id, &chapter_id, text)?;
                    println!("Updated chapter {chapter_id}");
                }
                ChapterAction::Move {
                    novel_id,
                    chapter_id,
                    after,
                } => {
                    folio.move_chapter(&novel_id, &chapter_id, after.as_deref())?;
                    println!("Moved chapter {chapter_id}");
                }
                ChapterAction::Trash { novel_id, chapter_id } => {
                    folio.trash_chapter(&novel_id, &chapter_id)?;
                    println!("Trashed chapter {chapter_id}");
                }
            }
            folio.shutdown();
        }

        Commands::Status => {
            let folio = open_engine(&dir)?;
            let store = folio.user_store();
            println!("Folio status");
            println!("  Data directory: {}", dir.display());
            println!("  User: {}", folio.user_id());
            println!("  Store: {}", store.store_id());
            println!("  Events: {}", store.log_len()?);
            println!("  Global head: {}", store.global_head()?);
            println!("  Novels: {}", store.novels()?.len());
            println!("  Trashed: {}", store.trashed_novels()?.len());
            folio.shutdown();
        }

        Commands::Watermark => {
            let folio = open_engine(&dir)?;
            let state = folio.user_store().ui_state()?;
            println!(
                "Last novel purge global seq: {}",
                state.last_novel_purge_global_seq
            );
            folio.shutdown();
        }
    }

    Ok(())
}
