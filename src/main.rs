use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use jaunt_albums::AlbumService;
use jaunt_flickr::FlickrClient;
use jaunt_store::db::Store;

#[derive(Parser)]
#[command(name = "jaunt", version, about = "Drop pins, collect photo albums")]
struct Cli {
    /// Journal database path. Defaults to the platform data directory.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drop a pin at a location.
    AddPin { latitude: f64, longitude: f64 },
    /// List all pins.
    Pins,
    /// List the photos in a pin's album.
    Photos { pin_id: String },
    /// Fetch the album for a pin. Downloads only when the album is empty,
    /// unless --new-collection discards it and fetches the next page.
    Sync {
        pin_id: String,
        #[arg(long)]
        new_collection: bool,
    },
    /// Remove a single photo from its album.
    RemovePhoto { photo_id: String },
    /// Remove a pin along with its album.
    RemovePin { pin_id: String },
    /// Fetch a photo's image (cached after the first download) and write it
    /// to a JPEG file.
    Image {
        photo_id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let service = build_service(cli.db)?;

    match cli.command {
        Command::AddPin {
            latitude,
            longitude,
        } => {
            let pin = service.add_pin(latitude, longitude).await?;
            println!("{}  {:.4},{:.4}", pin.id, pin.latitude, pin.longitude);
        }
        Command::Pins => {
            for pin in service.list_pins().await? {
                println!(
                    "{}  {:.4},{:.4}  page {}  since {}",
                    pin.id, pin.latitude, pin.longitude, pin.page, pin.created_at
                );
            }
        }
        Command::Photos { pin_id } => {
            for photo in service.list_photos(&pin_id).await? {
                let cached = if photo.has_cached_image() {
                    "cached"
                } else {
                    "remote"
                };
                println!("{}  {}  {}", photo.id, cached, photo.remote_url);
            }
        }
        Command::Sync {
            pin_id,
            new_collection,
        } => {
            let photos = service.sync_photos(&pin_id, new_collection).await?;
            println!("album has {} photos", photos.len());
            for photo in photos {
                println!("{}  {}", photo.id, photo.remote_url);
            }
        }
        Command::RemovePhoto { photo_id } => {
            service.remove_photo(&photo_id).await?;
            println!("removed photo {photo_id}");
        }
        Command::RemovePin { pin_id } => {
            service.remove_pin(&pin_id).await?;
            println!("removed pin {pin_id}");
        }
        Command::Image { photo_id, output } => {
            let bytes = service.get_image_bytes(&photo_id).await?;
            let path = output.unwrap_or_else(|| PathBuf::from(format!("{photo_id}.jpg")));
            fs::write(&path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {} bytes to {}", bytes.len(), path.display());
        }
    }

    Ok(())
}

fn build_service(db: Option<PathBuf>) -> Result<Arc<AlbumService>> {
    let db_path = match db {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db_str = db_path
        .to_str()
        .with_context(|| format!("non-UTF-8 database path: {}", db_path.display()))?;
    let store = Arc::new(Store::open(db_str)?);
    debug!(db = %db_path.display(), "opened journal database");

    // The API key is only exercised by searches; image downloads and local
    // commands work without one.
    let api_key = std::env::var("FLICKR_API_KEY").unwrap_or_default();
    let client = Arc::new(FlickrClient::new(api_key));

    Ok(Arc::new(AlbumService::new(
        store,
        client.clone(),
        client,
    )))
}

fn default_db_path() -> Result<PathBuf> {
    match dirs::data_dir() {
        Some(dir) => Ok(dir.join("jaunt").join("jaunt.db")),
        None => bail!("could not determine a data directory; pass --db"),
    }
}
