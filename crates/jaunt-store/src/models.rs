use serde::{Deserialize, Serialize};

/// A user-dropped map marker owning a photo album. The id is a client-generated
/// UUID string, assigned once and never reused after deletion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pin {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Current search page for this pin. Starts at 1 and advances on each
    /// "new collection" request.
    pub page: u32,
    pub created_at: String,
}

/// A single album entry. Created metadata-only from a search result; the
/// `image_data` blob is filled in on first image fetch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Provider-assigned id, globally unique across pins.
    pub id: String,
    pub remote_url: String,
    pub image_data: Option<Vec<u8>>,
    pub pin_id: String,
}

impl PhotoRecord {
    pub fn has_cached_image(&self) -> bool {
        self.image_data.is_some()
    }
}

pub fn new_pin_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
