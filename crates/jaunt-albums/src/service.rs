use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info};

use jaunt_flickr::{FlickrClient, FlickrError, RemotePhoto};
use jaunt_store::db::{self, Store};
use jaunt_store::models::{PhotoRecord, Pin, new_pin_id};

use crate::image::recompress;

#[derive(Debug, thiserror::Error)]
pub enum AlbumError {
    #[error("pin not found: {0}")]
    PinNotFound(String),
    #[error("photo not found: {0}")]
    PhotoNotFound(String),
    /// Remote search or download failure. Local state is left untouched.
    #[error(transparent)]
    Remote(#[from] FlickrError),
    /// Bytes arrived but did not decode as an image. Distinct from the
    /// transport path so callers can tell "no data" from "bad data".
    #[error("image decode failed: {0}")]
    ImageDecode(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Seam over the remote photo search, mockable in tests.
#[async_trait]
pub trait PhotoSearch: Send + Sync {
    async fn search(
        &self,
        latitude: f64,
        longitude: f64,
        page: u32,
    ) -> Result<Vec<RemotePhoto>, FlickrError>;
}

/// Seam over raw image downloads, mockable in tests.
#[async_trait]
pub trait ImageFetch: Send + Sync {
    async fn fetch_image_bytes(&self, url: &str) -> Result<Vec<u8>, FlickrError>;
}

#[async_trait]
impl PhotoSearch for FlickrClient {
    async fn search(
        &self,
        latitude: f64,
        longitude: f64,
        page: u32,
    ) -> Result<Vec<RemotePhoto>, FlickrError> {
        FlickrClient::search(self, latitude, longitude, page).await
    }
}

#[async_trait]
impl ImageFetch for FlickrClient {
    async fn fetch_image_bytes(&self, url: &str) -> Result<Vec<u8>, FlickrError> {
        FlickrClient::fetch_image_bytes(self, url).await
    }
}

/// Reconciles each pin's persisted album with remote search results and
/// lazily caches image bytes on the photo records.
///
/// Syncs for the same pin are serialized through a per-pin async mutex, so
/// two overlapping "new collection" requests cannot interleave their writes.
/// Image fetches carry no such guard.
pub struct AlbumService {
    store: Arc<Store>,
    search: Arc<dyn PhotoSearch>,
    images: Arc<dyn ImageFetch>,
    sync_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AlbumService {
    pub fn new(store: Arc<Store>, search: Arc<dyn PhotoSearch>, images: Arc<dyn ImageFetch>) -> Self {
        Self {
            store,
            search,
            images,
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn add_pin(&self, latitude: f64, longitude: f64) -> Result<Pin, AlbumError> {
        let pin = Pin {
            id: new_pin_id(),
            latitude,
            longitude,
            page: 1,
            created_at: String::new(),
        };
        self.store.with_txn(|txn| db::insert_pin(txn, &pin))?;
        info!(pin_id = %pin.id, latitude, longitude, "dropped pin");
        self.pin(&pin.id).await
    }

    pub async fn list_pins(&self) -> Result<Vec<Pin>, AlbumError> {
        Ok(self.store.list_pins()?)
    }

    pub async fn list_photos(&self, pin_id: &str) -> Result<Vec<PhotoRecord>, AlbumError> {
        Ok(self.store.photos_for_pin(pin_id)?)
    }

    /// Reconcile a pin's album with the remote search.
    ///
    /// A plain sync returns the persisted photos untouched whenever any
    /// exist and only fetches when the album is empty. `new_collection`
    /// discards the current photos, advances the pin's page, and fetches
    /// the next result set. Merging is idempotent: a result whose id is
    /// already stored is reattached, never duplicated. On remote failure
    /// nothing is written.
    pub async fn sync_photos(
        &self,
        pin_id: &str,
        new_collection: bool,
    ) -> Result<Vec<PhotoRecord>, AlbumError> {
        let lock = self.pin_lock(pin_id)?;
        let _guard = lock.lock().await;

        let pin = self.pin(pin_id).await?;
        let existing = self.store.photos_for_pin(pin_id)?;
        if !new_collection && !existing.is_empty() {
            debug!(pin_id, count = existing.len(), "album already cached");
            return Ok(existing);
        }

        let page = if new_collection { pin.page + 1 } else { pin.page };
        let results = self.search.search(pin.latitude, pin.longitude, page).await?;
        info!(pin_id, page, results = results.len(), "fetched remote album");

        let photos = self.store.with_txn(|txn| {
            if new_collection {
                let removed = db::delete_photos_for_pin(txn, pin_id)?;
                db::set_page(txn, pin_id, page)?;
                debug!(pin_id, removed, page, "replaced collection");
            }
            for result in &results {
                db::attach_photo(txn, &result.id, &result.url, pin_id)?;
            }
            db::photos_for_pin(txn, pin_id)
        })?;

        Ok(photos)
    }

    /// Detach and delete a single photo, committed immediately.
    pub async fn remove_photo(&self, photo_id: &str) -> Result<(), AlbumError> {
        if !self.store.delete_photo(photo_id)? {
            return Err(AlbumError::PhotoNotFound(photo_id.to_string()));
        }
        debug!(photo_id, "removed photo");
        Ok(())
    }

    /// Delete a pin along with its whole album.
    pub async fn remove_pin(&self, pin_id: &str) -> Result<(), AlbumError> {
        if !self.store.delete_pin(pin_id)? {
            return Err(AlbumError::PinNotFound(pin_id.to_string()));
        }
        info!(pin_id, "removed pin");
        Ok(())
    }

    /// Return a photo's image bytes, downloading them on first access.
    ///
    /// A cached blob is served without touching the network. Otherwise the
    /// remote URL is fetched once, the bytes are re-encoded at fixed JPEG
    /// quality, persisted onto the record, and returned.
    pub async fn get_image_bytes(&self, photo_id: &str) -> Result<Vec<u8>, AlbumError> {
        let photo = self
            .store
            .get_photo(photo_id)?
            .ok_or_else(|| AlbumError::PhotoNotFound(photo_id.to_string()))?;

        if let Some(data) = photo.image_data {
            debug!(photo_id, "serving cached image");
            return Ok(data);
        }

        let bytes = self.images.fetch_image_bytes(&photo.remote_url).await?;
        let jpeg = recompress(&bytes)?;
        self.store
            .with_txn(|txn| db::set_image_data(txn, photo_id, &jpeg))?;
        debug!(photo_id, size = jpeg.len(), "downloaded and cached image");

        Ok(jpeg)
    }

    async fn pin(&self, pin_id: &str) -> Result<Pin, AlbumError> {
        self.store
            .get_pin(pin_id)?
            .ok_or_else(|| AlbumError::PinNotFound(pin_id.to_string()))
    }

    fn pin_lock(&self, pin_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, AlbumError> {
        let mut locks = self
            .sync_locks
            .lock()
            .map_err(|_| AlbumError::Store(anyhow!("sync lock map poisoned")))?;
        Ok(locks.entry(pin_id.to_string()).or_default().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockSearch {
        pages: HashMap<u32, Vec<RemotePhoto>>,
        delay: Duration,
        fail: AtomicBool,
        calls: AtomicUsize,
        requested: Mutex<Vec<u32>>,
    }

    impl MockSearch {
        fn with_pages(pages: &[(u32, &[&str])]) -> Arc<Self> {
            Self::with_pages_and_delay(pages, Duration::ZERO)
        }

        fn with_pages_and_delay(pages: &[(u32, &[&str])], delay: Duration) -> Arc<Self> {
            let pages = pages
                .iter()
                .map(|(page, ids)| (*page, ids.iter().map(|id| remote(id)).collect()))
                .collect();
            Arc::new(Self {
                pages,
                delay,
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn requested_pages(&self) -> Vec<u32> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PhotoSearch for MockSearch {
        async fn search(
            &self,
            _latitude: f64,
            _longitude: f64,
            page: u32,
        ) -> Result<Vec<RemotePhoto>, FlickrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(page);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FlickrError::InvalidResponse("mock provider error".into()));
            }
            Ok(self.pages.get(&page).cloned().unwrap_or_default())
        }
    }

    struct MockImages {
        data: Vec<u8>,
        calls: AtomicUsize,
    }

    impl MockImages {
        fn serving(data: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                data,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageFetch for MockImages {
        async fn fetch_image_bytes(&self, _url: &str) -> Result<Vec<u8>, FlickrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.data.clone())
        }
    }

    fn remote(id: &str) -> RemotePhoto {
        RemotePhoto {
            id: id.to_string(),
            url: format!("https://img.example/{id}.jpg"),
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 120, 220]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn service(
        search: Arc<MockSearch>,
        images: Arc<MockImages>,
    ) -> (Arc<AlbumService>, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let service = AlbumService::new(store.clone(), search, images);
        (Arc::new(service), store)
    }

    fn ids(photos: &[PhotoRecord]) -> Vec<&str> {
        photos.iter().map(|p| p.id.as_str()).collect()
    }

    #[tokio::test]
    async fn initial_sync_fetches_and_persists() {
        let search = MockSearch::with_pages(&[(1, &["a", "b", "c"])]);
        let (service, store) = service(search.clone(), MockImages::serving(png_bytes()));

        let pin = service.add_pin(37.7, -122.4).await.unwrap();
        let photos = service.sync_photos(&pin.id, false).await.unwrap();

        assert_eq!(ids(&photos), vec!["a", "b", "c"]);
        assert_eq!(search.calls(), 1);
        assert_eq!(store.photo_count().unwrap(), 3);
        assert!(photos.iter().all(|p| !p.has_cached_image()));
    }

    #[tokio::test]
    async fn cached_album_is_returned_without_refetching() {
        let search = MockSearch::with_pages(&[(1, &["a", "b", "c"])]);
        let (service, _store) = service(search.clone(), MockImages::serving(png_bytes()));

        let pin = service.add_pin(37.7, -122.4).await.unwrap();
        service.sync_photos(&pin.id, false).await.unwrap();
        let photos = service.sync_photos(&pin.id, false).await.unwrap();

        // One photo per unique id, and no second network call.
        assert_eq!(ids(&photos), vec!["a", "b", "c"]);
        assert_eq!(search.calls(), 1);
    }

    #[tokio::test]
    async fn new_collection_increments_page_and_replaces_album() {
        let search = MockSearch::with_pages(&[(1, &["a", "b"]), (2, &["c", "d"])]);
        let (service, store) = service(search.clone(), MockImages::serving(png_bytes()));

        let pin = service.add_pin(48.8, 2.3).await.unwrap();
        service.sync_photos(&pin.id, false).await.unwrap();
        let photos = service.sync_photos(&pin.id, true).await.unwrap();

        assert_eq!(search.requested_pages(), vec![1, 2]);
        assert_eq!(ids(&photos), vec!["c", "d"]);
        assert_eq!(store.photo_count().unwrap(), 2);
        assert_eq!(store.get_pin(&pin.id).unwrap().unwrap().page, 2);
        assert!(store.get_photo("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_reuses_existing_ids_across_pages() {
        // Page 2 repeats id "b"; the record is reattached, not duplicated.
        let search = MockSearch::with_pages(&[(1, &["a", "b"]), (2, &["b", "c"])]);
        let (service, store) = service(search.clone(), MockImages::serving(png_bytes()));

        let pin = service.add_pin(35.6, 139.7).await.unwrap();
        service.sync_photos(&pin.id, false).await.unwrap();
        let photos = service.sync_photos(&pin.id, true).await.unwrap();

        assert_eq!(ids(&photos), vec!["b", "c"]);
        assert_eq!(store.photo_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn remote_failure_leaves_local_state_untouched() {
        let search = MockSearch::with_pages(&[(1, &["a", "b"])]);
        let (service, store) = service(search.clone(), MockImages::serving(png_bytes()));

        let pin = service.add_pin(51.5, -0.1).await.unwrap();
        service.sync_photos(&pin.id, false).await.unwrap();

        search.fail.store(true, Ordering::SeqCst);
        let err = service.sync_photos(&pin.id, true).await.unwrap_err();
        assert!(matches!(err, AlbumError::Remote(_)));

        // Old album survives and the page never advanced.
        let photos = service.sync_photos(&pin.id, false).await.unwrap();
        assert_eq!(ids(&photos), vec!["a", "b"]);
        assert_eq!(store.get_pin(&pin.id).unwrap().unwrap().page, 1);
    }

    #[tokio::test]
    async fn zero_results_is_an_empty_album() {
        let search = MockSearch::with_pages(&[]);
        let (service, _store) = service(search.clone(), MockImages::serving(png_bytes()));

        let pin = service.add_pin(0.0, 0.0).await.unwrap();
        let photos = service.sync_photos(&pin.id, false).await.unwrap();
        assert!(photos.is_empty());

        // An empty album still counts as "no local photos", so the next
        // plain sync fetches again.
        service.sync_photos(&pin.id, false).await.unwrap();
        assert_eq!(search.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_syncs_for_same_pin_are_serialized() {
        let search = MockSearch::with_pages_and_delay(
            &[(1, &["a", "b", "c"])],
            Duration::from_millis(20),
        );
        let (service, _store) = service(search.clone(), MockImages::serving(png_bytes()));

        let pin = service.add_pin(37.7, -122.4).await.unwrap();
        let (first, second) = tokio::join!(
            service.sync_photos(&pin.id, false),
            service.sync_photos(&pin.id, false),
        );

        assert_eq!(ids(&first.unwrap()), vec!["a", "b", "c"]);
        assert_eq!(ids(&second.unwrap()), vec!["a", "b", "c"]);
        // The second sync waited on the per-pin lock, saw the cached album,
        // and never hit the network.
        assert_eq!(search.calls(), 1);
    }

    #[tokio::test]
    async fn get_image_bytes_downloads_once_then_serves_cache() {
        let search = MockSearch::with_pages(&[(1, &["a"])]);
        let images = MockImages::serving(png_bytes());
        let (service, store) = service(search, images.clone());

        let pin = service.add_pin(40.7, -74.0).await.unwrap();
        service.sync_photos(&pin.id, false).await.unwrap();

        let first = service.get_image_bytes("a").await.unwrap();
        assert_eq!(images.calls(), 1);
        assert!(store.get_photo("a").unwrap().unwrap().has_cached_image());
        assert_eq!(
            image::guess_format(&first).unwrap(),
            image::ImageFormat::Jpeg
        );

        let second = service.get_image_bytes("a").await.unwrap();
        assert_eq!(images.calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn undecodable_image_is_a_decode_error_and_not_cached() {
        let search = MockSearch::with_pages(&[(1, &["a"])]);
        let images = MockImages::serving(b"not an image".to_vec());
        let (service, store) = service(search, images.clone());

        let pin = service.add_pin(40.7, -74.0).await.unwrap();
        service.sync_photos(&pin.id, false).await.unwrap();

        let err = service.get_image_bytes("a").await.unwrap_err();
        assert!(matches!(err, AlbumError::ImageDecode(_)));
        assert!(!store.get_photo("a").unwrap().unwrap().has_cached_image());

        // Nothing was cached, so the next attempt hits the network again.
        let _ = service.get_image_bytes("a").await;
        assert_eq!(images.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let search = MockSearch::with_pages(&[]);
        let (service, _store) = service(search, MockImages::serving(png_bytes()));

        assert!(matches!(
            service.sync_photos("nope", false).await.unwrap_err(),
            AlbumError::PinNotFound(_)
        ));
        assert!(matches!(
            service.remove_pin("nope").await.unwrap_err(),
            AlbumError::PinNotFound(_)
        ));
        assert!(matches!(
            service.remove_photo("nope").await.unwrap_err(),
            AlbumError::PhotoNotFound(_)
        ));
        assert!(matches!(
            service.get_image_bytes("nope").await.unwrap_err(),
            AlbumError::PhotoNotFound(_)
        ));
    }

    #[tokio::test]
    async fn full_album_lifecycle() {
        let search = MockSearch::with_pages(&[(1, &["a", "b", "c"])]);
        let (service, _store) = service(search, MockImages::serving(png_bytes()));

        let pin = service.add_pin(37.7, -122.4).await.unwrap();
        let photos = service.sync_photos(&pin.id, false).await.unwrap();
        assert_eq!(ids(&photos), vec!["a", "b", "c"]);

        service.remove_photo("b").await.unwrap();
        let photos = service.list_photos(&pin.id).await.unwrap();
        assert_eq!(ids(&photos), vec!["a", "c"]);

        service.remove_pin(&pin.id).await.unwrap();
        assert!(service.list_photos(&pin.id).await.unwrap().is_empty());
        assert!(service.list_pins().await.unwrap().is_empty());
    }
}

