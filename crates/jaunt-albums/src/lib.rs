pub mod image;
pub mod service;

pub use service::{AlbumError, AlbumService, ImageFetch, PhotoSearch};
