pub mod client;

pub use client::{FlickrClient, FlickrError, RemotePhoto};
