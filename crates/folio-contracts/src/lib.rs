pub mod cache_store;
pub mod events;
pub mod image_data;
pub mod models;
pub mod quality;
pub mod request;
pub mod session;
