//! Item collection: models, validation and the in-memory store

pub mod models;
mod store;

pub use models::{Item, ItemCreate, ItemUpdate};
pub use store::{ItemError, ItemStore};
