//! Headless dedicated server for Tessera scenes.

mod host;

pub use host::{AVATAR_PREFAB, ServerHost};
