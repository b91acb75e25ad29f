mod sled;

use uuid::Uuid;

use crate::Result;

pub use self::sled::{Change, SledDb as Database, Watcher};

/// Items stored under a stable unique id.
pub trait Identifiable {
    fn get_id(&self) -> Uuid;
}

/// Items stored in a named collection.
pub trait Collectable {
    fn get_collection_name() -> &'static str;
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let t: T = pot::from_slice(bytes)?;
    Ok(t)
}

pub fn encode<T: serde::Serialize>(item: &T) -> Result<Vec<u8>> {
    let bytes = pot::to_vec(item)?;
    Ok(bytes)
}
