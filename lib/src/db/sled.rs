use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Event, Subscriber};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::ErrorKind, Result};

use super::{decode, encode, Collectable, Identifiable};

/// How often an idle watcher thread checks whether its consumer is gone.
const WATCH_POLL: Duration = Duration::from_millis(500);

/// Document store backed by sled. Each collection lives in its own tree,
/// keyed by the document uuid.
#[derive(Clone, Debug)]
pub struct SledDb {
    inner: sled::Db,
}

/// Single change observed on a watched collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Set(Uuid),
    Removed(Uuid),
}

impl SledDb {
    pub fn new(config: &crate::config::Db) -> Result<Self> {
        if config.temporary {
            return Self::temporary();
        }
        let inner = sled::Config::default().path(&config.path).open()?;
        Ok(Self { inner })
    }

    /// Opens a store that is removed once the last handle is dropped.
    pub fn temporary() -> Result<Self> {
        let inner = sled::Config::default().temporary(true).open()?;
        Ok(Self { inner })
    }

    pub fn get_collection<T: DeserializeOwned + Collectable>(&self) -> Result<Vec<T>> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, value_bytes) = entry?;
            out.push(decode(&value_bytes)?);
        }
        Ok(out)
    }

    /// Returns the length of the collection as defined for the specified type.
    pub fn len<T: Collectable>(&self) -> Result<usize> {
        Ok(self.inner.open_tree(T::get_collection_name())?.len())
    }

    /// Gets an item from the collection defined for the item type, failing
    /// with `NotFound` if it doesn't exist.
    pub fn get<T: DeserializeOwned + Collectable>(&self, id: Uuid) -> Result<T> {
        self.get_opt(id)?.ok_or_else(|| {
            ErrorKind::NotFound(format!(
                "entity with id '{}' not found in collection {}",
                id,
                T::get_collection_name()
            ))
            .into()
        })
    }

    pub fn get_opt<T: DeserializeOwned + Collectable>(&self, id: Uuid) -> Result<Option<T>> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        match tree.get(id)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize + Identifiable + Collectable>(&self, value: &T) -> Result<()> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        tree.insert(value.get_id(), encode(value)?)?;
        Ok(())
    }

    /// Atomically applies `f` to the stored item.
    ///
    /// The closure may run more than once if the item is modified
    /// concurrently; it must only depend on the item it's given. Returning
    /// `None` leaves the item untouched.
    pub fn update<T, R, F>(&self, id: Uuid, mut f: F) -> Result<Option<R>>
    where
        T: Serialize + DeserializeOwned + Collectable,
        F: FnMut(&mut T) -> Option<R>,
    {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        loop {
            let current = tree.get(id)?.ok_or_else(|| {
                ErrorKind::NotFound(format!(
                    "entity with id '{}' not found in collection {}",
                    id,
                    T::get_collection_name()
                ))
            })?;
            let mut value: T = decode(&current)?;
            let out = match f(&mut value) {
                Some(out) => out,
                None => return Ok(None),
            };
            let encoded = encode(&value)?;
            match tree.compare_and_swap(id, Some(current), Some(encoded))? {
                Ok(()) => return Ok(Some(out)),
                // Lost the race against another writer, start over from the
                // fresh value.
                Err(_) => continue,
            }
        }
    }

    /// Subscribes to all changes in the collection of `T`.
    pub fn watch<T: Collectable>(&self) -> Result<Watcher> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        Ok(Watcher::spawn(tree.watch_prefix(Vec::<u8>::new())))
    }

    /// Subscribes to changes of a single item.
    pub fn watch_one<T: Collectable>(&self, id: Uuid) -> Result<Watcher> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        Ok(Watcher::spawn(tree.watch_prefix(id.as_bytes().to_vec())))
    }
}

/// Change feed of a watched collection.
///
/// sled stops every writer on a tree once one of its subscribers has a full
/// buffer, so events are drained on a dedicated thread as soon as they are
/// published and queued here until the consumer gets to them.
#[derive(Debug)]
pub struct Watcher {
    events: mpsc::UnboundedReceiver<Event>,
}

impl Watcher {
    fn spawn(mut subscriber: Subscriber) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        std::thread::spawn(move || loop {
            match subscriber.next_timeout(WATCH_POLL) {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) if tx.is_closed() => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self { events }
    }

    /// Waits for the next event, `None` once the tree is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

impl Change {
    /// Converts a raw sled event into a change, skipping keys that aren't
    /// valid ids.
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::Insert { key, .. } => Uuid::from_slice(key).ok().map(Change::Set),
            Event::Remove { key } => Uuid::from_slice(key).ok().map(Change::Removed),
        }
    }
}
