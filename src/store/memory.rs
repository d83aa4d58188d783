use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{KvEntry, KvStore, StoreError};

/// In-memory [`KvStore`] backed by a `BTreeMap`.
///
/// Used by tests and local development. All operations take the single write
/// lock, which makes `create_in_directory` trivially linearisable.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Name of the direct child of `dir` that `key` belongs to, if any.
fn child_name<'a>(dir: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(dir)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

/// Numeric children sort numerically, everything else lexicographically after.
fn child_order(name: &str) -> (u8, u64, String) {
    match name.parse::<u64>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, name.to_owned()),
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_owned()));
        }
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn create_in_directory(&self, dir: &str, value: Vec<u8>) -> Result<String, StoreError> {
        let mut entries = self.entries.write().unwrap();
        let next = entries
            .keys()
            .filter_map(|k| child_name(dir, k))
            .filter_map(|name| name.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let key = format!("{dir}/{next}");
        entries.insert(key.clone(), value);
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_owned()))
    }

    async fn update(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_owned())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_owned()))
    }

    async fn delete_subtree(&self, prefix: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap();
        let subtree = format!("{prefix}/");
        entries.retain(|k, _| k != prefix && !k.starts_with(&subtree));
        Ok(())
    }

    async fn list_directory(&self, dir: &str) -> Result<Vec<KvEntry>, StoreError> {
        let entries = self.entries.read().unwrap();
        let mut children: Vec<(String, KvEntry)> = entries
            .iter()
            .filter(|(k, _)| child_name(dir, k).is_some())
            .map(|(k, v)| {
                (
                    k.clone(),
                    KvEntry {
                        key: k.clone(),
                        value: v.clone(),
                    },
                )
            })
            .collect();
        children.sort_by_key(|(k, _)| child_order(child_name(dir, k).unwrap()));
        Ok(children.into_iter().map(|(_, e)| e).collect())
    }
}
