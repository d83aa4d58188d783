//! Object-store contract: bucket + key blob storage for artifacts and logs.
//!
//! Workers write; the engine reads and deletes. Objects are immutable by
//! convention, so there is no update path.

use opendal::Operator;

use crate::config::Config;

#[derive(Clone)]
pub struct ArtifactStore {
    op: Operator,
}

impl ArtifactStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    /// S3-compatible backend against the configured endpoint and bucket.
    pub fn s3(config: &Config) -> anyhow::Result<Self> {
        let builder = opendal::services::S3::default()
            .bucket(&config.s3_bucket)
            .endpoint(&config.s3_endpoint)
            .region(&config.s3_region)
            .access_key_id(&config.s3_access_key)
            .secret_access_key(&config.s3_secret_key);
        Ok(Self {
            op: Operator::new(builder)?.finish(),
        })
    }

    /// In-memory backend for tests and local development.
    pub fn in_memory() -> Self {
        let op = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        Self { op }
    }

    /// Object keys under `prefix`, ascending.
    pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, opendal::Error> {
        let entries = self.op.list_with(prefix).recursive(true).await?;
        let mut keys: Vec<String> = entries
            .into_iter()
            .filter(|e| !e.path().ends_with('/'))
            .map(|e| e.path().to_owned())
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>, opendal::Error> {
        Ok(self.op.read(key).await?.to_vec())
    }

    pub async fn write(&self, key: &str, body: Vec<u8>) -> Result<(), opendal::Error> {
        self.op.write(key, body).await?;
        Ok(())
    }

    pub async fn delete_object(&self, key: &str) -> Result<(), opendal::Error> {
        self.op.delete(key).await
    }

    /// Delete every object under `prefix`.
    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<(), opendal::Error> {
        self.op.remove_all(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_by_prefix_is_sorted_and_scoped() {
        let store = ArtifactStore::in_memory();
        store
            .write("pipelines/p1/builds/1/stages/1/logs/b.log", b"b".to_vec())
            .await
            .unwrap();
        store
            .write("pipelines/p1/builds/1/stages/1/logs/a.log", b"a".to_vec())
            .await
            .unwrap();
        store
            .write("pipelines/p2/builds/1/stages/1/logs/x.log", b"x".to_vec())
            .await
            .unwrap();

        let keys = store
            .list_by_prefix("pipelines/p1/builds/1/stages/1/logs/")
            .await
            .unwrap();
        assert_eq!(
            keys,
            vec![
                "pipelines/p1/builds/1/stages/1/logs/a.log",
                "pipelines/p1/builds/1/stages/1/logs/b.log",
            ]
        );
    }

    #[tokio::test]
    async fn delete_object_removes_one_key() {
        let store = ArtifactStore::in_memory();
        store.write("pipelines/p1/a", b"1".to_vec()).await.unwrap();
        store.write("pipelines/p1/b", b"2".to_vec()).await.unwrap();

        store.delete_object("pipelines/p1/a").await.unwrap();

        let keys = store.list_by_prefix("pipelines/p1/").await.unwrap();
        assert_eq!(keys, vec!["pipelines/p1/b"]);
        assert_eq!(store.read("pipelines/p1/b").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn delete_by_prefix_empties_the_subtree() {
        let store = ArtifactStore::in_memory();
        store.write("pipelines/p1/a", b"1".to_vec()).await.unwrap();
        store.write("pipelines/p1/b/c", b"2".to_vec()).await.unwrap();
        store.write("pipelines/p2/a", b"3".to_vec()).await.unwrap();

        store.delete_by_prefix("pipelines/p1/").await.unwrap();

        assert!(store.list_by_prefix("pipelines/p1/").await.unwrap().is_empty());
        assert_eq!(store.list_by_prefix("pipelines/p2/").await.unwrap().len(), 1);
    }
}
