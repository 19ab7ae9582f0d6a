//! Typed storage endpoints over the raw KV.
//!
//! Records are serialized as JSON under the layout in [`crate::keypath`].
//! All mutating endpoints that must be serialized under leadership take a
//! [`Leadership`] and commit through a guarded txn.

use rk_common::{Result, RkError};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::election::Leadership;
use crate::keypath;
use crate::kv::{Compare, KvRef, Txn, TxnOp, WatchStream};

/// Typed facade over one cluster's persisted state.
#[derive(Clone)]
pub struct Storage {
    kv: KvRef,
    cluster: String,
}

impl Storage {
    /// Wraps a KV handle for `cluster`.
    pub fn new(kv: KvRef, cluster: impl Into<String>) -> Self {
        Self {
            kv,
            cluster: cluster.into(),
        }
    }

    /// The underlying KV handle.
    pub fn kv(&self) -> &KvRef {
        &self.kv
    }

    /// Cluster name this facade is rooted at.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn save_json<T: Serialize>(&self, key: String, record: &T) -> Result<()> {
        let value = serde_json::to_vec(record)
            .map_err(|e| RkError::Internal(format!("encode record for {key}: {e}")))?;
        self.kv.put(&key, value).await
    }

    async fn load_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>> {
        match self.kv.get(&key).await? {
            Some(value) => serde_json::from_slice(&value)
                .map(Some)
                .map_err(|e| RkError::Internal(format!("decode record at {key}: {e}"))),
            None => Ok(None),
        }
    }

    async fn save_u64(&self, key: String, value: u64) -> Result<()> {
        self.kv.put(&key, value.to_string().into_bytes()).await
    }

    async fn load_u64(&self, key: String) -> Result<Option<u64>> {
        match self.kv.get(&key).await? {
            Some(raw) => {
                let text = String::from_utf8_lossy(&raw);
                text.parse::<u64>()
                    .map(Some)
                    .map_err(|e| RkError::Internal(format!("decode u64 at {key}: {e}")))
            }
            None => Ok(None),
        }
    }

    // ---- TSO ----

    /// Persists the TSO high-water mark for one keyspace-group, guarded by
    /// the current leadership.
    pub async fn save_timestamp(
        &self,
        group: u32,
        ts_ms: u64,
        leadership: &Leadership,
    ) -> Result<()> {
        let key = keypath::timestamp_path(&self.cluster, group);
        leadership
            .commit(
                self.kv.as_ref(),
                vec![TxnOp::Put {
                    key,
                    value: ts_ms.to_string().into_bytes(),
                    lease: None,
                }],
            )
            .await
    }

    /// Loads the persisted TSO high-water mark, if any.
    pub async fn load_timestamp(&self, group: u32) -> Result<Option<u64>> {
        self.load_u64(keypath::timestamp_path(&self.cluster, group))
            .await
    }

    // ---- cluster / bootstrap ----

    /// Persists the cluster meta record only when the cluster is not yet
    /// bootstrapped. Returns whether this call bootstrapped it.
    pub async fn bootstrap_cluster<T: Serialize>(&self, meta: &T) -> Result<bool> {
        let key = keypath::cluster_meta_path(&self.cluster);
        let value = serde_json::to_vec(meta)
            .map_err(|e| RkError::Internal(format!("encode cluster meta: {e}")))?;
        let outcome = self
            .kv
            .txn(
                Txn::new()
                    .compare(Compare::NotExists(key.clone()))
                    .then(TxnOp::Put {
                        key,
                        value,
                        lease: None,
                    }),
            )
            .await?;
        Ok(outcome.succeeded)
    }

    /// Loads the cluster meta record.
    pub async fn load_cluster_meta<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.load_json(keypath::cluster_meta_path(&self.cluster))
            .await
    }

    /// Whether the cluster meta record exists.
    pub async fn is_bootstrapped(&self) -> Result<bool> {
        Ok(self
            .kv
            .get(&keypath::cluster_meta_path(&self.cluster))
            .await?
            .is_some())
    }

    /// Allocates `count` fresh ids; returns the first id of the contiguous
    /// block. Retries the CAS a bounded number of times.
    pub async fn alloc_id(&self, count: u64) -> Result<u64> {
        let key = keypath::id_alloc_path(&self.cluster);
        for _ in 0..16 {
            let current = self.load_u64(key.clone()).await?;
            let base = current.unwrap_or(0);
            let end = base
                .checked_add(count)
                .ok_or_else(|| RkError::InvalidValue("id space exhausted".to_string()))?;
            let compare = match current {
                Some(_) => Compare::ValueEquals(key.clone(), base.to_string().into_bytes()),
                None => Compare::NotExists(key.clone()),
            };
            let outcome = self
                .kv
                .txn(Txn::new().compare(compare).then(TxnOp::Put {
                    key: key.clone(),
                    value: end.to_string().into_bytes(),
                    lease: None,
                }))
                .await?;
            if outcome.succeeded {
                return Ok(base + 1);
            }
        }
        Err(RkError::TxnInternal(
            "id allocation lost too many races".to_string(),
        ))
    }

    // ---- store / region meta ----

    /// Persists one store meta record.
    pub async fn save_store<T: Serialize>(&self, store_id: u64, meta: &T) -> Result<()> {
        self.save_json(keypath::store_path(&self.cluster, store_id), meta)
            .await
    }

    /// Loads one store meta record.
    pub async fn load_store<T: DeserializeOwned>(&self, store_id: u64) -> Result<Option<T>> {
        self.load_json(keypath::store_path(&self.cluster, store_id))
            .await
    }

    /// Removes one store meta record (tombstone purge).
    pub async fn delete_store(&self, store_id: u64) -> Result<()> {
        self.kv
            .delete(&keypath::store_path(&self.cluster, store_id))
            .await?;
        Ok(())
    }

    /// Loads every store meta record in id order.
    pub async fn load_all_stores<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let entries = self
            .kv
            .get_prefix(&keypath::store_prefix(&self.cluster))
            .await?;
        entries
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_slice(&value)
                    .map_err(|e| RkError::Internal(format!("decode record at {key}: {e}")))
            })
            .collect()
    }

    /// Persists one region meta record.
    pub async fn save_region<T: Serialize>(&self, region_id: u64, meta: &T) -> Result<()> {
        self.save_json(keypath::region_path(&self.cluster, region_id), meta)
            .await
    }

    /// Loads one region meta record.
    pub async fn load_region<T: DeserializeOwned>(&self, region_id: u64) -> Result<Option<T>> {
        self.load_json(keypath::region_path(&self.cluster, region_id))
            .await
    }

    /// Removes one region meta record (after a merge retires it).
    pub async fn delete_region(&self, region_id: u64) -> Result<()> {
        self.kv
            .delete(&keypath::region_path(&self.cluster, region_id))
            .await?;
        Ok(())
    }

    /// Loads every region meta record in id order.
    pub async fn load_all_regions<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let entries = self
            .kv
            .get_prefix(&keypath::region_prefix(&self.cluster))
            .await?;
        entries
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_slice(&value)
                    .map_err(|e| RkError::Internal(format!("decode record at {key}: {e}")))
            })
            .collect()
    }

    // ---- cluster config ----

    /// Persists the cluster-wide config record.
    pub async fn save_cluster_config<T: Serialize>(&self, config: &T) -> Result<()> {
        self.save_json(keypath::cluster_config_path(&self.cluster), config)
            .await
    }

    /// Loads the cluster-wide config record.
    pub async fn load_cluster_config<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.load_json(keypath::cluster_config_path(&self.cluster))
            .await
    }

    // ---- scheduler configs ----

    /// Persists one scheduler's serialized config under its name.
    pub async fn save_scheduler_config(&self, name: &str, payload: Vec<u8>) -> Result<()> {
        self.kv
            .put(&keypath::scheduler_config_path(&self.cluster, name), payload)
            .await
    }

    /// Loads one scheduler's serialized config.
    pub async fn load_scheduler_config(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.kv
            .get(&keypath::scheduler_config_path(&self.cluster, name))
            .await
    }

    /// Removes one scheduler's serialized config.
    pub async fn remove_scheduler_config(&self, name: &str) -> Result<()> {
        self.kv
            .delete(&keypath::scheduler_config_path(&self.cluster, name))
            .await?;
        Ok(())
    }

    /// Lists every persisted scheduler config as (name, payload).
    pub async fn load_all_scheduler_configs(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = keypath::scheduler_config_prefix(&self.cluster);
        let entries = self.kv.get_prefix(&prefix).await?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| (key[prefix.len()..].to_string(), value))
            .collect())
    }

    // ---- timestamps visible to clients ----

    /// Persists the externally-set timestamp.
    pub async fn save_external_timestamp(&self, ts: u64) -> Result<()> {
        self.save_u64(keypath::external_timestamp_path(&self.cluster), ts)
            .await
    }

    /// Loads the externally-set timestamp.
    pub async fn load_external_timestamp(&self) -> Result<Option<u64>> {
        self.load_u64(keypath::external_timestamp_path(&self.cluster))
            .await
    }

    /// Persists the cluster minimal resolved timestamp.
    pub async fn save_min_resolved_ts(&self, ts: u64) -> Result<()> {
        self.save_u64(keypath::min_resolved_ts_path(&self.cluster), ts)
            .await
    }

    /// Loads the cluster minimal resolved timestamp.
    pub async fn load_min_resolved_ts(&self) -> Result<Option<u64>> {
        self.load_u64(keypath::min_resolved_ts_path(&self.cluster))
            .await
    }

    // ---- global config namespace ----

    /// Writes one entry in the global config namespace.
    pub async fn store_global_config(&self, name: &str, value: Vec<u8>) -> Result<()> {
        self.kv.put(&keypath::global_config_path(name), value).await
    }

    /// Removes one entry from the global config namespace.
    pub async fn delete_global_config(&self, name: &str) -> Result<()> {
        self.kv.delete(&keypath::global_config_path(name)).await?;
        Ok(())
    }

    /// Loads named entries; a missing name yields `None` at its position.
    pub async fn load_global_config(
        &self,
        names: &[String],
    ) -> Result<Vec<(String, Option<Vec<u8>>)>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let value = self.kv.get(&keypath::global_config_path(name)).await?;
            out.push((name.clone(), value));
        }
        Ok(out)
    }

    /// Lists every entry under the global config namespace.
    pub async fn list_global_config(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.kv.get_prefix(keypath::GLOBAL_CONFIG_PREFIX).await
    }

    /// Watches the global config namespace from `revision`.
    pub async fn watch_global_config(&self, revision: u64) -> Result<WatchStream> {
        self.kv
            .watch_prefix(keypath::GLOBAL_CONFIG_PREFIX, revision)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct FakeMeta {
        id: u64,
        address: String,
    }

    fn storage() -> Storage {
        Storage::new(Arc::new(MemoryKv::new()), "pd")
    }

    #[tokio::test]
    async fn store_records_round_trip() {
        let storage = storage();
        let meta = FakeMeta {
            id: 4,
            address: "127.0.0.1:20160".to_string(),
        };
        storage.save_store(4, &meta).await.unwrap();
        let loaded: FakeMeta = storage.load_store(4).await.unwrap().unwrap();
        assert_eq!(loaded, meta);

        storage
            .save_store(
                2,
                &FakeMeta {
                    id: 2,
                    address: "b".into(),
                },
            )
            .await
            .unwrap();
        let all: Vec<FakeMeta> = storage.load_all_stores().await.unwrap();
        assert_eq!(all.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 4]);
    }

    #[tokio::test]
    async fn bootstrap_is_first_writer_wins() {
        let storage = storage();
        assert!(!storage.is_bootstrapped().await.unwrap());
        assert!(storage
            .bootstrap_cluster(&FakeMeta {
                id: 1,
                address: "a".into()
            })
            .await
            .unwrap());
        assert!(!storage
            .bootstrap_cluster(&FakeMeta {
                id: 2,
                address: "b".into()
            })
            .await
            .unwrap());
        let meta: FakeMeta = storage.load_cluster_meta().await.unwrap().unwrap();
        assert_eq!(meta.id, 1);
    }

    #[tokio::test]
    async fn alloc_id_hands_out_disjoint_blocks() {
        let storage = storage();
        let first = storage.alloc_id(10).await.unwrap();
        let second = storage.alloc_id(10).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 11);
    }

    #[tokio::test]
    async fn scheduler_configs_are_listed_by_name() {
        let storage = storage();
        storage
            .save_scheduler_config("balance-range-scheduler", b"[]".to_vec())
            .await
            .unwrap();
        let configs = storage.load_all_scheduler_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, "balance-range-scheduler");

        storage
            .remove_scheduler_config("balance-range-scheduler")
            .await
            .unwrap();
        assert!(storage
            .load_scheduler_config("balance-range-scheduler")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn global_config_loads_preserve_requested_order() {
        let storage = storage();
        storage
            .store_global_config("source_id", b"7".to_vec())
            .await
            .unwrap();
        let loaded = storage
            .load_global_config(&["missing".to_string(), "source_id".to_string()])
            .await
            .unwrap();
        assert_eq!(loaded[0], ("missing".to_string(), None));
        assert_eq!(loaded[1], ("source_id".to_string(), Some(b"7".to_vec())));
    }
}
