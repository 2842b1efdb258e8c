//! Record store.
//!
//! The store maps record identities to versioned payloads, organised in
//! clusters. Each physical cluster keeps its records behind its own lock;
//! the optimistic version check and the write happen inside that lock, so
//! two writers racing on the same identity are serialised and the loser
//! sees a [`CoreError::VersionConflict`].
//!
//! Lock order is directory, then cluster data, then cache. The directory
//! lock is released before cluster data is locked except while a cluster
//! is being added.

use crate::cache::RecordCache;
use crate::cluster::{ClusterInfo, ClusterKind};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::segment::{SegmentManager, SegmentRecord};
use crate::stats::StoreStats;
use crate::types::{ClusterId, Record, RecordId, RecordType};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Slot {
    owner: ClusterId,
    version: i32,
    record_type: RecordType,
    content: Bytes,
}

#[derive(Debug, Default)]
struct ClusterData {
    slots: BTreeMap<i64, Slot>,
    next_position: i64,
    /// Live records per owning cluster.
    owned: HashMap<ClusterId, i64>,
}

impl ClusterData {
    fn owned_slot(&self, owner: ClusterId, position: i64) -> Option<&Slot> {
        self.slots.get(&position).filter(|slot| slot.owner == owner)
    }

    fn insert(&mut self, position: i64, slot: Slot) {
        let owner = slot.owner;
        if let Some(old) = self.slots.insert(position, slot) {
            self.adjust_owned(old.owner, -1);
        }
        self.adjust_owned(owner, 1);
        self.next_position = self.next_position.max(position + 1);
    }

    fn remove(&mut self, position: i64) -> Option<Slot> {
        let old = self.slots.remove(&position)?;
        self.adjust_owned(old.owner, -1);
        Some(old)
    }

    fn adjust_owned(&mut self, owner: ClusterId, delta: i64) {
        let count = self.owned.entry(owner).or_insert(0);
        *count += delta;
    }

    fn count(&self, owner: ClusterId) -> i64 {
        self.owned.get(&owner).copied().unwrap_or(0)
    }
}

struct ClusterEntry {
    info: ClusterInfo,
    data: Arc<RwLock<ClusterData>>,
}

#[derive(Default)]
struct Directory {
    by_id: BTreeMap<ClusterId, ClusterEntry>,
    by_name: HashMap<String, ClusterId>,
}

impl Directory {
    fn next_id(&self) -> CoreResult<ClusterId> {
        match self.by_id.keys().next_back() {
            None => Ok(0),
            Some(&last) => last
                .checked_add(1)
                .ok_or_else(|| CoreError::invalid_operation("cluster id space exhausted")),
        }
    }

    fn insert(&mut self, info: ClusterInfo) -> CoreResult<()> {
        let data = match &info.kind {
            ClusterKind::Physical { .. } => Arc::new(RwLock::new(ClusterData::default())),
            ClusterKind::Logical { container_id, .. } => {
                let container = self
                    .by_id
                    .get(container_id)
                    .ok_or_else(|| CoreError::cluster_id_not_found(*container_id))?;
                Arc::clone(&container.data)
            }
        };
        self.by_name.insert(info.name.clone(), info.id);
        self.by_id.insert(info.id, ClusterEntry { info, data });
        Ok(())
    }
}

/// Where a cluster's records live.
struct Route {
    owner: ClusterId,
    storage: ClusterId,
    data: Arc<RwLock<ClusterData>>,
}

/// Versioned record storage with a read-through cache.
pub struct RecordStore {
    directory: RwLock<Directory>,
    segments: Arc<SegmentManager>,
    cache: Option<RecordCache>,
    stats: StoreStats,
    default_cluster: String,
}

impl RecordStore {
    /// Rebuilds a store from replayed log records.
    ///
    /// When the log holds no clusters the store is new and the configured
    /// initial clusters are created.
    pub fn recover(
        config: &Config,
        segments: Arc<SegmentManager>,
        log: &[SegmentRecord],
    ) -> CoreResult<Self> {
        let mut directory = Directory::default();
        let mut records = 0usize;

        for entry in log {
            match entry {
                SegmentRecord::ClusterAdded { id, name, kind } => {
                    directory.insert(ClusterInfo {
                        id: *id,
                        name: name.clone(),
                        kind: kind.clone(),
                    })?;
                }
                SegmentRecord::RecordPut {
                    slot,
                    owner,
                    version,
                    record_type,
                    content,
                } => {
                    let data = directory
                        .by_id
                        .get(&slot.cluster_id)
                        .map(|entry| Arc::clone(&entry.data))
                        .ok_or_else(|| {
                            CoreError::segment_corruption(format!(
                                "record {slot} precedes its cluster"
                            ))
                        })?;
                    data.write().insert(
                        slot.position,
                        Slot {
                            owner: *owner,
                            version: *version,
                            record_type: *record_type,
                            content: content.clone(),
                        },
                    );
                    records += 1;
                }
                SegmentRecord::RecordRemoved { slot } => {
                    if let Some(entry) = directory.by_id.get(&slot.cluster_id) {
                        entry.data.write().remove(slot.position);
                    }
                }
                SegmentRecord::DictionaryPut { .. } | SegmentRecord::DictionaryRemoved { .. } => {}
            }
        }

        let fresh = directory.by_id.is_empty();
        let store = Self {
            directory: RwLock::new(directory),
            segments,
            cache: config
                .use_cache
                .then(|| RecordCache::new(config.cache_capacity)),
            stats: StoreStats::new(),
            default_cluster: config.default_cluster.to_lowercase(),
        };

        if fresh {
            for name in &config.initial_clusters {
                store.add_physical_cluster(name, None, -1)?;
            }
        }
        debug!(
            clusters = store.directory.read().by_id.len(),
            records, fresh, "record store ready"
        );
        Ok(store)
    }

    fn route(&self, cluster_id: ClusterId) -> CoreResult<Route> {
        let directory = self.directory.read();
        let entry = directory
            .by_id
            .get(&cluster_id)
            .ok_or_else(|| CoreError::cluster_id_not_found(cluster_id))?;
        Ok(Route {
            owner: entry.info.id,
            storage: entry.info.storage_id(),
            data: Arc::clone(&entry.data),
        })
    }

    fn cache_put(&self, record: &Record) {
        if let Some(cache) = &self.cache {
            cache.insert(record.cache_key(), record.clone());
        }
    }

    fn cache_evict(&self, id: RecordId) {
        if let Some(cache) = &self.cache {
            cache.remove(&id.to_string());
        }
    }

    /// Reads a record.
    ///
    /// Malformed identities yield `None` without touching storage. With the
    /// cache enabled, a hit is answered without a store read.
    pub fn read(&self, id: RecordId) -> CoreResult<Option<Record>> {
        if !id.is_valid() {
            return Ok(None);
        }

        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get(&id.to_string()) {
                self.stats.record_cache_hit();
                return Ok(Some(record));
            }
            self.stats.record_cache_miss();
        }

        let route = self.route(id.cluster_id)?;
        let data = route.data.read();
        let record = data
            .owned_slot(route.owner, id.position)
            .map(|slot| Record::new(id, slot.version, slot.record_type, slot.content.clone()));
        self.stats
            .record_store_read(record.as_ref().map_or(0, |r| r.content.len() as u64));

        // Populate while the cluster is locked so a concurrent writer
        // cannot be overwritten by this older snapshot.
        if let Some(record) = &record {
            self.cache_put(record);
        }
        Ok(record)
    }

    /// Reads straight from cluster storage, bypassing the cache.
    pub fn read_uncached(&self, id: RecordId) -> CoreResult<Option<Record>> {
        if !id.is_valid() {
            return Ok(None);
        }
        let route = self.route(id.cluster_id)?;
        let data = route.data.read();
        let record = data
            .owned_slot(route.owner, id.position)
            .map(|slot| Record::new(id, slot.version, slot.record_type, slot.content.clone()));
        self.stats
            .record_store_read(record.as_ref().map_or(0, |r| r.content.len() as u64));
        Ok(record)
    }

    /// Creates a record at the next position of `cluster_id` and returns it.
    pub fn create(
        &self,
        cluster_id: ClusterId,
        content: impl Into<Bytes>,
        record_type: RecordType,
    ) -> CoreResult<Record> {
        let content = content.into();
        let route = self.route(cluster_id)?;
        let mut data = route.data.write();

        let position = data.next_position;
        self.segments.append(&SegmentRecord::RecordPut {
            slot: RecordId::new(route.storage, position),
            owner: route.owner,
            version: 0,
            record_type,
            content: content.clone(),
        })?;
        data.insert(
            position,
            Slot {
                owner: route.owner,
                version: 0,
                record_type,
                content: content.clone(),
            },
        );

        let record = Record::new(RecordId::new(route.owner, position), 0, record_type, content);
        self.stats.record_create(record.content.len() as u64);
        self.cache_put(&record);
        Ok(record)
    }

    /// Replaces a record's content when its stored version equals
    /// `expected_version`; returns the new version.
    pub fn update(
        &self,
        id: RecordId,
        content: impl Into<Bytes>,
        expected_version: i32,
        record_type: RecordType,
    ) -> CoreResult<i32> {
        self.replace(id, content.into(), expected_version, Some(record_type))
            .map(|(updated, _)| updated.version)
    }

    /// Update that also hands back the snapshot it replaced.
    ///
    /// `record_type` of `None` keeps the stored type.
    pub(crate) fn replace(
        &self,
        id: RecordId,
        content: Bytes,
        expected_version: i32,
        record_type: Option<RecordType>,
    ) -> CoreResult<(Record, Record)> {
        if !id.is_valid() {
            return Err(CoreError::RecordNotFound { id });
        }
        let route = self.route(id.cluster_id)?;
        let mut data = route.data.write();

        let current = data
            .owned_slot(route.owner, id.position)
            .cloned()
            .ok_or(CoreError::RecordNotFound { id })?;
        if current.version != expected_version {
            self.stats.record_version_conflict();
            return Err(CoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }
        let version = current
            .version
            .checked_add(1)
            .ok_or_else(|| CoreError::invalid_operation(format!("version overflow on {id}")))?;
        let record_type = record_type.unwrap_or(current.record_type);

        self.segments.append(&SegmentRecord::RecordPut {
            slot: RecordId::new(route.storage, id.position),
            owner: route.owner,
            version,
            record_type,
            content: content.clone(),
        })?;
        data.insert(
            id.position,
            Slot {
                owner: route.owner,
                version,
                record_type,
                content: content.clone(),
            },
        );

        let updated = Record::new(id, version, record_type, content);
        let previous = Record::new(id, current.version, current.record_type, current.content);
        self.stats.record_update(updated.content.len() as u64);
        self.cache_put(&updated);
        Ok((updated, previous))
    }

    /// Deletes a record when its stored version equals `expected_version`.
    pub fn delete(&self, id: RecordId, expected_version: i32) -> CoreResult<()> {
        self.remove(id, expected_version).map(|_| ())
    }

    /// Delete that hands back the removed snapshot.
    pub(crate) fn remove(&self, id: RecordId, expected_version: i32) -> CoreResult<Record> {
        if !id.is_valid() {
            return Err(CoreError::RecordNotFound { id });
        }
        let route = self.route(id.cluster_id)?;
        let mut data = route.data.write();

        let current = data
            .owned_slot(route.owner, id.position)
            .cloned()
            .ok_or(CoreError::RecordNotFound { id })?;
        if current.version != expected_version {
            self.stats.record_version_conflict();
            return Err(CoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }

        self.segments.append(&SegmentRecord::RecordRemoved {
            slot: RecordId::new(route.storage, id.position),
        })?;
        data.remove(id.position);

        self.stats.record_delete();
        self.cache_evict(id);
        Ok(Record::new(
            id,
            current.version,
            current.record_type,
            current.content,
        ))
    }

    /// Puts a record back the way it was before a batch touched it.
    ///
    /// `written_version` is the version the batch left behind, or `None`
    /// when the batch deleted the record. The restore only happens while
    /// the record is still in that state; returns whether it happened.
    pub(crate) fn compensate(
        &self,
        id: RecordId,
        written_version: Option<i32>,
        previous: Option<&Record>,
    ) -> CoreResult<bool> {
        let route = self.route(id.cluster_id)?;
        let mut data = route.data.write();

        let current = data.owned_slot(route.owner, id.position).map(|s| s.version);
        if current != written_version {
            return Ok(false);
        }

        let slot = RecordId::new(route.storage, id.position);
        match previous {
            Some(previous) => {
                self.segments.append(&SegmentRecord::RecordPut {
                    slot,
                    owner: route.owner,
                    version: previous.version,
                    record_type: previous.record_type,
                    content: previous.content.clone(),
                })?;
                data.insert(
                    id.position,
                    Slot {
                        owner: route.owner,
                        version: previous.version,
                        record_type: previous.record_type,
                        content: previous.content.clone(),
                    },
                );
                self.cache_put(previous);
            }
            None => {
                self.segments
                    .append(&SegmentRecord::RecordRemoved { slot })?;
                data.remove(id.position);
                self.cache_evict(id);
            }
        }
        Ok(true)
    }

    /// Live records of `cluster_id`, ordered by position.
    pub fn scan(&self, cluster_id: ClusterId) -> CoreResult<Vec<Record>> {
        let route = self.route(cluster_id)?;
        let data = route.data.read();
        Ok(data
            .slots
            .iter()
            .filter(|(_, slot)| slot.owner == route.owner)
            .map(|(&position, slot)| {
                Record::new(
                    RecordId::new(route.owner, position),
                    slot.version,
                    slot.record_type,
                    slot.content.clone(),
                )
            })
            .collect())
    }

    /// Sum of live record counts of the given clusters.
    pub fn count_cluster_elements(&self, ids: &[ClusterId]) -> CoreResult<i64> {
        let mut total = 0i64;
        for &id in ids {
            let route = self.route(id)?;
            total += route.data.read().count(route.owner);
        }
        Ok(total)
    }

    /// Live record count of the named cluster.
    pub fn count_by_name(&self, name: &str) -> CoreResult<i64> {
        let id = self
            .cluster_id_by_name(name)
            .ok_or_else(|| CoreError::cluster_name_not_found(name))?;
        self.count_cluster_elements(&[id])
    }

    /// Looks a cluster id up by (case-insensitive) name.
    pub fn cluster_id_by_name(&self, name: &str) -> Option<ClusterId> {
        self.directory
            .read()
            .by_name
            .get(&name.to_lowercase())
            .copied()
    }

    /// Looks a cluster name up by id.
    pub fn cluster_name_by_id(&self, id: ClusterId) -> Option<String> {
        self.directory
            .read()
            .by_id
            .get(&id)
            .map(|entry| entry.info.name.clone())
    }

    /// Descriptor of a cluster.
    pub fn cluster(&self, id: ClusterId) -> Option<ClusterInfo> {
        self.directory
            .read()
            .by_id
            .get(&id)
            .map(|entry| entry.info.clone())
    }

    /// Every cluster, ordered by id.
    pub fn clusters(&self) -> Vec<ClusterInfo> {
        self.directory
            .read()
            .by_id
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Id of the default cluster.
    pub fn default_cluster_id(&self) -> CoreResult<ClusterId> {
        self.cluster_id_by_name(&self.default_cluster)
            .ok_or_else(|| CoreError::cluster_name_not_found(self.default_cluster.clone()))
    }

    /// Adds a physical cluster and returns its id.
    pub fn add_physical_cluster(
        &self,
        name: &str,
        file_name: Option<String>,
        start_size: i32,
    ) -> CoreResult<ClusterId> {
        let name = normalize_name(name)?;
        let mut directory = self.directory.write();
        if directory.by_name.contains_key(&name) {
            return Err(CoreError::ClusterExists { name });
        }

        let id = directory.next_id()?;
        let kind = ClusterKind::Physical {
            file_name,
            start_size,
        };
        self.segments.append(&SegmentRecord::ClusterAdded {
            id,
            name: name.clone(),
            kind: kind.clone(),
        })?;
        directory.insert(ClusterInfo { id, name, kind })?;
        debug!(cluster = id, "physical cluster added");
        Ok(id)
    }

    /// Adds a logical cluster stored inside `container_id` (the default
    /// cluster when negative).
    ///
    /// Returns the new id and the identity of the descriptor record created
    /// in the container.
    pub fn add_logical_cluster(
        &self,
        name: &str,
        container_id: i32,
    ) -> CoreResult<(ClusterId, RecordId)> {
        let name = normalize_name(name)?;
        let container_id = if container_id < 0 {
            self.default_cluster_id()?
        } else {
            ClusterId::try_from(container_id)
                .map_err(|_| CoreError::ClusterNotFound {
                    cluster: container_id.to_string(),
                })?
        };

        let mut directory = self.directory.write();
        if directory.by_name.contains_key(&name) {
            return Err(CoreError::ClusterExists { name });
        }
        let container = directory
            .by_id
            .get(&container_id)
            .ok_or_else(|| CoreError::cluster_id_not_found(container_id))?;
        if container.info.kind.is_logical() {
            return Err(CoreError::invalid_operation(format!(
                "cluster {container_id} is logical and cannot contain another cluster"
            )));
        }
        let data = Arc::clone(&container.data);
        let id = directory.next_id()?;

        // Descriptor record, owned by the container itself.
        let descriptor = {
            let mut data = data.write();
            let position = data.next_position;
            let content = Bytes::from(name.clone().into_bytes());
            self.segments.append(&SegmentRecord::RecordPut {
                slot: RecordId::new(container_id, position),
                owner: container_id,
                version: 0,
                record_type: RecordType::Document,
                content: content.clone(),
            })?;
            data.insert(
                position,
                Slot {
                    owner: container_id,
                    version: 0,
                    record_type: RecordType::Document,
                    content,
                },
            );
            RecordId::new(container_id, position)
        };

        let kind = ClusterKind::Logical {
            container_id,
            descriptor,
        };
        self.segments.append(&SegmentRecord::ClusterAdded {
            id,
            name: name.clone(),
            kind: kind.clone(),
        })?;
        directory.insert(ClusterInfo { id, name, kind })?;
        debug!(cluster = id, container = container_id, "logical cluster added");
        Ok((id, descriptor))
    }

    /// Store statistics.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// The record cache, when enabled.
    pub fn cache(&self) -> Option<&RecordCache> {
        self.cache.as_ref()
    }

    /// Flushes the segment log.
    pub fn flush(&self) -> CoreResult<()> {
        self.segments.flush()
    }

    /// Makes the segment log durable.
    pub fn sync(&self) -> CoreResult<()> {
        self.segments.sync()
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("clusters", &self.directory.read().by_id.len())
            .field("cache", &self.cache.as_ref().map(RecordCache::len))
            .finish_non_exhaustive()
    }
}

fn normalize_name(name: &str) -> CoreResult<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(CoreError::invalid_operation("cluster name is empty"));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_storage::InMemoryBackend;

    fn store_with(config: &Config) -> RecordStore {
        let segments = Arc::new(SegmentManager::new(Box::new(InMemoryBackend::new()), false));
        RecordStore::recover(config, segments, &[]).unwrap()
    }

    fn store() -> RecordStore {
        store_with(&Config::default())
    }

    #[test]
    fn new_store_has_initial_clusters() {
        let store = store();
        let names: Vec<_> = store.clusters().into_iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            ["internal", "index", "default", "users", "roles", "dictionary"]
        );
        assert_eq!(store.default_cluster_id().unwrap(), 2);
        assert_eq!(store.cluster_id_by_name("DEFAULT"), Some(2));
        assert_eq!(store.cluster_name_by_id(5).as_deref(), Some("dictionary"));
    }

    #[test]
    fn create_read_update_delete() {
        let store = store();
        let created = store.create(3, b"hello".to_vec(), RecordType::Document).unwrap();
        assert_eq!(created.id, RecordId::new(3, 0));
        assert_eq!(created.version, 0);

        let read = store.read(created.id).unwrap().unwrap();
        assert_eq!(read.content.as_ref(), b"hello");

        assert_eq!(
            store.update(created.id, b"world".to_vec(), 0, RecordType::Document).unwrap(),
            1
        );
        let read = store.read(created.id).unwrap().unwrap();
        assert_eq!((read.content.as_ref(), read.version), (&b"world"[..], 1));

        store.delete(created.id, 1).unwrap();
        assert!(store.read(created.id).unwrap().is_none());
        assert_eq!(store.stats().deletes(), 1);
    }

    #[test]
    fn positions_are_monotonic_and_never_reused() {
        let store = store();
        let a = store.create(4, b"a".to_vec(), RecordType::Bytes).unwrap();
        let b = store.create(4, b"b".to_vec(), RecordType::Bytes).unwrap();
        store.delete(b.id, 0).unwrap();
        let c = store.create(4, b"c".to_vec(), RecordType::Bytes).unwrap();
        assert_eq!((a.id.position, b.id.position, c.id.position), (0, 1, 2));
    }

    #[test]
    fn stale_version_conflicts_and_leaves_record_unchanged() {
        let store = store();
        let id = store.create(3, b"v0".to_vec(), RecordType::Flat).unwrap().id;
        store.update(id, b"v1".to_vec(), 0, RecordType::Flat).unwrap();

        let err = store.update(id, b"stale".to_vec(), 0, RecordType::Flat).unwrap_err();
        assert!(matches!(
            err,
            CoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
        assert!(matches!(
            store.delete(id, 7),
            Err(CoreError::VersionConflict { .. })
        ));

        let read = store.read(id).unwrap().unwrap();
        assert_eq!((read.content.as_ref(), read.version), (&b"v1"[..], 1));
        assert_eq!(store.stats().version_conflicts(), 2);
    }

    #[test]
    fn missing_records() {
        let store = store();
        let id = RecordId::new(3, 99);
        assert!(store.read(id).unwrap().is_none());
        assert!(matches!(
            store.update(id, b"x".to_vec(), 0, RecordType::Document),
            Err(CoreError::RecordNotFound { .. })
        ));
        assert!(matches!(
            store.delete(id, 0),
            Err(CoreError::RecordNotFound { .. })
        ));
        assert!(matches!(
            store.read(RecordId::new(42, 0)),
            Err(CoreError::ClusterNotFound { .. })
        ));
    }

    #[test]
    fn malformed_identity_skips_storage() {
        let store = store();
        assert!(store.read(RecordId::new(-1, 0)).unwrap().is_none());
        assert!(store.read(RecordId::new(3, -1)).unwrap().is_none());
        assert_eq!(store.stats().store_reads(), 0);
    }

    #[test]
    fn cache_answers_repeated_reads() {
        let store = store();
        let id = store.create(3, b"hot".to_vec(), RecordType::Document).unwrap().id;
        store.cache().unwrap().clear();

        store.read(id).unwrap();
        assert_eq!(store.stats().store_reads(), 1);
        for _ in 0..5 {
            store.read(id).unwrap();
        }
        assert_eq!(store.stats().store_reads(), 1);
        assert_eq!(store.stats().cache_hits(), 5);
    }

    #[test]
    fn cache_follows_writes() {
        let store = store();
        let id = store.create(3, b"a".to_vec(), RecordType::Document).unwrap().id;
        assert_eq!(store.cache().unwrap().get("#3:0").map(|r| r.version), Some(0));

        store.update(id, b"b".to_vec(), 0, RecordType::Document).unwrap();
        assert_eq!(
            store.cache().unwrap().get("#3:0").map(|r| r.content),
            Some(Bytes::from_static(b"b"))
        );

        store.delete(id, 1).unwrap();
        assert!(store.cache().unwrap().get("#3:0").is_none());
    }

    #[test]
    fn results_do_not_depend_on_cache() {
        let cached = store();
        let uncached = store_with(&Config::default().use_cache(false));
        assert!(uncached.cache().is_none());

        for store in [&cached, &uncached] {
            let id = store.create(3, b"one".to_vec(), RecordType::Document).unwrap().id;
            store.update(id, b"two".to_vec(), 0, RecordType::Document).unwrap();
        }
        let id = RecordId::new(3, 0);
        assert_eq!(cached.read(id).unwrap(), uncached.read(id).unwrap());
    }

    #[test]
    fn counts_and_scan() {
        let store = store();
        for i in 0..3u8 {
            store.create(3, vec![i], RecordType::Bytes).unwrap();
        }
        store.create(4, b"x".to_vec(), RecordType::Bytes).unwrap();
        store.delete(RecordId::new(3, 1), 0).unwrap();

        assert_eq!(store.count_cluster_elements(&[3]).unwrap(), 2);
        assert_eq!(store.count_cluster_elements(&[3, 4]).unwrap(), 3);
        assert_eq!(store.count_by_name("users").unwrap(), 2);
        assert!(matches!(
            store.count_cluster_elements(&[3, 77]),
            Err(CoreError::ClusterNotFound { .. })
        ));

        let positions: Vec<_> = store.scan(3).unwrap().iter().map(|r| r.id.position).collect();
        assert_eq!(positions, vec![0, 2]);
    }

    #[test]
    fn physical_cluster_names_are_unique() {
        let store = store();
        let id = store.add_physical_cluster("People", Some("people.pcl".into()), -1).unwrap();
        assert_eq!(id, 6);
        assert_eq!(store.cluster_id_by_name("people"), Some(6));
        assert!(matches!(
            store.add_physical_cluster("PEOPLE", None, -1),
            Err(CoreError::ClusterExists { .. })
        ));
        assert!(store.add_physical_cluster("  ", None, -1).is_err());
    }

    #[test]
    fn logical_cluster_shares_container_storage() {
        let store = store();
        let (staff, descriptor) = store.add_logical_cluster("staff", 3).unwrap();
        assert_eq!(descriptor, RecordId::new(3, 0));
        assert!(store.cluster(staff).unwrap().kind.is_logical());

        let member = store.create(staff, b"alice".to_vec(), RecordType::Document).unwrap();
        assert_eq!(member.id, RecordId::new(staff, 1));
        let own = store.create(3, b"plain".to_vec(), RecordType::Document).unwrap();
        assert_eq!(own.id.position, 2);

        assert_eq!(store.count_cluster_elements(&[staff]).unwrap(), 1);
        assert_eq!(store.count_cluster_elements(&[3]).unwrap(), 2);
        assert_eq!(store.read(member.id).unwrap().unwrap().content.as_ref(), b"alice");
        assert!(store.read(RecordId::new(3, 1)).unwrap().is_none());
    }

    #[test]
    fn logical_cluster_defaults_to_default_cluster() {
        let store = store();
        let (_, descriptor) = store.add_logical_cluster("misc", -1).unwrap();
        assert_eq!(descriptor.cluster_id, store.default_cluster_id().unwrap());

        let (nested, _) = store.add_logical_cluster("outer", 3).unwrap();
        assert!(store.add_logical_cluster("inner", i32::from(nested)).is_err());
        assert!(matches!(
            store.add_logical_cluster("lost", 900),
            Err(CoreError::ClusterNotFound { .. })
        ));
    }

    #[test]
    fn compensation_respects_later_writers() {
        let store = store();
        let id = store.create(3, b"a".to_vec(), RecordType::Document).unwrap().id;
        let (_, previous) = store.replace(id, Bytes::from_static(b"b"), 0, None).unwrap();

        // Someone else moved the record on; the restore must not clobber it.
        store.update(id, b"c".to_vec(), 1, RecordType::Document).unwrap();
        assert!(!store.compensate(id, Some(1), Some(&previous)).unwrap());
        assert_eq!(store.read(id).unwrap().unwrap().version, 2);

        assert!(store.compensate(id, Some(2), Some(&previous)).unwrap());
        let restored = store.read(id).unwrap().unwrap();
        assert_eq!((restored.content.as_ref(), restored.version), (&b"a"[..], 0));
    }

    #[test]
    fn recover_rebuilds_from_log() {
        let backend = InMemoryBackend::new();
        let segments = Arc::new(SegmentManager::new(Box::new(backend), false));
        let store = RecordStore::recover(&Config::default(), Arc::clone(&segments), &[]).unwrap();
        let id = store.create(3, b"a".to_vec(), RecordType::Document).unwrap().id;
        store.update(id, b"b".to_vec(), 0, RecordType::Flat).unwrap();
        let gone = store.create(3, b"gone".to_vec(), RecordType::Document).unwrap().id;
        store.delete(gone, 0).unwrap();
        store.add_logical_cluster("staff", 4).unwrap();

        let log = segments.replay().unwrap();
        let recovered = RecordStore::recover(&Config::default(), segments, &log).unwrap();
        let record = recovered.read(id).unwrap().unwrap();
        assert_eq!(
            (record.content.as_ref(), record.version, record.record_type),
            (&b"b"[..], 1, RecordType::Flat)
        );
        assert!(recovered.read(gone).unwrap().is_none());
        assert_eq!(recovered.cluster_id_by_name("staff"), Some(6));
        assert_eq!(recovered.clusters().len(), 7);

        let next = recovered.create(3, b"n".to_vec(), RecordType::Document).unwrap();
        assert_eq!(next.id.position, 2);
    }

    #[test]
    fn same_identity_races_have_one_winner() {
        use std::thread;

        let store = Arc::new(store());
        let id = store.create(3, b"base".to_vec(), RecordType::Document).unwrap().id;

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.update(id, vec![i], 0, RecordType::Document).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(store.read(id).unwrap().unwrap().version, 1);
        assert_eq!(store.stats().version_conflicts(), 7);
    }

    proptest::proptest! {
        #[test]
        fn versions_advance_only_on_exact_match(guesses in proptest::collection::vec(0i32..6, 1..24)) {
            let store = store();
            let id = store.create(3, b"v".to_vec(), RecordType::Document).unwrap().id;
            let mut current = 0;
            for guess in guesses {
                match store.update(id, vec![0], guess, RecordType::Document) {
                    Ok(version) => {
                        proptest::prop_assert_eq!(guess, current);
                        proptest::prop_assert_eq!(version, current + 1);
                        current = version;
                    }
                    Err(err) => proptest::prop_assert!(err.is_version_conflict() && guess != current),
                }
            }
            proptest::prop_assert_eq!(store.read(id).unwrap().unwrap().version, current);
        }
    }
}
