//! In-memory [`ResourceStore`] for controller tests
//!
//! Emulates the API server semantics the reconcilers rely on: resource
//! version compare-and-swap, uid preconditions, finalizers blocking deletion,
//! label selectors. Faults can be injected into writes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use serde_json::Value;

use super::{LabelSelector, ResourceStore, StoreKind};
use crate::error::{Error, Result};

/// Failure the store returns instead of performing a write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Gone,
    LeaderChanged,
    Forbidden,
}

impl Fault {
    fn into_error(self) -> Error {
        let (code, message, reason) = match self {
            Fault::Conflict => (409, "the object has been modified", "Conflict"),
            Fault::Gone => (410, "too old resource version", "Gone"),
            Fault::LeaderChanged => (500, "etcdserver: leader changed", "InternalError"),
            Fault::Forbidden => (403, "forbidden", "Forbidden"),
        };
        api_error(code, message, reason)
    }
}

fn api_error(code: u16, message: &str, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    writes: usize,
    queued_faults: VecDeque<Fault>,
    sticky_fault: Option<Fault>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn write_fault(&mut self) -> Option<Error> {
        self.queued_faults
            .pop_front()
            .or(self.sticky_fault)
            .map(Fault::into_error)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key<K: StoreKind>(namespace: Option<&str>, name: &str) -> Key {
    let namespace = if K::NAMESPACED {
        namespace.unwrap_or_default()
    } else {
        ""
    };
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn key_of<K: StoreKind>(obj: &K) -> Key {
    key::<K>(obj.meta().namespace.as_deref(), &obj.name_any())
}

fn decode<K: StoreKind>(value: &Value) -> K {
    serde_json::from_value(value.clone()).expect("stored object decodes")
}

fn finalizers(value: &Value) -> usize {
    value["metadata"]["finalizers"]
        .as_array()
        .map(Vec::len)
        .unwrap_or(0)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a write. Fills in uid and resourceVersion.
    pub fn insert<K: StoreKind>(&self, obj: K) -> K {
        let mut state = self.state.lock().unwrap();
        let mut obj = obj;
        let version = state.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version);
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", state.version));
        }
        let key = key_of(&obj);
        state
            .objects
            .insert(key, serde_json::to_value(&obj).unwrap());
        obj
    }

    /// Read an object directly, bypassing fault injection
    pub fn peek<K: StoreKind>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state.objects.get(&key::<K>(namespace, name)).map(decode)
    }

    pub fn all<K: StoreKind>(&self) -> Vec<K> {
        let state = self.state.lock().unwrap();
        let kind = K::kind(&()).to_string();
        state
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Successful writes so far
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Fail the next write with `fault`
    pub fn fail_next_write(&self, fault: Fault) {
        self.state.lock().unwrap().queued_faults.push_back(fault);
    }

    /// Fail every write with `fault` until cleared
    pub fn fail_all_writes(&self, fault: Option<Fault>) {
        self.state.lock().unwrap().sticky_fault = fault;
    }

    /// Mark an object as being deleted, as the API server does when finalizers are present
    pub fn mark_deleting<K: StoreKind>(&self, namespace: Option<&str>, name: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let obj = state
            .objects
            .get_mut(&key::<K>(namespace, name))
            .expect("object exists");
        obj["metadata"]["deletionTimestamp"] = Value::from("2026-01-01T00:00:00Z");
        obj["metadata"]["resourceVersion"] = Value::from(version);
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get<K: StoreKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        Ok(self.peek(namespace, name))
    }

    async fn list<K: StoreKind>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>> {
        Ok(self
            .all::<K>()
            .into_iter()
            .filter(|obj| !K::NAMESPACED || namespace.is_none() || obj.namespace().as_deref() == namespace)
            .filter(|obj| selector.matches(obj.labels()))
            .collect())
    }

    async fn create<K: StoreKind>(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.write_fault() {
            return Err(err);
        }
        let key = key_of(obj);
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "already exists", "AlreadyExists"));
        }
        let mut created = obj.clone();
        let version = state.next_version();
        let meta = created.meta_mut();
        meta.resource_version = Some(version);
        meta.uid = Some(format!("uid-{}", state.version));
        state.objects.insert(key, serde_json::to_value(&created)?);
        state.writes += 1;
        Ok(created)
    }

    async fn update<K: StoreKind>(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.write_fault() {
            return Err(err);
        }
        let key = key_of(obj);
        let (current_version, deletion_timestamp) = match state.objects.get(&key) {
            Some(current) => (
                current["metadata"]["resourceVersion"].as_str().map(String::from),
                current["metadata"]["deletionTimestamp"].clone(),
            ),
            None => return Err(api_error(404, "not found", "NotFound")),
        };
        if obj.meta().resource_version.is_some() && obj.meta().resource_version != current_version {
            return Err(Fault::Conflict.into_error());
        }
        let deleting = !deletion_timestamp.is_null();

        let mut updated = obj.clone();
        let version = state.next_version();
        updated.meta_mut().resource_version = Some(version);
        let mut value = serde_json::to_value(&updated)?;
        if deleting {
            value["metadata"]["deletionTimestamp"] = deletion_timestamp;
        }
        state.writes += 1;
        if deleting && finalizers(&value) == 0 {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, value);
        }
        Ok(updated)
    }

    async fn delete<K: StoreKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        uid: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.write_fault() {
            return Err(err);
        }
        let key = key::<K>(namespace, name);
        let Some(current) = state.objects.get(&key) else {
            return Ok(());
        };
        if let Some(uid) = uid {
            if current["metadata"]["uid"].as_str() != Some(uid) {
                return Err(api_error(409, "Precondition failed: UID mismatch", "Conflict"));
            }
        }
        let blocked = finalizers(current) > 0;
        state.writes += 1;
        if blocked {
            let version = state.next_version();
            if let Some(obj) = state.objects.get_mut(&key) {
                obj["metadata"]["deletionTimestamp"] = Value::from("2026-01-01T00:00:00Z");
                obj["metadata"]["resourceVersion"] = Value::from(version);
            }
        } else {
            state.objects.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GameServer, GameServerSpec};

    fn game_server(name: &str) -> GameServer {
        let mut gs = GameServer::new(name, GameServerSpec::default());
        gs.metadata.namespace = Some("games".to_string());
        gs
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryStore::new();
        let gs = store.insert(game_server("a"));
        let fresh = store.update(&gs).await.unwrap();

        let err = store.update(&gs).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.update(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn delete_with_finalizer_only_marks() {
        let store = MemoryStore::new();
        let mut gs = game_server("a");
        gs.metadata.finalizers = Some(vec!["f".to_string()]);
        store.insert(gs);

        store.delete::<GameServer>(Some("games"), "a", None).await.unwrap();
        let mut marked: GameServer = store.peek(Some("games"), "a").unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers = Some(vec![]);
        store.update(&marked).await.unwrap();
        assert!(store.peek::<GameServer>(Some("games"), "a").is_none());
    }

    #[tokio::test]
    async fn uid_precondition_guards_delete() {
        let store = MemoryStore::new();
        store.insert(game_server("a"));
        let err = store
            .delete::<GameServer>(Some("games"), "a", Some("other"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.peek::<GameServer>(Some("games"), "a").is_some());

        store.delete::<GameServer>(Some("games"), "missing", None).await.unwrap();
    }

    #[tokio::test]
    async fn queued_faults_fire_once() {
        let store = MemoryStore::new();
        store.fail_next_write(Fault::LeaderChanged);
        assert!(store.create(&game_server("a")).await.unwrap_err().is_transient());
        assert!(store.create(&game_server("a")).await.is_ok());
        assert_eq!(store.writes(), 1);
    }
}
