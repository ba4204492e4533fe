//! Test harness utilities shared by unit and integration tests: an in-memory
//! cluster with API-server-like write semantics, fixtures, and a recording event sink.
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use crate::api::{CompositeApp, CompositeAppSpec, VersionEntry};
use crate::events::{EventKind, EventSink};
use crate::store::{StatusStore, Store, StoreError};

/// Timestamp the memory cluster stamps on objects whose deletion is blocked by finalizers.
pub const DELETION_TIMESTAMP: &str = "2026-01-01T00:00:00Z";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the call the way `KubeStore` reports this HTTP code.
    Status(u16),
    Panic,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    calls: Vec<Call>,
    faults: Vec<(Verb, String, Fault)>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Remove an object and everything it controls.
    fn remove(&mut self, key: &Key) {
        let Some(value) = self.objects.remove(key) else { return };
        let Some(uid) = value["metadata"]["uid"].as_str().map(str::to_string) else { return };
        let owned: Vec<Key> = self
            .objects
            .iter()
            .filter(|(_, v)| {
                v["metadata"]["ownerReferences"].as_array().is_some_and(|refs| refs.iter().any(|r| r["uid"].as_str() == Some(uid.as_str())))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in owned { self.remove(&k); }
    }
}

/// In-memory object store. Writes bump `resourceVersion`, stale writes conflict, main-resource
/// replaces keep the stored status, deletes honour finalizers and cascade to owned objects.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String { K::kind(&()).into_owned() }

fn key_of<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Key { (kind_of::<K>(), namespace.to_string(), name.to_string()) }

fn obj_key<K: Resource<DynamicType = ()>>(obj: &K) -> Key {
    key_of::<K>(&obj.namespace().unwrap_or_else(|| "default".into()), &obj.name_any())
}

fn api_error(code: u16, message: impl Into<String>) -> StoreError { StoreError::Api { code, message: message.into() } }

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Insert or overwrite an object without recording a call; returns it as stored.
    pub fn seed<K>(&self, obj: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let mut state = self.lock();
        let mut value = serde_json::to_value(obj).expect("serialize seed");
        let version = state.next_version();
        value["metadata"]["resourceVersion"] = json!(version);
        if value["metadata"]["uid"].is_null() { value["metadata"]["uid"] = json!(format!("uid-{version}")); }
        state.objects.insert(obj_key(obj), value.clone());
        serde_json::from_value(value).expect("deserialize seed")
    }

    /// Read an object without recording a call.
    pub fn object<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let value = self.lock().objects.get(&key_of::<K>(namespace, name)).cloned()?;
        Some(serde_json::from_value(value).expect("deserialize stored object"))
    }

    pub fn count<K: Resource<DynamicType = ()>>(&self) -> usize {
        let kind = kind_of::<K>();
        self.lock().objects.keys().filter(|(k, _, _)| *k == kind).count()
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    /// Every call except reads.
    pub fn writes(&self) -> Vec<Call> { self.calls().into_iter().filter(|c| c.verb != Verb::Get).collect() }

    pub fn calls_of(&self, verb: Verb, kind: &str) -> usize { self.calls().iter().filter(|c| c.verb == verb && c.kind == kind).count() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    /// Make every later `verb` on `kind` fail.
    pub fn inject(&self, verb: Verb, kind: &str, fault: Fault) { self.lock().faults.push((verb, kind.to_string(), fault)); }

    pub fn clear_faults(&self) { self.lock().faults.clear(); }

    /// Record the call and apply any injected fault. Panics happen outside the lock.
    fn enter(&self, verb: Verb, kind: &str, name: &str) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self.lock();
        state.calls.push(Call { verb, kind: kind.to_string(), name: name.to_string() });
        let fault = state.faults.iter().find(|(v, k, _)| *v == verb && k == kind).map(|(_, _, f)| *f);
        match fault {
            None => Ok(state),
            Some(Fault::Status(409)) => Err(StoreError::Conflict(format!("injected {verb:?} conflict on {kind}"))),
            Some(Fault::Status(404)) => Err(StoreError::NotFound),
            Some(Fault::Status(code)) => Err(api_error(code, format!("injected {verb:?} failure on {kind}"))),
            Some(Fault::Panic) => {
                drop(state);
                panic!("injected {verb:?} panic on {kind}");
            }
        }
    }
}

fn check_version(stored: &Value, incoming: &Value) -> Result<(), StoreError> {
    let theirs = incoming["metadata"]["resourceVersion"].as_str();
    let ours = stored["metadata"]["resourceVersion"].as_str();
    match theirs {
        Some(v) if Some(v) != ours => Err(StoreError::Conflict(format!("resourceVersion {v} is stale (current {})", ours.unwrap_or("")))),
        _ => Ok(()),
    }
}

#[async_trait]
impl<K> Store<K> for MemoryCluster
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let state = self.enter(Verb::Get, &kind_of::<K>(), name)?;
        let Some(value) = state.objects.get(&key_of::<K>(namespace, name)).cloned() else { return Ok(None) };
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let mut state = self.enter(Verb::Create, &kind_of::<K>(), &obj.name_any())?;
        let key = obj_key(obj);
        if state.objects.contains_key(&key) { return Err(api_error(409, format!("{} {} already exists", key.0, key.2))); }
        let mut value = serde_json::to_value(obj)?;
        let version = state.next_version();
        value["metadata"]["resourceVersion"] = json!(version);
        value["metadata"]["uid"] = json!(format!("uid-{version}"));
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        let mut state = self.enter(Verb::Replace, &kind_of::<K>(), &obj.name_any())?;
        let key = obj_key(obj);
        let Some(stored) = state.objects.get(&key).cloned() else { return Err(StoreError::NotFound) };
        let mut value = serde_json::to_value(obj)?;
        check_version(&stored, &value)?;
        for field in ["uid", "deletionTimestamp", "creationTimestamp"] {
            value["metadata"][field] = stored["metadata"][field].clone();
        }
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() { map.remove("status"); }
            }
        }
        value["metadata"]["resourceVersion"] = json!(state.next_version());
        let released = !value["metadata"]["deletionTimestamp"].is_null()
            && value["metadata"]["finalizers"].as_array().map_or(true, |f| f.is_empty());
        state.objects.insert(key.clone(), value.clone());
        if released { state.remove(&key); }
        Ok(serde_json::from_value(value)?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.enter(Verb::Delete, &kind_of::<K>(), name)?;
        let key = key_of::<K>(namespace, name);
        let Some(stored) = state.objects.get(&key) else { return Ok(()) };
        if stored["metadata"]["finalizers"].as_array().is_some_and(|f| !f.is_empty()) {
            let version = state.next_version();
            if let Some(value) = state.objects.get_mut(&key) {
                value["metadata"]["deletionTimestamp"] = json!(DELETION_TIMESTAMP);
                value["metadata"]["resourceVersion"] = json!(version);
            }
        } else {
            state.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl<K> StatusStore<K> for MemoryCluster
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let mut state = self.enter(Verb::ReplaceStatus, &kind_of::<K>(), &obj.name_any())?;
        let key = obj_key(obj);
        let Some(mut stored) = state.objects.get(&key).cloned() else { return Err(StoreError::NotFound) };
        let incoming = serde_json::to_value(obj)?;
        check_version(&stored, &incoming)?;
        stored["status"] = incoming["status"].clone();
        stored["metadata"]["resourceVersion"] = json!(state.next_version());
        state.objects.insert(key, stored.clone());
        Ok(serde_json::from_value(stored)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<RecordedEvent> { self.events.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    pub fn reasons(&self) -> Vec<String> { self.events().into_iter().map(|e| e.reason).collect() }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, _app: &CompositeApp, kind: EventKind, reason: &str, note: String) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(RecordedEvent { kind, reason: reason.into(), note });
    }
}

/// An app in namespace `default` with a uid, ready to be seeded.
pub fn app(name: &str, apps: Vec<VersionEntry>) -> CompositeApp {
    let mut app = CompositeApp::new(name, CompositeAppSpec { apps, ..Default::default() });
    app.metadata.namespace = Some("default".into());
    app.metadata.uid = Some(format!("{name}-uid"));
    app.metadata.generation = Some(1);
    app
}

/// A version serving HTTP on 8080.
pub fn version(version: &str, image: &str, min: i32, max: i32) -> VersionEntry {
    VersionEntry { version: version.into(), image: image.into(), min_replicas: min, max_replicas: max, port: 8080, ..Default::default() }
}
