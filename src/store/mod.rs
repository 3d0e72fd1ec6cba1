//! Typed access to the Kubernetes API for the kinds the operator reads and writes
//!
//! Reconcilers only ever see [`ResourceStore`]; production wires in
//! [`KubeStore`], tests an in-memory store with fault injection.

#[cfg(test)]
pub mod memory;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::crd::{CiliumEgressGatewayPolicy, GameServer};
use crate::error::{Error, Result};

/// A resource kind the store can address
pub trait StoreKind:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Whether objects of this kind live in a namespace
    const NAMESPACED: bool;

    /// Build an API handle. Cluster scoped kinds ignore the namespace.
    fn api(client: &Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_kind {
    ($kind:ty) => {
        impl StoreKind for $kind {
            const NAMESPACED: bool = true;

            fn api(client: &Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client.clone(), ns),
                    None => Api::all(client.clone()),
                }
            }
        }
    };
}

macro_rules! cluster_kind {
    ($kind:ty) => {
        impl StoreKind for $kind {
            const NAMESPACED: bool = false;

            fn api(client: &Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client.clone())
            }
        }
    };
}

namespaced_kind!(GameServer);
namespaced_kind!(Service);
cluster_kind!(CiliumEgressGatewayPolicy);
cluster_kind!(Node);

/// One term of a label selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
        }
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: &str, value: &str) -> Self {
        self.requirements
            .push(Requirement::Equals(key.to_string(), value.to_string()));
        self
    }

    pub fn not_equals(mut self, key: &str, value: &str) -> Self {
        self.requirements
            .push(Requirement::NotEquals(key.to_string(), value.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    fn list_params(&self) -> ListParams {
        if self.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&self.to_string())
        }
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join(","))
    }
}

/// CRUD over the cluster's resources.
///
/// `update` is a compare-and-swap on the object's `resourceVersion`;
/// `delete` is idempotent and optionally guarded by a uid precondition.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Fetch by name. A missing object is `Ok(None)`.
    async fn get<K: StoreKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    async fn list<K: StoreKind>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>>;

    async fn create<K: StoreKind>(&self, obj: &K) -> Result<K>;

    async fn update<K: StoreKind>(&self, obj: &K) -> Result<K>;

    async fn delete<K: StoreKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        uid: Option<&str>,
    ) -> Result<()>;
}

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn object_name<K: StoreKind>(obj: &K) -> Result<String> {
    obj.meta().name.clone().ok_or_else(|| {
        error!(critical = true, kind = %K::kind(&()), "Refusing to write an object without a name");
        Error::InvariantViolation(format!("{} object without a name", K::kind(&())))
    })
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: StoreKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let api = K::api(&self.client, namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn list<K: StoreKind>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>> {
        let api = K::api(&self.client, namespace);
        let list = api.list(&selector.list_params()).await?;
        Ok(list.items)
    }

    async fn create<K: StoreKind>(&self, obj: &K) -> Result<K> {
        let api = K::api(&self.client, obj.meta().namespace.as_deref());
        let created = api.create(&PostParams::default(), obj).await?;
        debug!("Created {} {}", K::kind(&()), created.name_any());
        Ok(created)
    }

    async fn update<K: StoreKind>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(&self.client, obj.meta().namespace.as_deref());
        let updated = api.replace(&name, &PostParams::default(), obj).await?;
        debug!(
            "Replaced {} {} at resourceVersion {:?}",
            K::kind(&()),
            name,
            updated.meta().resource_version
        );
        Ok(updated)
    }

    async fn delete<K: StoreKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        uid: Option<&str>,
    ) -> Result<()> {
        let api = K::api(&self.client, namespace);
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => {
                debug!("Deleted {} {}", K::kind(&()), name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nameless_object_is_an_invariant_violation() {
        let nameless = Service::default();
        assert!(matches!(object_name(&nameless), Err(Error::InvariantViolation(_))));

        let mut named = Service::default();
        named.metadata.name = Some("agones-generated-arena".to_string());
        assert_eq!(object_name(&named).unwrap(), "agones-generated-arena");
    }

    #[test]
    fn selector_renders_kubernetes_syntax() {
        let selector = LabelSelector::new()
            .equals("a/b", "true")
            .not_equals("c", "x");
        assert_eq!(selector.to_string(), "a/b=true,c!=x");
        assert_eq!(LabelSelector::new().to_string(), "");
    }

    #[test]
    fn selector_matching() {
        let labels = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert!(LabelSelector::new().matches(&labels));
        assert!(LabelSelector::new().equals("a", "1").equals("b", "2").matches(&labels));
        assert!(!LabelSelector::new().equals("a", "2").matches(&labels));
        assert!(!LabelSelector::new().not_equals("b", "2").matches(&labels));
        assert!(LabelSelector::new().not_equals("z", "2").matches(&labels));
    }
}
