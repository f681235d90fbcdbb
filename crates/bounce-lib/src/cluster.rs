//! Cluster access for the restart pipeline
//!
//! The pipeline only ever talks to the control plane through the
//! [`ClusterClient`] trait. [`KubeCluster`] is the production implementation
//! backed by `kube::Client`; tests substitute fakes or mocks.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, PostParams};
use kube::config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config, ResourceExt};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned by cluster operations
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("failed to infer cluster configuration: {0}")]
    InferConfig(#[from] InferConfigError),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }

    /// Classify a kube error returned while operating on `kind namespace/name`
    fn from_api(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(resp.message),
            other => ClusterError::Kube(other),
        }
    }
}

/// Set of namespaces a pod listing covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    AllNamespaces,
    Namespace(String),
}

impl Scope {
    /// Build a scope from the namespace flag; empty means every namespace
    pub fn from_flag(namespace: &str) -> Self {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            Scope::AllNamespaces
        } else {
            Scope::Namespace(namespace.to_string())
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::AllNamespaces => f.write_str("all namespaces"),
            Scope::Namespace(ns) => write!(f, "namespace {}", ns),
        }
    }
}

/// Controller kinds this tool knows how to restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    Deployment,
    StatefulSet,
}

impl ControllerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerKind::Deployment => "Deployment",
            ControllerKind::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind recorded on an owner reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerKind {
    Controller(ControllerKind),
    /// Intermediate owner; only followed when multi-hop resolution is enabled
    ReplicaSet,
    Other(String),
}

impl OwnerKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "Deployment" => OwnerKind::Controller(ControllerKind::Deployment),
            "StatefulSet" => OwnerKind::Controller(ControllerKind::StatefulSet),
            "ReplicaSet" => OwnerKind::ReplicaSet,
            other => OwnerKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: OwnerKind,
    pub name: String,
}

impl OwnerRef {
    pub fn new(kind: &str, name: impl Into<String>) -> Self {
        Self {
            kind: OwnerKind::parse(kind),
            name: name.into(),
        }
    }
}

impl From<&OwnerReference> for OwnerRef {
    fn from(owner: &OwnerReference) -> Self {
        OwnerRef::new(&owner.kind, owner.name.clone())
    }
}

/// The parts of a pod the matcher looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub owners: Vec<OwnerRef>,
}

impl From<&Pod> for PodRecord {
    fn from(pod: &Pod) -> Self {
        Self {
            name: pod.name_any(),
            namespace: pod.namespace().unwrap_or_default(),
            owners: owner_refs(pod.owner_references()),
        }
    }
}

fn owner_refs(owners: &[OwnerReference]) -> Vec<OwnerRef> {
    owners.iter().map(OwnerRef::from).collect()
}

/// A controller selected for restart
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerTarget {
    pub kind: ControllerKind,
    pub namespace: String,
    pub name: String,
}

impl ControllerTarget {
    pub fn new(kind: ControllerKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ControllerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Access to the pod template of a workload controller
pub trait PodTemplateOwner {
    fn pod_template(&self) -> Option<&PodTemplateSpec>;
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;
}

impl PodTemplateOwner for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl PodTemplateOwner for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

/// A fetched controller, tagged by kind
#[derive(Debug, Clone, PartialEq)]
pub enum Controller {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
}

impl Controller {
    fn template_owner(&self) -> &dyn PodTemplateOwner {
        match self {
            Controller::Deployment(d) => d,
            Controller::StatefulSet(s) => s,
        }
    }

    fn template_owner_mut(&mut self) -> &mut dyn PodTemplateOwner {
        match self {
            Controller::Deployment(d) => d,
            Controller::StatefulSet(s) => s,
        }
    }

    pub fn template_annotation(&self, key: &str) -> Option<&str> {
        self.template_owner()
            .pod_template()?
            .metadata
            .as_ref()?
            .annotations
            .as_ref()?
            .get(key)
            .map(String::as_str)
    }

    /// Pod template annotations, created empty if absent.
    ///
    /// Returns `None` when the controller carries no spec at all.
    pub fn template_annotations_mut(&mut self) -> Option<&mut BTreeMap<String, String>> {
        let template = self.template_owner_mut().pod_template_mut()?;
        Some(
            template
                .metadata
                .get_or_insert_with(Default::default)
                .annotations
                .get_or_insert_with(BTreeMap::new),
        )
    }

    pub fn resource_version(&self) -> Option<&str> {
        match self {
            Controller::Deployment(d) => d.metadata.resource_version.as_deref(),
            Controller::StatefulSet(s) => s.metadata.resource_version.as_deref(),
        }
    }

    fn clear_resource_version(&mut self) {
        match self {
            Controller::Deployment(d) => d.metadata.resource_version = None,
            Controller::StatefulSet(s) => s.metadata.resource_version = None,
        }
    }
}

/// How an update guards against concurrent writers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Last writer wins
    None,
    /// Reject the write if the controller changed since it was fetched
    ResourceVersion,
}

/// Control-plane operations the restart pipeline needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List pods in the given scope
    async fn list_pods(&self, scope: &Scope) -> Result<Vec<PodRecord>, ClusterError>;

    /// Fetch the full controller object for a target
    async fn get_controller(&self, target: &ControllerTarget) -> Result<Controller, ClusterError>;

    /// Write a full controller object back
    async fn update_controller(
        &self,
        target: &ControllerTarget,
        controller: &Controller,
        precondition: WritePrecondition,
    ) -> Result<(), ClusterError>;

    /// Owner references of a ReplicaSet
    async fn replica_set_owners(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<OwnerRef>, ClusterError>;
}

/// Production cluster client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig file, or ambient configuration
    /// (KUBECONFIG, ~/.kube/config, in-cluster) when no path is given.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, ClusterError> {
        let mut config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => Config::infer().await?,
        };

        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        let client = Client::try_from(config)?;
        tracing::debug!(default_namespace = %client.default_namespace(), "Cluster client ready");

        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_pods(&self, scope: &Scope) -> Result<Vec<PodRecord>, ClusterError> {
        let api: Api<Pod> = match scope {
            Scope::AllNamespaces => Api::all(self.client.clone()),
            Scope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
        };

        let pods = api.list(&ListParams::default()).await?;
        Ok(pods.items.iter().map(PodRecord::from).collect())
    }

    async fn get_controller(&self, target: &ControllerTarget) -> Result<Controller, ClusterError> {
        let map_err = |e| ClusterError::from_api(e, target.kind.as_str(), &target.namespace, &target.name);

        match target.kind {
            ControllerKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                let deployment = api.get(&target.name).await.map_err(map_err)?;
                Ok(Controller::Deployment(deployment))
            }
            ControllerKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                let stateful_set = api.get(&target.name).await.map_err(map_err)?;
                Ok(Controller::StatefulSet(stateful_set))
            }
        }
    }

    async fn update_controller(
        &self,
        target: &ControllerTarget,
        controller: &Controller,
        precondition: WritePrecondition,
    ) -> Result<(), ClusterError> {
        let map_err = |e| ClusterError::from_api(e, target.kind.as_str(), &target.namespace, &target.name);

        // A PUT without resourceVersion is accepted unconditionally.
        let mut body = controller.clone();
        if precondition == WritePrecondition::None {
            body.clear_resource_version();
        }

        let pp = PostParams::default();
        match body {
            Controller::Deployment(deployment) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                api.replace(&target.name, &pp, &deployment).await.map_err(map_err)?;
            }
            Controller::StatefulSet(stateful_set) => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                api.replace(&target.name, &pp, &stateful_set).await.map_err(map_err)?;
            }
        }

        Ok(())
    }

    async fn replica_set_owners(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<OwnerRef>, ClusterError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let replica_set = api
            .get(name)
            .await
            .map_err(|e| ClusterError::from_api(e, "ReplicaSet", namespace, name))?;

        Ok(owner_refs(replica_set.owner_references()))
    }
}


/// `KubeCluster` against a canned API server
#[cfg(test)]
mod api_tests {
    use super::*;
    use crate::observability::BatchLogger;
    use crate::restart::{restart_controller, RestartError, RestartOptions, WriteMode, RESTARTED_AT_ANNOTATION};
    use http::{Request, Response, StatusCode};
    use hyper::Body;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    const WEB_PATH: &str = "/apis/apps/v1/namespaces/prod/deployments/web";

    /// Method, path and JSON body of every request the server saw
    type Requests = Arc<Mutex<Vec<(String, String, Option<Value>)>>>;

    fn web_deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "resourceVersion": "42",
                "labels": {"app": "web"}
            },
            "spec": {
                "replicas": 2,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {
                        "labels": {"app": "web"},
                        "annotations": {"team": "storage"}
                    },
                    "spec": {
                        "containers": [{"name": "web", "image": "nginx:1.25"}]
                    }
                }
            }
        })
    }

    fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn not_found_status(path: &str) -> Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{} not found", path),
            "reason": "NotFound",
            "code": 404
        })
    }

    /// Serves the `web` Deployment and echoes PUTs to it; everything else is 404
    fn cluster(requests: Requests) -> KubeCluster {
        let service = tower::service_fn(move |req: Request<Body>| {
            let requests = requests.clone();
            async move {
                let method = req.method().to_string();
                let path = req.uri().path().to_string();
                let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                let body: Option<Value> = serde_json::from_slice(&bytes).ok();
                requests
                    .lock()
                    .unwrap()
                    .push((method.clone(), path.clone(), body.clone()));

                let response = match (method.as_str(), path.as_str()) {
                    ("GET", WEB_PATH) => json_response(StatusCode::OK, &web_deployment()),
                    ("PUT", WEB_PATH) => json_response(StatusCode::OK, &body.unwrap_or_default()),
                    _ => json_response(StatusCode::NOT_FOUND, &not_found_status(&path)),
                };
                Ok::<_, Infallible>(response)
            }
        });

        KubeCluster::new(Client::new(service, "default"))
    }

    fn web() -> ControllerTarget {
        ControllerTarget::new(ControllerKind::Deployment, "prod", "web")
    }

    fn put_body(requests: &Requests) -> Value {
        requests
            .lock()
            .unwrap()
            .iter()
            .find(|(method, _, _)| method == "PUT")
            .and_then(|(_, _, body)| body.clone())
            .expect("a PUT with a JSON body")
    }

    #[tokio::test]
    async fn test_unconditional_put_drops_resource_version() {
        let requests = Requests::default();
        let cluster = cluster(requests.clone());

        let marker = restart_controller(&cluster, &web(), &RestartOptions::default(), &BatchLogger::default())
            .await
            .unwrap();

        let seen: Vec<_> = requests
            .lock()
            .unwrap()
            .iter()
            .map(|(method, path, _)| (method.clone(), path.clone()))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("GET".to_string(), WEB_PATH.to_string()),
                ("PUT".to_string(), WEB_PATH.to_string()),
            ]
        );

        let mut body = put_body(&requests);
        assert!(body.pointer("/metadata/resourceVersion").is_none());

        let annotations = body
            .pointer_mut("/spec/template/metadata/annotations")
            .and_then(|a| a.as_object_mut())
            .unwrap();
        assert_eq!(annotations.remove(RESTARTED_AT_ANNOTATION), Some(Value::String(marker)));

        let mut expected = web_deployment();
        expected["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("resourceVersion");
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn test_optimistic_put_keeps_resource_version() {
        let requests = Requests::default();
        let cluster = cluster(requests.clone());
        let options = RestartOptions {
            write_mode: WriteMode::Optimistic,
            ..Default::default()
        };

        restart_controller(&cluster, &web(), &options, &BatchLogger::default())
            .await
            .unwrap();

        let body = put_body(&requests);
        assert_eq!(body.pointer("/metadata/resourceVersion"), Some(&json!("42")));
    }

    #[tokio::test]
    async fn test_missing_controller_maps_to_not_found() {
        let requests = Requests::default();
        let cluster = cluster(requests.clone());
        let ghost = ControllerTarget::new(ControllerKind::StatefulSet, "prod", "ghost");

        let err = restart_controller(&cluster, &ghost, &RestartOptions::default(), &BatchLogger::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RestartError::NotFound(_)), "got {:?}", err);
        assert_eq!(err.to_string(), "StatefulSet prod/ghost not found");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1, "no write after a failed fetch");
        assert_eq!(requests[0].1, "/apis/apps/v1/namespaces/prod/statefulsets/ghost");
    }
}
