//! carctl kubehub: the `Car` custom resource and kube-backed implementations
//! of the store and recorder capabilities.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use carctl_core::{
    CarObject, EventRecorder, EventType, GroupVersionKind, ObjectKey, ObjectStore, RecordError, Scheme, StoreError,
    StoreEvent, WatchStream, CONTROLLER_NAME, KIND,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config, CustomResource,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Wire shape of the `Car` spec.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(group = "samplecrd.k8s.io", version = "v1", kind = "Car", namespaced, schema = "disabled")]
pub struct CarSpec {
    #[serde(default)]
    pub status: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Build a client from an explicit kubeconfig path, or infer one (in-cluster or
/// default kubeconfig). `master` overrides the cluster URL.
pub async fn kube_client(kubeconfig: Option<&Path>, master: Option<&str>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    if let Some(url) = master {
        config.cluster_url = url.parse().with_context(|| format!("parsing master url {}", url))?;
    }
    info!(cluster = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

fn snapshot(car: &Car) -> Result<CarObject, StoreError> {
    let name = car
        .metadata
        .name
        .clone()
        .ok_or_else(|| StoreError::Transport("object missing metadata.name".to_string()))?;
    Ok(CarObject {
        key: ObjectKey { namespace: car.metadata.namespace.clone(), name },
        uid: car.metadata.uid.clone(),
        resource_version: car.metadata.resource_version.clone().unwrap_or_default(),
        spec: carctl_core::CarSpec { status: car.spec.status.clone(), extra: car.spec.extra.clone() },
    })
}

fn desired(namespace: &str, obj: &CarObject) -> Car {
    let mut car = Car::new(
        obj.name(),
        CarSpec { status: obj.spec.status.clone(), extra: obj.spec.extra.clone() },
    );
    car.metadata.namespace = Some(namespace.to_string());
    car
}

fn store_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message),
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message),
        other => StoreError::Transport(other.to_string()),
    }
}

/// Object store backed by the Kubernetes API (`samplecrd.k8s.io/v1` Cars).
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: Option<String>,
}

impl KubeStore {
    /// Watch `namespace`, or all namespaces when `None`.
    pub fn new(client: Client, namespace: Option<String>) -> Self { Self { client, namespace } }

    fn api(&self) -> Api<Car> {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn list(&self) -> Result<Vec<CarObject>, StoreError> {
        let t0 = Instant::now();
        let list = self.api().list(&ListParams::default()).await.map_err(store_error)?;
        histogram!("store_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(count = list.items.len(), "listed cars");
        list.items.iter().map(snapshot).collect()
    }

    fn watch(&self) -> WatchStream {
        watcher::watcher(self.api(), watcher::Config::default())
            .default_backoff()
            .map(|res| match res {
                Ok(Event::Applied(car)) => snapshot(&car).map(StoreEvent::Applied),
                Ok(Event::Deleted(car)) => snapshot(&car).map(StoreEvent::Deleted),
                Ok(Event::Restarted(cars)) => {
                    cars.iter().map(snapshot).collect::<Result<Vec<_>, _>>().map(StoreEvent::Restarted)
                }
                Err(e) => Err(StoreError::Transport(e.to_string())),
            })
            .boxed()
    }

    async fn create_or_update(&self, namespace: &str, obj: &CarObject) -> Result<(), StoreError> {
        let t0 = Instant::now();
        counter!("store_apply_total", 1u64);
        let api: Api<Car> = Api::namespaced(self.client.clone(), namespace);
        // Server-side apply: creates when absent, no-op when the spec already matches.
        let pp = PatchParams::apply(CONTROLLER_NAME).force();
        let res = api.patch(obj.name(), &pp, &Patch::Apply(&desired(namespace, obj))).await;
        histogram!("store_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res.map(|_| ()).map_err(|e| {
            counter!("store_apply_err", 1u64);
            store_error(e)
        })
    }
}

/// Publishes object events through the `events.k8s.io` API.
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
    gvk: GroupVersionKind,
}

impl KubeRecorder {
    /// `scheme` must already have the `Car` kind registered.
    pub fn new(client: Client, scheme: &Scheme) -> Result<Self> {
        let gvk = scheme
            .gvk_for(KIND)
            .cloned()
            .ok_or_else(|| anyhow!("kind {} is not registered in the scheme", KIND))?;
        let instance = std::env::var("POD_NAME").ok().unwrap_or_else(|| Uuid::new_v4().to_string());
        let reporter = Reporter { controller: CONTROLLER_NAME.to_string(), instance: Some(instance) };
        Ok(Self { client, reporter, gvk })
    }

    fn reference(&self, obj: &CarObject) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.gvk.api_version()),
            kind: Some(self.gvk.kind.clone()),
            name: Some(obj.name().to_string()),
            namespace: obj.namespace().map(str::to_string),
            uid: obj.uid.clone(),
            resource_version: Some(obj.resource_version.clone()).filter(|rv| !rv.is_empty()),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeRecorder {
    async fn record(&self, obj: &CarObject, type_: EventType, reason: &str, message: &str) -> Result<(), RecordError> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), self.reference(obj));
        let type_ = match type_ {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        };
        recorder
            .publish(KubeEvent {
                type_,
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await
            .map_err(|e| RecordError(e.to_string()))
    }
}
