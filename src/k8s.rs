use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt, future};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{self, Config as WatchConfig, Event as WatcherEvent};
use kube::{Api, Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::NotFoundError;
use crate::model::{ChangeEvent, NamespaceScope, ObjectRef, ResourceKind, ResourceRow};
use crate::watch::{ChangeFeed, SnapshotFetcher, Subscription};

const NONE_VALUE: &str = "<none>";
const UNKNOWN_AGE: &str = "<unknown>";
const LIST_PAGE_SIZE: u32 = 500;
const NODE_ROLE_PREFIX: &str = "node-role.kubernetes.io/";
const HEALTH_POD_COLUMNS: usize = 4;

type CellBuilder<K> = fn(&K, DateTime<Utc>) -> Vec<String>;

/// Explicit connection state for one command invocation. The API client is
/// created on first use and cached until `reset`.
pub struct KubeSession {
    context: Option<String>,
    connection: OnceCell<Connection>,
}

struct Connection {
    client: Client,
    default_namespace: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContextEntry {
    pub name: String,
    pub cluster: String,
    pub namespace: Option<String>,
    pub current: bool,
}

impl KubeSession {
    pub fn new(context: Option<String>) -> Self {
        Self {
            context,
            connection: OnceCell::new(),
        }
    }

    pub fn selected_context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn use_context(&mut self, context: impl Into<String>) {
        self.context = Some(context.into());
        self.reset();
    }

    /// Drops the cached client so the next call reconnects with the current selection.
    pub fn reset(&mut self) {
        if self.connection.initialized() {
            debug!("dropping cached Kubernetes client");
        }
        self.connection = OnceCell::new();
    }

    async fn connection(&self) -> Result<&Connection> {
        self.connection
            .get_or_try_init(|| connect(self.context.clone()))
            .await
    }

    pub async fn client(&self) -> Result<Client> {
        Ok(self.connection().await?.client.clone())
    }

    /// Namespace of the active kubeconfig context, `default` when it sets none.
    pub async fn default_namespace(&self) -> Result<String> {
        Ok(self.connection().await?.default_namespace.clone())
    }

    pub async fn get_row(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<ResourceRow> {
        match kind {
            ResourceKind::Pods => self.get_row_of::<Pod>(kind, namespace, name, pod_cells).await,
            ResourceKind::Deployments => {
                self.get_row_of::<Deployment>(kind, namespace, name, deployment_cells)
                    .await
            }
            ResourceKind::Services => {
                self.get_row_of::<Service>(kind, namespace, name, service_cells)
                    .await
            }
            ResourceKind::ConfigMaps => {
                self.get_row_of::<ConfigMap>(kind, namespace, name, configmap_cells)
                    .await
            }
            ResourceKind::Secrets => {
                self.get_row_of::<Secret>(kind, namespace, name, secret_cells)
                    .await
            }
            ResourceKind::Ingresses => {
                self.get_row_of::<Ingress>(kind, namespace, name, ingress_cells)
                    .await
            }
            ResourceKind::ServiceAccounts => {
                self.get_row_of::<ServiceAccount>(kind, namespace, name, service_account_cells)
                    .await
            }
        }
    }

    pub async fn namespace_rows(&self) -> Result<Vec<ResourceRow>> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        let namespaces = list_all(&api)
            .await
            .context("failed to list namespaces")?;
        let now = Utc::now();
        Ok(namespaces
            .iter()
            .map(|namespace| ResourceRow::new(namespace_cells(namespace, now)))
            .collect())
    }

    pub async fn namespace_names(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        let namespaces = list_all(&api)
            .await
            .context("failed to list namespaces")?;
        Ok(namespaces.iter().map(ResourceExt::name_any).collect())
    }

    pub async fn node_rows(&self) -> Result<Vec<ResourceRow>> {
        let api: Api<Node> = Api::all(self.client().await?);
        let nodes = list_all(&api).await.context("failed to list nodes")?;
        let now = Utc::now();
        Ok(nodes
            .iter()
            .map(|node| ResourceRow::new(node_cells(node, now)))
            .collect())
    }

    /// NAME, READY, STATUS and RESTARTS of every pod in `namespace`.
    pub async fn pod_health_rows(&self, namespace: &str) -> Result<Vec<ResourceRow>> {
        let api: Api<Pod> = Api::namespaced(self.client().await?, namespace);
        let pods = list_all(&api)
            .await
            .with_context(|| format!("failed to list pods in namespace '{namespace}'"))?;
        let now = Utc::now();
        Ok(pods
            .iter()
            .map(|pod| {
                let mut cells = pod_cells(pod, now);
                cells.truncate(HEALTH_POD_COLUMNS);
                ResourceRow::new(cells)
            })
            .collect())
    }

    async fn list_rows<K>(
        &self,
        scope: &NamespaceScope,
        cells: CellBuilder<K>,
    ) -> Result<Vec<ResourceRow>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = scoped_api(self.client().await?, scope);
        let objects = list_all(&api).await?;
        let now = Utc::now();
        Ok(objects
            .iter()
            .map(|object| ResourceRow::scoped(scope, object.namespace(), cells(object, now)))
            .collect())
    }

    async fn get_row_of<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        cells: CellBuilder<K>,
    ) -> Result<ResourceRow>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client().await?, namespace);
        let object = api
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get {}/{name}", kind.singular()))?
            .ok_or_else(|| NotFoundError {
                kind: kind.singular(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;
        Ok(ResourceRow::new(cells(&object, Utc::now())))
    }
}

#[async_trait]
impl SnapshotFetcher for KubeSession {
    async fn fetch(&self, kind: ResourceKind, scope: &NamespaceScope) -> Result<Vec<ResourceRow>> {
        debug!(%kind, scope = scope.label(), "fetching snapshot");
        match kind {
            ResourceKind::Pods => self.list_rows::<Pod>(scope, pod_cells).await,
            ResourceKind::Deployments => self.list_rows::<Deployment>(scope, deployment_cells).await,
            ResourceKind::Services => self.list_rows::<Service>(scope, service_cells).await,
            ResourceKind::ConfigMaps => self.list_rows::<ConfigMap>(scope, configmap_cells).await,
            ResourceKind::Secrets => self.list_rows::<Secret>(scope, secret_cells).await,
            ResourceKind::Ingresses => self.list_rows::<Ingress>(scope, ingress_cells).await,
            ResourceKind::ServiceAccounts => {
                self.list_rows::<ServiceAccount>(scope, service_account_cells)
                    .await
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for KubeSession {
    async fn open(&self, kind: ResourceKind, scope: &NamespaceScope) -> Result<Subscription> {
        let client = self.client().await?;
        let subscription = match kind {
            ResourceKind::Pods => open_feed(scoped_api::<Pod>(client, scope)).await?,
            ResourceKind::Deployments => {
                open_feed(scoped_api::<Deployment>(client, scope)).await?
            }
            ResourceKind::Services => open_feed(scoped_api::<Service>(client, scope)).await?,
            ResourceKind::ConfigMaps => open_feed(scoped_api::<ConfigMap>(client, scope)).await?,
            ResourceKind::Secrets => open_feed(scoped_api::<Secret>(client, scope)).await?,
            ResourceKind::Ingresses => open_feed(scoped_api::<Ingress>(client, scope)).await?,
            ResourceKind::ServiceAccounts => {
                open_feed(scoped_api::<ServiceAccount>(client, scope)).await?
            }
        };
        debug!(%kind, scope = scope.label(), "watch established");
        Ok(subscription.on_stop(move || debug!(%kind, "watch released")))
    }
}

/// Reads kubeconfig contexts without connecting to any cluster.
pub fn kube_contexts(selected: Option<&str>) -> Result<Vec<ContextEntry>> {
    let kubeconfig = Kubeconfig::read().context("failed to read kubeconfig")?;
    Ok(context_entries(&kubeconfig, selected))
}

fn context_entries(kubeconfig: &Kubeconfig, selected: Option<&str>) -> Vec<ContextEntry> {
    let current = selected.or(kubeconfig.current_context.as_deref());
    let mut entries = kubeconfig
        .contexts
        .iter()
        .filter_map(|named| {
            let context = named.context.as_ref()?;
            Some(ContextEntry {
                name: named.name.clone(),
                cluster: context.cluster.clone(),
                namespace: context.namespace.clone(),
                current: current == Some(named.name.as_str()),
            })
        })
        .collect::<Vec<_>>();
    entries.sort_by(|left, right| left.name.cmp(&right.name));
    entries
}

async fn connect(context: Option<String>) -> Result<Connection> {
    let kubeconfig = Kubeconfig::read().ok();

    let config = if let Some(kubeconfig_value) = kubeconfig.clone() {
        let options = KubeConfigOptions {
            context: context.clone(),
            cluster: None,
            user: None,
        };
        Config::from_custom_kubeconfig(kubeconfig_value, &options)
            .await
            .context("failed to load Kubernetes configuration")?
    } else {
        if let Some(context) = &context {
            anyhow::bail!("kubeconfig not found; context '{context}' cannot be selected");
        }
        Config::infer()
            .await
            .context("failed to infer Kubernetes configuration")?
    };

    let cluster = config.cluster_url.to_string();
    let default_namespace = config.default_namespace.clone();
    let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;

    let context = context
        .or_else(|| kubeconfig.and_then(|cfg| cfg.current_context))
        .unwrap_or_else(|| "in-cluster".to_string());
    info!(%context, %cluster, "connected to Kubernetes API");

    Ok(Connection {
        client,
        default_namespace,
    })
}

fn scoped_api<K>(client: Client, scope: &NamespaceScope) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match scope {
        NamespaceScope::All => Api::all(client),
        NamespaceScope::Named(namespace) => Api::namespaced(client, namespace),
    }
}

/// Follows continue tokens so callers always get the whole collection in API order.
async fn list_all<K>(api: &Api<K>) -> Result<Vec<K>, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut items = Vec::new();
    let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
    loop {
        let page = api.list(&params).await?;
        items.extend(page.items);
        match page.metadata.continue_.filter(|token| !token.is_empty()) {
            Some(token) => params = params.continue_token(&token),
            None => return Ok(items),
        }
    }
}

/// Starts a watcher and waits for its initial listing, so failures to
/// establish the watch surface here rather than as a closed stream later.
async fn open_feed<K>(api: Api<K>) -> Result<Subscription>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
    <K as Resource>::DynamicType: Default + Eq + Hash + Clone + Send,
{
    let changes = follow_changes(watcher::watcher(api, WatchConfig::default()).boxed()).await?;
    Ok(Subscription::new(changes))
}

/// Consumes `events` up to the end of the initial listing, then yields one
/// change per watcher event. Changes that arrive during the listing come
/// first. The first error or the end of `events` ends the returned stream.
async fn follow_changes<K, S>(mut events: S) -> Result<BoxStream<'static, ChangeEvent>>
where
    K: Resource + Send + 'static,
    S: Stream<Item = Result<WatcherEvent<K>, watcher::Error>> + Send + Unpin + 'static,
{
    let mut tracker = ChangeTracker::default();
    let mut early = Vec::new();
    loop {
        match events.try_next().await.context("watch request failed")? {
            Some(WatcherEvent::InitDone) => break,
            Some(event) => early.extend(tracker.observe(event)),
            None => anyhow::bail!("watch stream ended before the initial listing completed"),
        }
    }
    if !early.is_empty() {
        debug!(count = early.len(), "changes arrived during the initial listing");
    }

    let changes = events
        .scan(tracker, |tracker, item| {
            let next = match item {
                Ok(event) => Some(tracker.observe(event)),
                Err(error) => {
                    warn!("watch stream error: {error}");
                    None
                }
            };
            future::ready(next)
        })
        .filter_map(future::ready);

    Ok(stream::iter(early).chain(changes).boxed())
}

/// Turns watcher events into added/modified/deleted changes. The watcher
/// reports creations and updates alike, so known objects tell them apart.
#[derive(Debug, Default)]
struct ChangeTracker {
    known: HashSet<ObjectRef>,
}

impl ChangeTracker {
    fn observe<K: Resource>(&mut self, event: WatcherEvent<K>) -> Option<ChangeEvent> {
        match event {
            WatcherEvent::Init => {
                self.known.clear();
                None
            }
            WatcherEvent::InitApply(object) => {
                self.known.insert(object_ref(&object));
                None
            }
            WatcherEvent::InitDone => None,
            WatcherEvent::Apply(object) => {
                let object = object_ref(&object);
                if self.known.insert(object.clone()) {
                    Some(ChangeEvent::Added(object))
                } else {
                    Some(ChangeEvent::Modified(object))
                }
            }
            WatcherEvent::Delete(object) => {
                let object = object_ref(&object);
                self.known.remove(&object);
                Some(ChangeEvent::Deleted(object))
            }
        }
    }
}

fn object_ref<K: Resource>(object: &K) -> ObjectRef {
    ObjectRef::new(object.name_any(), object.namespace())
}

fn pod_cells(pod: &Pod, now: DateTime<Utc>) -> Vec<String> {
    let total = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.len())
        .unwrap_or(0);
    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or(&[]);
    let ready = statuses.iter().filter(|container| container.ready).count();
    let restarts = statuses
        .iter()
        .map(|container| container.restart_count)
        .sum::<i32>();
    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .filter(|phase| !phase.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    vec![
        pod.name_any(),
        format!("{ready}/{total}"),
        phase,
        restarts.to_string(),
        age(&pod.metadata, now),
    ]
}

fn deployment_cells(deployment: &Deployment, now: DateTime<Utc>) -> Vec<String> {
    let status = deployment.status.as_ref();
    let replicas = status.and_then(|status| status.replicas).unwrap_or(0);
    let ready = status.and_then(|status| status.ready_replicas).unwrap_or(0);
    let updated = status
        .and_then(|status| status.updated_replicas)
        .unwrap_or(0);
    let available = status
        .and_then(|status| status.available_replicas)
        .unwrap_or(0);

    vec![
        deployment.name_any(),
        format!("{ready}/{replicas}"),
        updated.to_string(),
        available.to_string(),
        age(&deployment.metadata, now),
    ]
}

fn service_cells(service: &Service, now: DateTime<Utc>) -> Vec<String> {
    let spec = service.spec.as_ref();
    let service_type = spec
        .and_then(|spec| spec.type_.clone())
        .unwrap_or_else(|| "ClusterIP".to_string());
    let cluster_ip = spec
        .and_then(|spec| spec.cluster_ip.clone())
        .unwrap_or_else(|| NONE_VALUE.to_string());
    let external_ip = spec
        .and_then(|spec| spec.external_ips.as_ref())
        .and_then(|ips| ips.first().cloned())
        .or_else(|| {
            service
                .status
                .as_ref()
                .and_then(|status| status.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|ingress| ingress.first())
                .and_then(|entry| first_address(entry.ip.as_deref(), entry.hostname.as_deref()))
        })
        .unwrap_or_else(|| NONE_VALUE.to_string());
    let ports = spec
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|port| {
                    let protocol = port.protocol.as_deref().unwrap_or("TCP");
                    match port.node_port.filter(|node_port| *node_port != 0) {
                        Some(node_port) => format!("{}:{node_port}/{protocol}", port.port),
                        None => format!("{}/{protocol}", port.port),
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|ports| !ports.is_empty())
        .map(|ports| ports.join(","))
        .unwrap_or_else(|| NONE_VALUE.to_string());

    vec![
        service.name_any(),
        service_type,
        cluster_ip,
        external_ip,
        ports,
        age(&service.metadata, now),
    ]
}

fn configmap_cells(configmap: &ConfigMap, now: DateTime<Utc>) -> Vec<String> {
    let data = configmap.data.as_ref().map(|data| data.len()).unwrap_or(0);
    vec![
        configmap.name_any(),
        data.to_string(),
        age(&configmap.metadata, now),
    ]
}

fn secret_cells(secret: &Secret, now: DateTime<Utc>) -> Vec<String> {
    let secret_type = secret
        .type_
        .clone()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "Opaque".to_string());
    let data = secret.data.as_ref().map(|data| data.len()).unwrap_or(0);
    vec![
        secret.name_any(),
        secret_type,
        data.to_string(),
        age(&secret.metadata, now),
    ]
}

fn ingress_cells(ingress: &Ingress, now: DateTime<Utc>) -> Vec<String> {
    let spec = ingress.spec.as_ref();
    let class = spec
        .and_then(|spec| spec.ingress_class_name.clone())
        .or_else(|| {
            ingress
                .annotations()
                .get("kubernetes.io/ingress.class")
                .filter(|value| !value.is_empty())
                .cloned()
        })
        .unwrap_or_else(|| NONE_VALUE.to_string());

    let rules = spec
        .and_then(|spec| spec.rules.as_deref())
        .unwrap_or(&[]);
    let hosts = rules
        .iter()
        .filter_map(|rule| rule.host.clone())
        .filter(|host| !host.is_empty())
        .collect::<Vec<_>>();
    let ports = rules
        .iter()
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| &http.paths)
        .filter_map(|path| path.backend.service.as_ref())
        .map(|backend| {
            backend
                .port
                .as_ref()
                .and_then(|port| {
                    port.number
                        .map(|number| number.to_string())
                        .or_else(|| port.name.clone())
                })
                .unwrap_or_else(|| "0".to_string())
        })
        .collect::<Vec<_>>();
    let address = ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|entries| entries.first())
        .and_then(|entry| first_address(entry.ip.as_deref(), entry.hostname.as_deref()))
        .unwrap_or_else(|| NONE_VALUE.to_string());

    vec![
        ingress.name_any(),
        class,
        summarize(&hosts),
        address,
        summarize(&ports),
        age(&ingress.metadata, now),
    ]
}

fn service_account_cells(account: &ServiceAccount, now: DateTime<Utc>) -> Vec<String> {
    let secrets = account.secrets.as_ref().map(|refs| refs.len()).unwrap_or(0);
    vec![
        account.name_any(),
        secrets.to_string(),
        age(&account.metadata, now),
    ]
}

fn namespace_cells(namespace: &Namespace, now: DateTime<Utc>) -> Vec<String> {
    let phase = namespace
        .status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .filter(|phase| !phase.is_empty())
        .unwrap_or_else(|| "Active".to_string());
    vec![namespace.name_any(), phase, age(&namespace.metadata, now)]
}

fn node_cells(node: &Node, now: DateTime<Utc>) -> Vec<String> {
    let version = node
        .status
        .as_ref()
        .and_then(|status| status.node_info.as_ref())
        .map(|info| info.kubelet_version.clone())
        .unwrap_or_default();
    vec![
        node.name_any(),
        node_status(node).to_string(),
        node_roles(node),
        age(&node.metadata, now),
        version,
    ]
}

/// `NotReady` only when the Ready condition exists and is not `True`.
fn node_status(node: &Node) -> &'static str {
    let ready = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|condition| condition.type_ == "Ready"));
    match ready {
        Some(condition) if condition.status != "True" => "NotReady",
        _ => "Ready",
    }
}

fn node_roles(node: &Node) -> String {
    let roles = node
        .labels()
        .keys()
        .filter_map(|label| label.strip_prefix(NODE_ROLE_PREFIX))
        .collect::<Vec<_>>();
    if roles.is_empty() {
        NONE_VALUE.to_string()
    } else {
        roles.join(",")
    }
}

fn first_address(ip: Option<&str>, hostname: Option<&str>) -> Option<String> {
    ip.filter(|value| !value.is_empty())
        .or(hostname.filter(|value| !value.is_empty()))
        .map(str::to_string)
}

/// `first`, `first +N more`, or `<none>`.
fn summarize(values: &[String]) -> String {
    match values {
        [] => NONE_VALUE.to_string(),
        [only] => only.clone(),
        [first, rest @ ..] => format!("{first} +{} more", rest.len()),
    }
}

fn age(metadata: &ObjectMeta, now: DateTime<Utc>) -> String {
    metadata
        .creation_timestamp
        .as_ref()
        .and_then(|time| DateTime::<Utc>::from_timestamp(time.0.as_second(), 0))
        .map(|created| format_age(now.signed_duration_since(created)))
        .unwrap_or_else(|| UNKNOWN_AGE.to_string())
}

/// Largest whole unit of `elapsed`; clock skew in the future reads as `0s`.
fn format_age(elapsed: TimeDelta) -> String {
    let elapsed = elapsed.max(TimeDelta::zero());
    match (elapsed.num_days(), elapsed.num_hours(), elapsed.num_minutes()) {
        (days, _, _) if days > 0 => format!("{days}d"),
        (_, hours, _) if hours > 0 => format!("{hours}h"),
        (_, _, minutes) if minutes > 0 => format!("{minutes}m"),
        _ => format!("{}s", elapsed.num_seconds()),
    }
}
