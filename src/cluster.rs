use anyhow::{Context, Result};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{AttachParams, ListParams, ObjectList, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::env;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::error::FixError;

/// Namespaced objects the scanner reads and writes by name.
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// One page of a paginated list call.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continue_token: Option<String>,
    /// Server estimate of how many items are left after this page.
    pub remaining_item_count: Option<i64>,
}

impl<T: Clone> From<ObjectList<T>> for Page<T> {
    fn from(list: ObjectList<T>) -> Self {
        Self {
            continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
            remaining_item_count: list.metadata.remaining_item_count,
            items: list.items,
        }
    }
}

/// Captured output of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Treats anything written to stderr as a failure of the command.
    pub fn into_stdout(self) -> Result<String, FixError> {
        if self.stderr.is_empty() {
            Ok(self.stdout)
        } else {
            Err(FixError::ExecStderr(self.stderr))
        }
    }
}

/// The orchestration API operations the scanner needs.
pub trait ClusterApi {
    async fn list_namespaces(&self, params: &ListParams) -> Result<Page<Namespace>>;

    async fn list_pods(&self, namespace: &str, params: &ListParams) -> Result<Page<Pod>>;

    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<K>;

    async fn replace<K: ClusterObject>(&self, namespace: &str, name: &str, object: &K)
    -> Result<K>;

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<ExecOutput>;
}

pub async fn create_client(kube_config: Option<&Path>) -> Result<Client> {
    info!("Initializing K8s client");
    let config = match kube::Config::incluster() {
        Ok(config) => {
            info!("Using in-cluster configuration");
            config
        }
        Err(e) => {
            debug!("In-cluster configuration unavailable: {}", e);
            let path = kube_config
                .map(Path::to_path_buf)
                .or_else(|| env::var_os("KUBECONFIG").map(PathBuf::from))
                .context("required kube-config file path")?;
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("Failed to read kube-config {}", path.display()))?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .with_context(|| format!("Invalid kube-config {}", path.display()))?;
            info!("Using kube-config {}", path.display());
            config
        }
    };

    let client = Client::try_from(config).context("Failed to build K8s client")?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ClusterApi for KubeCluster {
    async fn list_namespaces(&self, params: &ListParams) -> Result<Page<Namespace>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces
            .list(params)
            .await
            .context("Failed to list namespaces")?;
        Ok(list.into())
    }

    async fn list_pods(&self, namespace: &str, params: &ListParams) -> Result<Page<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(params)
            .await
            .with_context(|| format!("Failed to list pods in namespace {}", namespace))?;
        Ok(list.into())
    }

    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .with_context(|| format!("Failed to get {} {}/{}", K::kind_name(), namespace, name))
    }

    async fn replace<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        object: &K,
    ) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), object)
            .await
            .with_context(|| {
                format!("Failed to update {} {}/{}", K::kind_name(), namespace, name)
            })
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        info!(
            "Executing {:?} in pod {}/{} container {}",
            command, namespace, pod, container
        );
        let mut attached = pods
            .exec(pod, command.to_vec(), &params)
            .await
            .with_context(|| format!("Failed to exec in pod {}/{}", namespace, pod))?;

        // Both streams sit behind bounded buffers and must be drained together.
        let mut output = ExecOutput::default();
        let (stdout, stderr) = tokio::join!(
            read_stream(attached.stdout(), &mut output.stdout),
            read_stream(attached.stderr(), &mut output.stderr),
        );
        stdout.context("Failed to read exec stdout")?;
        stderr.context("Failed to read exec stderr")?;
        if let Err(e) = attached.join().await {
            warn!("Exec session in pod {}/{} ended uncleanly: {}", namespace, pod, e);
        }
        Ok(output)
    }
}

async fn read_stream(
    reader: Option<impl AsyncRead + Unpin>,
    buf: &mut String,
) -> std::io::Result<usize> {
    match reader {
        Some(mut reader) => reader.read_to_string(buf).await,
        None => Ok(0),
    }
}
