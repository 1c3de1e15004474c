use anyhow::Result;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, info, warn};

use crate::cluster::ClusterApi;
use crate::error::FixError;
use crate::owner::resolve_owner;
use crate::workload::{PodFinding, ResolvedCommand, WorkloadIdentity};

static PS_COMMAND: [&str; 4] = ["ps", "-e", "-o", "args="];
static PS_NOISE: [&str; 4] = ["ps -e -o args=", "bash", "sh", "zsh"];

/// Exact, case-sensitive set of vulnerable image references and image IDs.
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    images: HashSet<String>,
}

impl Denylist {
    pub fn new<S: Into<String>>(images: impl IntoIterator<Item = S>) -> Self {
        Self {
            images: images.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Returns the image reference or image ID of `status` that is denylisted, image first.
    pub fn matches<'a>(&self, status: &'a ContainerStatus) -> Option<&'a str> {
        [status.image.as_str(), status.image_id.as_str()]
            .into_iter()
            .find(|candidate| self.images.contains(*candidate))
    }
}

pub struct Detector {
    denylist: Denylist,
}

impl Detector {
    pub fn new(denylist: Denylist) -> Self {
        Self { denylist }
    }

    /// Checks every container of `pod` against the denylist.
    ///
    /// Returns `None` for clean pods and for pods whose start command could not be
    /// read from the running container. An ambiguous start command is an error.
    pub async fn detect<C: ClusterApi>(
        &self,
        cluster: &C,
        pod: &Pod,
    ) -> Result<Option<PodFinding>> {
        let pod_name = pod.name_any();
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();

        let mut identity: Option<WorkloadIdentity> = None;
        let mut images = BTreeMap::new();
        let mut containers = BTreeMap::new();

        for status in statuses {
            let Some(matched) = self.denylist.matches(status) else {
                continue;
            };
            let workload = match &identity {
                Some(workload) => workload.clone(),
                None => {
                    let workload = resolve_owner(cluster, pod).await;
                    identity = Some(workload.clone());
                    workload
                }
            };
            info!(
                workload = %workload,
                pod = %pod_name,
                container = %status.name,
                image = %matched,
                "Found vulnerable workload"
            );
            images.insert(status.name.clone(), matched.to_string());

            let mut resolved = declared_command(pod, &status.name);
            if resolved.is_empty() {
                let discovered = self
                    .discover_start_command(cluster, pod, &status.name)
                    .await
                    .inspect_err(|e| {
                        error!(
                            workload = %workload,
                            pod = %pod_name,
                            container = %status.name,
                            error = %e,
                            "Failed to resolve start command"
                        )
                    })?;
                let Some(command) = discovered else {
                    return Ok(None);
                };
                info!(
                    pod = %pod_name,
                    container = %status.name,
                    command = ?command,
                    "Got start command by exec in container"
                );
                resolved.command = command;
            }
            containers.insert(status.name.clone(), resolved);
        }

        Ok(identity.map(|identity| PodFinding {
            identity,
            pod_name,
            images,
            containers,
        }))
    }

    /// Lists processes inside the container. `Ok(None)` means the exec itself failed.
    async fn discover_start_command<C: ClusterApi>(
        &self,
        cluster: &C,
        pod: &Pod,
        container: &str,
    ) -> Result<Option<Vec<String>>> {
        let namespace = pod.namespace().unwrap_or_default();
        let pod_name = pod.name_any();
        let output = cluster
            .exec(&namespace, &pod_name, container, &PS_COMMAND)
            .await
            .and_then(|output| Ok(output.into_stdout()?));

        let stdout = match output {
            Ok(stdout) => stdout,
            Err(e) => {
                error!(
                    pod = %pod_name,
                    container = %container,
                    error = ?e,
                    "Exec in container failed, skipping pod"
                );
                return Ok(None);
            }
        };

        let command = parse_start_command(&stdout, &pod_name, container)?;
        if command.is_empty() {
            warn!(
                pod = %pod_name,
                container = %container,
                "No start command found in process list"
            );
        }
        Ok(Some(command))
    }
}

/// The command and args the pod spec declares for `container`.
fn declared_command(pod: &Pod, container: &str) -> ResolvedCommand {
    let declared = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.iter().find(|c| c.name == container));
    match declared {
        Some(c) => ResolvedCommand::new(
            c.command.clone().unwrap_or_default(),
            c.args.clone().unwrap_or_default(),
        ),
        None => {
            warn!(container = %container, "Container status has no matching spec container");
            ResolvedCommand::default()
        }
    }
}

/// Picks the single start command out of `ps -e -o args=` output.
pub fn parse_start_command(
    output: &str,
    pod: &str,
    container: &str,
) -> Result<Vec<String>, FixError> {
    let candidates: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !PS_NOISE.contains(line))
        .collect();

    match candidates.as_slice() {
        [] => Ok(Vec::new()),
        [line] => Ok(line.split_whitespace().map(String::from).collect()),
        _ => Err(FixError::AmbiguousStartCommand {
            pod: pod.to_string(),
            container: container.to_string(),
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
        }),
    }
}
