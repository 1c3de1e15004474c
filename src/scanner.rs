use anyhow::Result;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

use crate::cluster::ClusterApi;
use crate::detector::Detector;
use crate::lister::Lister;
use crate::patcher::{FixOutcome, Patcher};
use crate::workload::{WorkloadIdentity, WorkloadRecord};

pub struct ScanContext {
    pub lister: Lister,
    pub detector: Detector,
    pub patcher: Patcher,
}

/// Vulnerable workloads keyed by identity, so each is patched once.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub workloads: BTreeMap<WorkloadIdentity, WorkloadRecord>,
    pub pods: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub workloads: usize,
    pub pods: usize,
    pub fixed: usize,
    pub unsupported: usize,
}

pub async fn scan<C: ClusterApi>(ctx: &ScanContext, cluster: &C) -> Result<ScanResult> {
    let mut result = ScanResult::default();

    let namespaces = ctx.lister.list_namespaces(cluster).await?;
    info!("Scanning {} namespaces", namespaces.len());

    for namespace in namespaces {
        let namespace = namespace.name_any();
        let pods = ctx.lister.list_pods(cluster, &namespace).await?;
        debug!("Checking {} pods in namespace {}", pods.len(), namespace);

        for pod in pods {
            let Some(finding) = ctx.detector.detect(cluster, &pod).await? else {
                continue;
            };
            result.pods += 1;
            match result.workloads.get_mut(&finding.identity) {
                Some(record) => record.merge(finding),
                None => {
                    result
                        .workloads
                        .insert(finding.identity.clone(), WorkloadRecord::from(finding));
                }
            }
        }
    }

    info!(
        "Found {} workloads ({} pods) with vulnerable images",
        result.workloads.len(),
        result.pods
    );
    Ok(result)
}

/// One scan followed by one fix per workload. The first failed fix aborts the batch.
pub async fn run<C: ClusterApi>(ctx: &ScanContext, cluster: &C) -> Result<RunSummary> {
    let scanned = scan(ctx, cluster).await?;
    let mut summary = RunSummary {
        workloads: scanned.workloads.len(),
        pods: scanned.pods,
        ..RunSummary::default()
    };

    for record in scanned.workloads.values() {
        match ctx.patcher.fix(cluster, record).await {
            Ok(FixOutcome::Unsupported(_)) => summary.unsupported += 1,
            Ok(outcome) => {
                info!(
                    workload = %record.identity,
                    pods = ?record.pod_names,
                    outcome = ?outcome,
                    "Fix succeeded"
                );
                summary.fixed += 1;
            }
            Err(e) => {
                error!(workload = %record.identity, error = ?e, "Fix failed");
                return Err(e);
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::detector::Denylist;
    use crate::error::FixError;
    use crate::lister::RetryPolicy;
    use crate::patcher::{FIXED_AT_ANNOTATION, NO_LOOKUPS_FLAG};
    use k8s_openapi::api::apps::v1::{
        Deployment, DeploymentSpec, ReplicaSet, StatefulSet, StatefulSetSpec,
    };
    use k8s_openapi::api::core::v1::{
        Container, ContainerStatus, Pod, PodSpec, PodStatus, PodTemplateSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::time::Duration;

    fn context() -> ScanContext {
        ScanContext {
            lister: Lister {
                page_size: 2,
                retry: RetryPolicy {
                    attempts: 3,
                    min_backoff: Duration::ZERO,
                    max_backoff: Duration::ZERO,
                },
            },
            detector: Detector::new(Denylist::new(["log4j-app:2.14"])),
            patcher: Patcher::default(),
        }
    }

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            kind: kind.to_string(),
            name: name.to_string(),
            ..OwnerReference::default()
        }
    }

    fn java_container() -> Container {
        Container {
            name: "app".to_string(),
            command: Some(vec!["java".to_string(), "-jar".to_string(), "app.jar".to_string()]),
            ..Container::default()
        }
    }

    fn pod(namespace: &str, name: &str, owner_ref: OwnerReference, image: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.name = Some(name.to_string());
        pod.metadata.owner_references = Some(vec![owner_ref]);
        pod.spec = Some(PodSpec {
            containers: vec![java_container()],
            ..PodSpec::default()
        });
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "app".to_string(),
                image: image.to_string(),
                image_id: format!("sha256:{}", name),
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        });
        pod
    }

    fn template() -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![java_container()],
                ..PodSpec::default()
            }),
            ..PodTemplateSpec::default()
        }
    }

    fn web_pod(name: &str) -> Pod {
        pod("shop", name, owner("ReplicaSet", "web-7d9f8"), "log4j-app:2.14")
    }

    fn deployment(namespace: &str, name: &str) -> Deployment {
        let mut deployment = Deployment::default();
        deployment.metadata.namespace = Some(namespace.to_string());
        deployment.metadata.name = Some(name.to_string());
        deployment.spec = Some(DeploymentSpec {
            template: template(),
            ..DeploymentSpec::default()
        });
        deployment
    }

    fn cluster() -> FakeCluster {
        let mut rs = ReplicaSet::default();
        rs.metadata.namespace = Some("shop".to_string());
        rs.metadata.name = Some("web-7d9f8".to_string());
        rs.metadata.owner_references = Some(vec![owner("Deployment", "web")]);

        let mut statefulset = StatefulSet::default();
        statefulset.metadata.namespace = Some("data".to_string());
        statefulset.metadata.name = Some("search".to_string());
        statefulset.spec = Some(StatefulSetSpec {
            template: template(),
            ..StatefulSetSpec::default()
        });

        FakeCluster::new()
            .with_namespaces(&["shop", "data", "kube-system"])
            .with_object(rs)
            .with_object(deployment("shop", "web"))
            .with_object(statefulset)
            .with_pod(web_pod("web-7d9f8-a"))
            .with_pod(web_pod("web-7d9f8-b"))
            .with_pod(web_pod("web-7d9f8-c"))
            .with_pod(pod("shop", "cart-1", owner("ReplicaSet", "cart-55c"), "log4j-app:2.17"))
            .with_pod(pod("data", "search-0", owner("StatefulSet", "search"), "log4j-app:2.14"))
            .with_pod(pod("kube-system", "backup-1", owner("Job", "backup"), "log4j-app:2.14"))
    }

    #[tokio::test]
    async fn test_scan_deduplicates_by_workload() {
        let cluster = cluster();

        let result = scan(&context(), &cluster).await.unwrap();

        assert_eq!(result.pods, 5);
        assert_eq!(result.workloads.len(), 3);
        let web = &result.workloads[&WorkloadIdentity::new("Deployment", "shop", "web")];
        assert_eq!(web.pod_names, vec!["web-7d9f8-a", "web-7d9f8-b", "web-7d9f8-c"]);
        let backup = WorkloadIdentity::new("Job", "kube-system", "backup");
        assert!(result.workloads.contains_key(&backup));
    }

    #[tokio::test]
    async fn test_run_patches_each_workload_once() {
        let cluster = cluster();

        let summary = run(&context(), &cluster).await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                workloads: 3,
                pods: 5,
                fixed: 2,
                unsupported: 1,
            }
        );
        let updates = cluster.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates
                .iter()
                .filter(|(kind, _, name)| kind == "Deployment" && name == "web")
                .count(),
            1
        );
        let deployment: Deployment = cluster.stored("shop", "web").unwrap();
        let command = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .command
            .clone()
            .unwrap();
        assert_eq!(command[1], NO_LOOKUPS_FLAG);
    }

    #[tokio::test]
    async fn test_run_aborts_on_first_failed_fix() {
        let mut already_fixed = pod("shop", "api-1", owner("Deployment", "api"), "log4j-app:2.14");
        already_fixed.spec.as_mut().unwrap().containers[0].command = Some(vec![
            "java".to_string(),
            NO_LOOKUPS_FLAG.to_string(),
            "-jar".to_string(),
            "app.jar".to_string(),
        ]);
        let fixable = pod("shop", "web-1", owner("Deployment", "web"), "log4j-app:2.14");
        let cluster = FakeCluster::new()
            .with_namespaces(&["shop"])
            .with_object(deployment("shop", "api"))
            .with_object(deployment("shop", "web"))
            .with_pod(already_fixed)
            .with_pod(fixable);

        let err = run(&context(), &cluster).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<FixError>(),
            Some(FixError::NoModification { .. })
        ));
        // "web" sorts after "api" and is abandoned with the rest of the batch.
        assert_eq!(cluster.update_count(), 0);
        let web: Deployment = cluster.stored("shop", "web").unwrap();
        assert!(!web.annotations().contains_key(FIXED_AT_ANNOTATION));
    }

    #[tokio::test]
    async fn test_scan_aborts_on_ambiguous_start_command() {
        let mut undeclared = pod("shop", "web-1", owner("Deployment", "web"), "log4j-app:2.14");
        undeclared.spec.as_mut().unwrap().containers[0].command = None;
        let cluster = FakeCluster::new()
            .with_namespaces(&["shop"])
            .with_object(deployment("shop", "web"))
            .with_pod(undeclared)
            .with_exec_output("web-1", "app", "java -jar app.jar\njava -jar worker.jar\n");

        let err = scan(&context(), &cluster).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<FixError>(),
            Some(FixError::AmbiguousStartCommand { .. })
        ));
        assert_eq!(cluster.update_count(), 0);
    }

    #[tokio::test]
    async fn test_run_aborts_when_listing_keeps_failing() {
        let cluster = cluster().with_list_failures(3);

        assert!(run(&context(), &cluster).await.is_err());
        assert_eq!(cluster.update_count(), 0);
    }
}
