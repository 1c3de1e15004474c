//! Walks owner references from a pod up to the resource that should be patched.
//!
//! Policy: at every level only the first owner reference whose kind is not `Node`
//! is followed. A workload is assumed to have a single logical controller.

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::cluster::{ClusterApi, ClusterObject};
use crate::workload::WorkloadIdentity;

const NODE_KIND: &str = "Node";

/// A `{kind, name}` link read from an owner reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerLink {
    pub kind: String,
    pub name: String,
}

/// Owner references in declaration order, `Node` owners removed.
pub fn owner_links(refs: &[OwnerReference]) -> impl Iterator<Item = OwnerLink> + '_ {
    refs.iter()
        .filter(|r| r.kind != NODE_KIND)
        .map(|r| OwnerLink {
            kind: r.kind.clone(),
            name: r.name.clone(),
        })
}

fn apply_first_owner(identity: &mut WorkloadIdentity, refs: &[OwnerReference]) {
    if let Some(link) = owner_links(refs).next() {
        identity.kind = link.kind;
        identity.name = link.name;
    }
}

pub async fn resolve_owner<C: ClusterApi>(cluster: &C, pod: &Pod) -> WorkloadIdentity {
    let mut identity =
        WorkloadIdentity::new("Pod", pod.namespace().unwrap_or_default(), pod.name_any());
    apply_first_owner(&mut identity, pod.owner_references());

    // Generated controller names carry a hyphenated suffix; a bare name means the
    // Job or ReplicaSet was created directly and is its own root.
    let parent_refs = match identity.kind.as_str() {
        "Job" if identity.name.contains('-') => {
            fetch_owner_references::<C, Job>(cluster, &identity).await
        }
        "ReplicaSet" if identity.name.contains('-') => {
            fetch_owner_references::<C, ReplicaSet>(cluster, &identity).await
        }
        _ => None,
    };

    if let Some(refs) = parent_refs {
        apply_first_owner(&mut identity, &refs);
    }
    debug!("Resolved pod {} to workload {}", pod.name_any(), identity);
    identity
}

async fn fetch_owner_references<C: ClusterApi, K: ClusterObject>(
    cluster: &C,
    identity: &WorkloadIdentity,
) -> Option<Vec<OwnerReference>> {
    match cluster.get::<K>(&identity.namespace, &identity.name).await {
        Ok(object) => Some(object.owner_references().to_vec()),
        Err(e) => {
            warn!(
                workload = %identity,
                error = ?e,
                "Failed to describe owning controller, stopping owner resolution"
            );
            None
        }
    }
}
