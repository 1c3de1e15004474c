use std::collections::BTreeMap;
use std::fmt;

/// Kind, namespace and name of the top-level resource that owns a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadIdentity {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl WorkloadIdentity {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::from(self.kind.as_str())
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Workload kinds the patcher knows how to update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    Unsupported(String),
}

impl From<&str> for WorkloadKind {
    fn from(kind: &str) -> Self {
        match kind {
            "Deployment" => WorkloadKind::Deployment,
            "DaemonSet" => WorkloadKind::DaemonSet,
            "StatefulSet" => WorkloadKind::StatefulSet,
            other => WorkloadKind::Unsupported(other.to_string()),
        }
    }
}

/// The effective start line of a container.
///
/// Either copied from the pod spec or, when the pod declares neither, discovered
/// from the process list of the running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub command: Vec<String>,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    pub fn new<S: Into<String>>(
        command: impl IntoIterator<Item = S>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.command.is_empty() && self.args.is_empty()
    }

    /// Whether `token` appears anywhere in command followed by args.
    pub fn contains(&self, token: &str) -> bool {
        self.command.iter().chain(self.args.iter()).any(|t| t == token)
    }
}

/// What the detector learned about a single vulnerable pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodFinding {
    pub identity: WorkloadIdentity,
    pub pod_name: String,
    /// Container name to the matched image reference or image ID.
    pub images: BTreeMap<String, String>,
    pub containers: BTreeMap<String, ResolvedCommand>,
}

/// All vulnerable pods found for one workload, patched once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRecord {
    pub identity: WorkloadIdentity,
    pub pod_names: Vec<String>,
    pub images: BTreeMap<String, String>,
    pub containers: BTreeMap<String, ResolvedCommand>,
}

impl From<PodFinding> for WorkloadRecord {
    fn from(finding: PodFinding) -> Self {
        Self {
            identity: finding.identity,
            pod_names: vec![finding.pod_name],
            images: finding.images,
            containers: finding.containers,
        }
    }
}

impl WorkloadRecord {
    /// Adds another pod of the same workload. Commands resolved from the first pod are kept.
    pub fn merge(&mut self, finding: PodFinding) {
        self.pod_names.push(finding.pod_name);
        for (container, image) in finding.images {
            self.images.entry(container).or_insert(image);
        }
        for (container, resolved) in finding.containers {
            self.containers.entry(container).or_insert(resolved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(pod: &str, container: &str, image: &str) -> PodFinding {
        PodFinding {
            identity: WorkloadIdentity::new("Deployment", "ns", "web"),
            pod_name: pod.to_string(),
            images: BTreeMap::from([(container.to_string(), image.to_string())]),
            containers: BTreeMap::from([(
                container.to_string(),
                ResolvedCommand::new(["java", "-jar", pod], []),
            )]),
        }
    }

    #[test]
    fn test_identity_display() {
        let id = WorkloadIdentity::new("Deployment", "default", "web");
        assert_eq!(id.to_string(), "/Deployment/default/web");
    }

    #[test]
    fn test_identity_equality_is_structural() {
        let a = WorkloadIdentity::new("Deployment", "default", "web");
        let b = WorkloadIdentity::new("Deployment", "default", "web");
        let c = WorkloadIdentity::new("StatefulSet", "default", "web");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_workload_kind_from_str() {
        assert_eq!(WorkloadKind::from("Deployment"), WorkloadKind::Deployment);
        assert_eq!(WorkloadKind::from("DaemonSet"), WorkloadKind::DaemonSet);
        assert_eq!(WorkloadKind::from("StatefulSet"), WorkloadKind::StatefulSet);
        assert_eq!(
            WorkloadKind::from("CronJob"),
            WorkloadKind::Unsupported("CronJob".to_string())
        );
        assert_eq!(
            WorkloadKind::from("deployment"),
            WorkloadKind::Unsupported("deployment".to_string())
        );
    }

    #[test]
    fn test_resolved_command_contains() {
        let resolved = ResolvedCommand::new(["java"], ["-Dfoo=bar", "-jar", "app.jar"]);
        assert!(resolved.contains("-jar"));
        assert!(resolved.contains("java"));
        assert!(!resolved.contains("app"));
        assert!(ResolvedCommand::default().is_empty());
    }

    #[test]
    fn test_record_merge_keeps_first_pod_commands() {
        let mut record = WorkloadRecord::from(finding("web-1", "app", "app:1.0"));
        let mut second = finding("web-2", "app", "app:1.0");
        second.images.insert("sidecar".to_string(), "sidecar:2".to_string());
        record.merge(second);

        assert_eq!(record.pod_names, vec!["web-1", "web-2"]);
        assert_eq!(record.images.len(), 2);
        assert_eq!(
            record.containers["app"],
            ResolvedCommand::new(["java", "-jar", "web-1"], [])
        );
    }
}
