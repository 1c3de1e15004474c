use anyhow::Result;
use chrono::Local;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{EnvVar, PodSpec};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, ClusterObject};
use crate::error::FixError;
use crate::workload::{ResolvedCommand, WorkloadKind, WorkloadRecord};

pub static NO_LOOKUPS_FLAG: &str = "-Dlog4j2.formatMsgNoLookups=true";
pub static NO_LOOKUPS_ENV: &str = "FORMAT_MESSAGES_PATTERN_DISABLE_LOOKUPS";
pub static FIXED_AT_ANNOTATION: &str = "fix_log4j_at";
static JAVA: &str = "java";

/// Workload resources whose pod template can be rewritten and submitted back.
pub trait PatchTarget: ClusterObject {
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;
}

impl PatchTarget for Deployment {
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

impl PatchTarget for StatefulSet {
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

impl PatchTarget for DaemonSet {
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandField {
    Command,
    Args,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unpatchable {
    /// Neither a command nor a `java` first argument is known.
    MissingCommand,
    /// The entrypoint is not a JVM.
    NotJava,
    /// A bare `java` command with nothing to place the flag before.
    NoArguments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    AlreadyFixed,
    Rewritten {
        field: CommandField,
        value: Vec<String>,
    },
    Skipped(Unpatchable),
}

/// How one container's start line is rewritten to carry the no-lookups flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPatchPlan {
    pub original: ResolvedCommand,
    pub outcome: PatchOutcome,
}

impl ContainerPatchPlan {
    pub fn new(original: &ResolvedCommand) -> Self {
        let outcome = plan_outcome(original);
        Self {
            original: original.clone(),
            outcome,
        }
    }

    /// The start line after the plan is applied.
    pub fn rewritten(&self) -> ResolvedCommand {
        let mut result = self.original.clone();
        if let PatchOutcome::Rewritten { field, value } = &self.outcome {
            match field {
                CommandField::Command => result.command = value.clone(),
                CommandField::Args => result.args = value.clone(),
            }
        }
        result
    }
}

fn plan_outcome(resolved: &ResolvedCommand) -> PatchOutcome {
    if resolved.contains(NO_LOOKUPS_FLAG) {
        return PatchOutcome::AlreadyFixed;
    }

    // `args: [java, ...]` without a command
    if resolved.args.first().map(String::as_str) == Some(JAVA) {
        return PatchOutcome::Rewritten {
            field: CommandField::Args,
            value: insert_at(&resolved.args, NO_LOOKUPS_FLAG, 1),
        };
    }

    match resolved.command.first().map(String::as_str) {
        None => PatchOutcome::Skipped(Unpatchable::MissingCommand),
        Some(first) if first != JAVA => PatchOutcome::Skipped(Unpatchable::NotJava),
        Some(_) if resolved.command.len() > 1 => PatchOutcome::Rewritten {
            field: CommandField::Command,
            value: insert_at(&resolved.command, NO_LOOKUPS_FLAG, 1),
        },
        Some(_) if !resolved.args.is_empty() => PatchOutcome::Rewritten {
            field: CommandField::Args,
            value: insert_at(&resolved.args, NO_LOOKUPS_FLAG, 0),
        },
        Some(_) => PatchOutcome::Skipped(Unpatchable::NoArguments),
    }
}

fn insert_at(items: &[String], item: &str, index: usize) -> Vec<String> {
    let mut result = items.to_vec();
    result.insert(index.min(result.len()), item.to_string());
    result
}

/// Rewrites every flagged container of `spec` in place and returns how many changed.
pub fn patch_pod_spec(record: &WorkloadRecord, spec: &mut PodSpec) -> Result<usize, FixError> {
    let workload = record.identity.to_string();
    let mut modified = 0;

    for container in spec.containers.iter_mut() {
        let Some(resolved) = record.containers.get(&container.name) else {
            continue;
        };
        info!(
            workload = %workload,
            container = %container.name,
            command = ?resolved.command,
            args = ?resolved.args,
            "Start modifying spec"
        );

        let plan = ContainerPatchPlan::new(resolved);
        match &plan.outcome {
            PatchOutcome::AlreadyFixed => {
                info!(workload = %workload, container = %container.name, "Already fixed, skip");
            }
            PatchOutcome::Skipped(reason) => {
                warn!(
                    workload = %workload,
                    container = %container.name,
                    command = ?resolved.command,
                    reason = ?reason,
                    "Container cannot be patched, skip"
                );
            }
            PatchOutcome::Rewritten { field, value } => {
                info!(
                    workload = %workload,
                    container = %container.name,
                    field = ?field,
                    old = ?plan.original,
                    new = ?plan.rewritten(),
                    "Modify start command"
                );
                match field {
                    CommandField::Command => container.command = Some(value.clone()),
                    CommandField::Args => container.args = Some(value.clone()),
                }
                // Appended rather than replaced; the runtime keeps the last declaration.
                let env = container.env.as_mut().filter(|env| {
                    env.iter().any(|e| e.name == NO_LOOKUPS_ENV)
                });
                if let Some(env) = env {
                    env.push(EnvVar {
                        name: NO_LOOKUPS_ENV.to_string(),
                        value: Some("true".to_string()),
                        ..EnvVar::default()
                    });
                    info!(
                        workload = %workload,
                        container = %container.name,
                        env = NO_LOOKUPS_ENV,
                        "Add env"
                    );
                }
                modified += 1;
            }
        }
    }

    for name in record.containers.keys() {
        if !spec.containers.iter().any(|c| &c.name == name) {
            warn!(workload = %workload, container = %name, "Container not found in pod template");
        }
    }

    if modified == 0 {
        return Err(FixError::NoModification { workload });
    }
    Ok(modified)
}

fn fixed_at_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    Applied { containers: usize },
    DryRun { containers: usize },
    Unsupported(String),
}

#[derive(Debug, Clone, Default)]
pub struct Patcher {
    pub dry_run: bool,
}

impl Patcher {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub async fn fix<C: ClusterApi>(
        &self,
        cluster: &C,
        record: &WorkloadRecord,
    ) -> Result<FixOutcome> {
        match record.identity.workload_kind() {
            WorkloadKind::Deployment => self.fix_workload::<C, Deployment>(cluster, record).await,
            WorkloadKind::DaemonSet => self.fix_workload::<C, DaemonSet>(cluster, record).await,
            WorkloadKind::StatefulSet => self.fix_workload::<C, StatefulSet>(cluster, record).await,
            WorkloadKind::Unsupported(kind) => {
                warn!(
                    workload = %record.identity,
                    kind = %kind,
                    "Workload type not supported, skip"
                );
                Ok(FixOutcome::Unsupported(kind))
            }
        }
    }

    async fn fix_workload<C: ClusterApi, K: PatchTarget>(
        &self,
        cluster: &C,
        record: &WorkloadRecord,
    ) -> Result<FixOutcome> {
        let identity = &record.identity;
        let mut object: K = cluster
            .get(&identity.namespace, &identity.name)
            .await
            .inspect_err(|e| error!(workload = %identity, error = ?e, "Get workload failed"))?;

        let spec = object
            .pod_spec_mut()
            .ok_or_else(|| FixError::MissingPodTemplate {
                workload: identity.to_string(),
            })?;
        let containers = patch_pod_spec(record, spec)
            .inspect_err(|e| warn!(workload = %identity, error = %e, "Modify failed"))?;

        object
            .annotations_mut()
            .insert(FIXED_AT_ANNOTATION.to_string(), fixed_at_timestamp());

        if self.dry_run {
            info!(workload = %identity, containers, "Dry run, not updating {}", K::kind_name());
            debug!("Patched object {:?}", object);
            return Ok(FixOutcome::DryRun { containers });
        }

        cluster
            .replace(&identity.namespace, &identity.name, &object)
            .await
            .inspect_err(|e| error!(workload = %identity, error = ?e, "Update failed"))?;
        info!(workload = %identity, containers, "Update succeeded");
        Ok(FixOutcome::Applied { containers })
    }
}
