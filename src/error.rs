use thiserror::Error;

/// Failure kinds raised by the scan and fix phases that callers may need to tell apart.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FixError {
    #[error(
        "ambiguous start command in pod {pod} container {container}: {} candidates found",
        candidates.len()
    )]
    AmbiguousStartCommand {
        pod: String,
        container: String,
        candidates: Vec<String>,
    },

    #[error("command in container wrote to stderr: {0}")]
    ExecStderr(String),

    #[error("no modification made to workload {workload}")]
    NoModification { workload: String },

    #[error("workload {workload} has no pod template spec")]
    MissingPodTemplate { workload: String },
}
