use anyhow::Result;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ListParams;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

use crate::cluster::{ClusterApi, Page};

const DEFAULT_LIST_LIMIT: u32 = 50;
const DEFAULT_LIST_ATTEMPTS: u32 = 3;

/// How often and how patiently a page fetch is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_LIST_ATTEMPTS,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Uniformly random delay in `[min_backoff, max_backoff]`, drawn per retry.
    fn backoff(&self) -> Duration {
        let min = self.min_backoff.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        if max <= min {
            return self.min_backoff;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    error!("[{}] {} failed: {:#}", attempt, what, e);
                    tokio::time::sleep(self.backoff()).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("[{}] {} failed, giving up: {:#}", attempt, what, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Lists namespaces and pods, following continuation tokens page by page.
#[derive(Debug, Clone)]
pub struct Lister {
    pub page_size: u32,
    pub retry: RetryPolicy,
}

impl Default for Lister {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_LIST_LIMIT,
            retry: RetryPolicy::default(),
        }
    }
}

impl Lister {
    pub async fn list_namespaces<C: ClusterApi>(&self, cluster: &C) -> Result<Vec<Namespace>> {
        self.list_all("list namespaces", |params| async move {
            cluster.list_namespaces(&params).await
        })
        .await
    }

    pub async fn list_pods<C: ClusterApi>(&self, cluster: &C, namespace: &str) -> Result<Vec<Pod>> {
        let what = format!("list pods in namespace {}", namespace);
        self.list_all(&what, |params| async move {
            cluster.list_pods(namespace, &params).await
        })
        .await
    }

    async fn list_all<T, F, Fut>(&self, what: &str, mut fetch_page: F) -> Result<Vec<T>>
    where
        F: FnMut(ListParams) -> Fut,
        Fut: Future<Output = Result<Page<T>>>,
    {
        let mut params = ListParams::default().limit(self.page_size);
        let mut items: Option<Vec<T>> = None;

        loop {
            let page = self
                .retry
                .run(what, || fetch_page(params.clone()))
                .await?;

            let collected = items.get_or_insert_with(|| {
                let remaining = page.remaining_item_count.unwrap_or(0).max(0) as usize;
                Vec::with_capacity(page.items.len() + remaining)
            });
            collected.extend(page.items);

            let token = match page.continue_token {
                Some(token) if page.remaining_item_count.is_none_or(|n| n > 0) => token,
                _ => break,
            };
            debug!(
                "{}: continue {}, remaining {:?}",
                what, token, page.remaining_item_count
            );
            params = params.continue_token(&token);
        }

        Ok(items.unwrap_or_default())
    }
}
