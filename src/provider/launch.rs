//! Bounded per-role launch pool
//!
//! Role groups launch concurrently; within a group a semaphore bounds the
//! number of in-flight create calls and permits are handed out in host
//! index order. The first failure, or the caller's cancellation, stops new
//! launches across all groups. Calls already in flight run to completion.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeployFailure, DeployReport, InstanceHandle};
use crate::config::NodeRole;
use crate::error::ProviderError;
use crate::{Error, Result};

/// In-flight launches per role group when not configured
pub const DEFAULT_LAUNCH_CONCURRENCY: usize = 4;

/// One planned launch
#[derive(Clone, Debug)]
pub struct LaunchSlot<T> {
    /// Role of the instance
    pub role: NodeRole,
    /// Host index within the role
    pub host_index: u32,
    /// Backend-specific launch request
    pub request: T,
}

enum SlotOutcome {
    Launched(InstanceHandle),
    Failed(ProviderError),
    Abandoned,
}

/// Worker pool issuing launches with bounded concurrency per role
#[derive(Clone, Copy, Debug)]
pub struct LaunchPool {
    concurrency: usize,
}

impl Default for LaunchPool {
    fn default() -> Self {
        Self::new(DEFAULT_LAUNCH_CONCURRENCY)
    }
}

impl LaunchPool {
    /// Pool allowing `concurrency` in-flight launches per role (at least one)
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Launch every slot and aggregate the outcome
    ///
    /// `launch` receives each slot's role, host index and request.
    ///
    /// Returns `Error::Deploy` if any launch failed and `Error::Cancelled`
    /// if `cancel` fired before every slot was issued.
    pub async fn run<T, F, Fut>(
        &self,
        slots: Vec<LaunchSlot<T>>,
        cancel: &CancellationToken,
        launch: F,
    ) -> Result<DeployReport>
    where
        T: Send,
        F: Fn(NodeRole, u32, T) -> Fut + Sync,
        Fut: Future<Output = std::result::Result<InstanceHandle, ProviderError>> + Send,
    {
        let total = slots.len();
        let stop = cancel.child_token();

        let mut groups: Vec<Vec<LaunchSlot<T>>> = NodeRole::ALL.iter().map(|_| Vec::new()).collect();
        for slot in slots {
            let group = NodeRole::ALL
                .iter()
                .position(|role| *role == slot.role)
                .unwrap_or_default();
            groups[group].push(slot);
        }

        let group_futures = groups.into_iter().filter(|g| !g.is_empty()).map(|mut group| {
            group.sort_by_key(|slot| slot.host_index);
            self.run_group(group, &stop, &launch)
        });
        let outcomes: Vec<SlotOutcome> = join_all(group_futures).await.into_iter().flatten().collect();

        let mut launched = Vec::new();
        let mut failed = Vec::new();
        let mut abandoned = 0;
        for outcome in outcomes {
            match outcome {
                SlotOutcome::Launched(handle) => launched.push(handle),
                SlotOutcome::Failed(err) => failed.push(err),
                SlotOutcome::Abandoned => abandoned += 1,
            }
        }

        if !failed.is_empty() {
            warn!(
                launched = launched.len(),
                failed = failed.len(),
                abandoned,
                "deploy stopped after launch failure"
            );
            return Err(Error::Deploy(DeployFailure {
                launched,
                failed,
                abandoned,
            }));
        }
        if abandoned > 0 {
            warn!(completed = launched.len(), abandoned, "deploy cancelled");
            return Err(Error::Cancelled {
                completed: launched.len(),
                abandoned,
            });
        }

        info!(launched = total, "all launches completed");
        Ok(DeployReport { launched })
    }

    async fn run_group<T, F, Fut>(
        &self,
        group: Vec<LaunchSlot<T>>,
        stop: &CancellationToken,
        launch: &F,
    ) -> Vec<SlotOutcome>
    where
        F: Fn(NodeRole, u32, T) -> Fut,
        Fut: Future<Output = std::result::Result<InstanceHandle, ProviderError>>,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let slots = group.into_iter().map(|slot| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = stop.cancelled() => return SlotOutcome::Abandoned,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return SlotOutcome::Abandoned,
                    },
                };
                if stop.is_cancelled() {
                    return SlotOutcome::Abandoned;
                }

                debug!(role = %slot.role, host_index = slot.host_index, "launching");
                match launch(slot.role, slot.host_index, slot.request).await {
                    Ok(handle) => {
                        info!(
                            role = %slot.role,
                            host_index = slot.host_index,
                            id = %handle.id,
                            "launched instance"
                        );
                        SlotOutcome::Launched(handle)
                    }
                    Err(err) => {
                        let err = match err.slot {
                            Some(_) => err,
                            None => err.with_slot(slot.role, slot.host_index),
                        };
                        warn!(error = %err, "launch failed, stopping further launches");
                        stop.cancel();
                        SlotOutcome::Failed(err)
                    }
                }
            }
        });
        join_all(slots).await
    }
}
