use crate::api::DubApi;
use crate::state::{LifecycleState, Project};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Narrow seam for the refresh loop, mirroring `poller::TaskSource`.
#[async_trait]
pub trait ProjectSource: Send + Sync {
    async fn fetch_project(&self, id: &str) -> Result<Project>;
}

#[async_trait]
impl ProjectSource for dyn DubApi {
    async fn fetch_project(&self, id: &str) -> Result<Project> {
        self.get_project(id).await
    }
}

/// Client-side view of one project's lifecycle. The server is the only
/// writer of lifecycle transitions; this tracker adopts server reads and
/// never regresses, and carries the single optimistic exception
/// (`force_analyzing`, written once right after creation).
#[derive(Debug)]
pub struct ProjectTracker {
    project: Project,
}

impl ProjectTracker {
    pub fn new(project: Project) -> Self {
        Self { project }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn state(&self) -> LifecycleState {
        self.project.state
    }

    /// Adopts an authoritative read. A read showing an earlier stage than
    /// already observed keeps the observed stage (refreshes race with
    /// background jobs); the non-lifecycle fields are adopted either way.
    pub fn observe(&mut self, fresh: Project) -> LifecycleState {
        if fresh.id != self.project.id {
            warn!(
                "ignoring project read for {} while tracking {}",
                fresh.id, self.project.id
            );
            return self.state();
        }
        if fresh.state < self.project.state {
            debug!(
                "project {}: server read {:?} behind observed {:?}, keeping observed",
                self.project.id, fresh.state, self.project.state
            );
            self.project.name = fresh.name;
            self.project.created_at = fresh.created_at;
        } else {
            self.project = fresh;
        }
        self.state()
    }

    /// The one optimistic lifecycle write: a just-created project is
    /// shown as analyzing before the first confirmed read. Returns false
    /// when the project is past `Created`.
    pub fn force_analyzing(&mut self) -> bool {
        if self.project.state == LifecycleState::Created {
            self.project.state = LifecycleState::Analyzing;
            true
        } else {
            false
        }
    }

    /// Rolls `force_analyzing` back when the analysis submission itself
    /// failed, so the tracker never shows a stage the server was never
    /// asked to enter.
    pub fn revert_analyzing(&mut self) {
        if self.project.state == LifecycleState::Analyzing {
            self.project.state = LifecycleState::Created;
        }
    }
}

#[derive(Debug)]
pub struct WatchHandle {
    handle: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Re-fetches authoritative project state on a fixed interval (its own
/// cadence, independent of task polling) until the project reaches a
/// terminal stage. A failed refresh is logged and the loop keeps going.
pub fn watch<A>(
    api: Arc<A>,
    tracker: Arc<Mutex<ProjectTracker>>,
    interval: Duration,
) -> WatchHandle
where
    A: ProjectSource + ?Sized + 'static,
{
    let handle = tokio::spawn(async move {
        loop {
            let id = {
                let tracker = tracker.lock().unwrap();
                if tracker.state().is_terminal() {
                    debug!("project {} terminal, refresh loop done", tracker.project().id);
                    return;
                }
                tracker.project().id.clone()
            };

            match api.fetch_project(&id).await {
                Ok(fresh) => {
                    tracker.lock().unwrap().observe(fresh);
                }
                Err(e) => warn!("project {} refresh failed: {:#}", id, e),
            }

            tokio::time::sleep(interval).await;
        }
    });
    WatchHandle { handle }
}
