use crate::error::FaultResult;
use crate::permissions::{AccessContext, Principal};
use async_trait::async_trait;
use log::{error, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Before/after hooks run by tenant scripts.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Whether any of `events` (e.g. `delete.before`) has a trigger for the object.
    async fn trigger_exists(&self, principal: &Principal, object: &str, events: &[&str]) -> bool;

    /// Run the trigger for `event`. Before-triggers may edit `document`.
    async fn trigger_script(&self, event: &str, ac: &AccessContext, document: &mut Value) -> FaultResult<()>;
}

/// No scripts installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScriptRuntime;

#[async_trait]
impl ScriptRuntime for NoScriptRuntime {
    async fn trigger_exists(&self, _principal: &Principal, _object: &str, _events: &[&str]) -> bool {
        false
    }

    async fn trigger_script(&self, _event: &str, _ac: &AccessContext, _document: &mut Value) -> FaultResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReapOperation {
    Reap,
    CascadeDelete,
}

/// Background cleanup request for soft-deleted documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReapJob {
    pub op: ReapOperation,
    pub org: String,
    pub object: String,
    /// Soft-deleted document; `None` reaps every marked document of the object.
    pub subject: Option<String>,
    /// Cascading properties to follow, for cascade deletes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
}

/// Fire-and-forget queue for reap and cascade jobs.
pub trait ReaperQueue: Send + Sync {
    fn enqueue(&self, job: ReapJob);
}

/// Sends jobs over an unbounded tokio channel to a worker task.
#[derive(Debug, Clone)]
pub struct ChannelReaperQueue {
    sender: mpsc::UnboundedSender<ReapJob>,
}

impl ChannelReaperQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReapJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ReaperQueue for ChannelReaperQueue {
    fn enqueue(&self, job: ReapJob) {
        trace!("queueing {:?} for {}", job.op, job.object);
        if let Err(failed) = self.sender.send(job) {
            error!("reaper queue closed, dropping job for {}", failed.0.object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_reach_the_worker() {
        let (queue, mut receiver) = ChannelReaperQueue::new();
        queue.enqueue(ReapJob {
            op: ReapOperation::Reap,
            org: "org-1".to_string(),
            object: "c_widget".to_string(),
            subject: None,
            properties: Vec::new(),
        });
        let job = receiver.recv().await.expect("job");
        assert_eq!(job.op, ReapOperation::Reap);
        assert_eq!(serde_json::to_value(&job).expect("json")["op"], "reap");
    }

    #[test]
    fn closed_queues_do_not_panic() {
        let (queue, receiver) = ChannelReaperQueue::new();
        drop(receiver);
        queue.enqueue(ReapJob {
            op: ReapOperation::CascadeDelete,
            org: "org-1".to_string(),
            object: "c_widget".to_string(),
            subject: Some("a".to_string()),
            properties: vec!["c_children".to_string()],
        });
    }
}
