//! Broadcast `ask` session: tracks how many results each branch (a child
//! bridge or the local node set) still owes, and completes once every
//! branch has said `fin` and delivered at least as many results as it
//! promised (spec §4.9).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::messages::NodeId;
use conduit_rpc::WireValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchStatus {
    Pending,
    FinReceived,
}

struct Branch {
    status: BranchStatus,
    expected_results: u32,
    received_results: u32,
}

impl Branch {
    fn new() -> Self {
        Self {
            status: BranchStatus::Pending,
            expected_results: 0,
            received_results: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.status == BranchStatus::FinReceived && self.received_results >= self.expected_results
    }
}

/// One in-flight broadcast `ask`, fanned out over `branches` distinct
/// outgoing directions.
pub struct AskSession {
    branches: Mutex<HashMap<String, Branch>>,
    results: Mutex<Vec<(NodeId, Result<WireValue, String>)>>,
    complete_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl AskSession {
    /// Start tracking a session across `branch_ids`, returning the session
    /// and a receiver that fires once every branch has completed.
    pub fn new(branch_ids: impl IntoIterator<Item = String>) -> (Arc<Self>, oneshot::Receiver<()>) {
        let branches = branch_ids.into_iter().map(|id| (id, Branch::new())).collect();
        let (tx, rx) = oneshot::channel();
        let session = Arc::new(Self {
            branches: Mutex::new(branches),
            results: Mutex::new(Vec::new()),
            complete_tx: Mutex::new(Some(tx)),
        });
        if session.is_complete() {
            session.signal_complete();
        }
        (session, rx)
    }

    /// Record one result delivered on `branch_id`.
    pub fn ack_result(&self, branch_id: &str, node_id: NodeId, result: Result<WireValue, String>) {
        self.results.lock().push((node_id, result));
        if let Some(branch) = self.branches.lock().get_mut(branch_id) {
            branch.received_results += 1;
        }
        self.maybe_complete();
    }

    /// Record that `branch_id` has finished sending results and will send
    /// `total_results` in all.
    pub fn ack_fin(&self, branch_id: &str, total_results: u32) {
        if let Some(branch) = self.branches.lock().get_mut(branch_id) {
            branch.status = BranchStatus::FinReceived;
            branch.expected_results = total_results;
        }
        self.maybe_complete();
    }

    /// A bridge going away mid-session must not hang the caller forever:
    /// treat it as `ack_fin{total_results: 0}` for every branch routed
    /// through it (spec §4.9 "disconnect as implicit fin").
    pub fn on_bridge_disconnect(&self, branch_id: &str) {
        self.ack_fin(branch_id, 0);
    }

    fn is_complete(&self) -> bool {
        self.branches.lock().values().all(Branch::is_done)
    }

    fn maybe_complete(&self) {
        if self.is_complete() {
            self.signal_complete();
        }
    }

    fn signal_complete(&self) {
        if let Some(tx) = self.complete_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn results(&self) -> Vec<(NodeId, Result<WireValue, String>)> {
        self.results.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_once_every_branch_fins_with_enough_results() {
        let (session, done) = AskSession::new(["local".to_string(), "child-a".to_string()]);

        session.ack_result("local", "n1".into(), Ok(WireValue::Int(1)));
        session.ack_fin("local", 1);

        session.ack_result("child-a", "n2".into(), Ok(WireValue::Int(2)));
        session.ack_fin("child-a", 1);

        done.await.unwrap();
        let mut results = session.results();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn bridge_disconnect_unblocks_the_session_with_zero_results() {
        let (session, done) = AskSession::new(["local".to_string(), "child-a".to_string()]);
        session.ack_fin("local", 0);
        session.on_bridge_disconnect("child-a");
        done.await.unwrap();
        assert!(session.results().is_empty());
    }

    #[tokio::test]
    async fn empty_branch_set_completes_immediately() {
        let (_session, done) = AskSession::new(Vec::<String>::new());
        done.await.unwrap();
    }
}
