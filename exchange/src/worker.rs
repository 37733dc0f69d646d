use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::info;

use crate::error::{ExchangeError, ExchangeResult};
use crate::matcher::match_reqs;
use crate::requests::XreqStore;
use crate::shutdown::ShutdownFlag;

#[derive(Clone, Copy, Debug)]
pub enum MatcherCommand {
    /// Run one matching round at the given epoch-aligned block time against
    /// a frozen maximum request number.
    Start { block_time: u64, max_xreqnum: u64 },
    Shutdown,
}

/// Owns the matching worker thread. The confirmation thread drives it with a
/// bounded command channel and waits for the round-complete signal before
/// consuming the round's pending matches; there is always at most one round
/// in flight.
pub struct MatchWorker {
    cmd_tx: Sender<MatcherCommand>,
    idle_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl MatchWorker {
    pub fn spawn(store: Arc<XreqStore>, shutdown: Arc<ShutdownFlag>) -> Self {
        let (cmd_tx, cmd_rx) = bounded::<MatcherCommand>(1);
        let (idle_tx, idle_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("obol-matcher".into())
            .spawn(move || {
                info!("matching worker started");
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        MatcherCommand::Start {
                            block_time,
                            max_xreqnum,
                        } => {
                            if shutdown.is_set() {
                                break;
                            }
                            match_reqs(&store, block_time, max_xreqnum, &shutdown);
                            if idle_tx.send(()).is_err() {
                                break;
                            }
                        }
                        MatcherCommand::Shutdown => break,
                    }
                }
                info!("matching worker stopped");
            })
            .expect("failed to spawn matching worker");

        MatchWorker {
            cmd_tx,
            idle_rx,
            handle: Some(handle),
        }
    }

    /// Kicks off the next matching round. Must be paired with exactly one
    /// `wait_idle` before the following round starts.
    pub fn start_round(&self, block_time: u64, max_xreqnum: u64) -> ExchangeResult<()> {
        self.cmd_tx
            .send(MatcherCommand::Start {
                block_time,
                max_xreqnum,
            })
            .map_err(|_| ExchangeError::WorkerStopped)
    }

    /// Blocks until the in-flight round finishes.
    pub fn wait_idle(&self) -> ExchangeResult<()> {
        self.idle_rx.recv().map_err(|_| ExchangeError::WorkerStopped)
    }

    pub fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(MatcherCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MatchWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Xreq, XreqKind};

    #[test]
    fn worker_round_trip() {
        let store = Arc::new(XreqStore::new());
        let shutdown = Arc::new(ShutdownFlag::new());
        {
            let mut t = store.write();
            let mut buy = Xreq::new(XreqKind::SimpleBuy);
            buy.seqnum = 1;
            buy.xreqnum = 1;
            buy.objid[0] = 1;
            buy.min_amount = 1;
            buy.max_amount = 10;
            buy.open_amount = 10;
            buy.net_rate_required = 0.002;
            buy.open_rate_required = 0.002;
            buy.expire_time = u64::MAX;
            buy.recalc_time = crate::types::RecalcTime::Next;
            let mut sell = buy.clone();
            sell.kind = XreqKind::SimpleSell;
            sell.seqnum = 2;
            sell.xreqnum = 2;
            sell.objid[0] = 2;
            sell.net_rate_required = 0.001;
            sell.open_rate_required = 0.001;
            t.insert(buy);
            t.insert(sell);
        }

        let worker = MatchWorker::spawn(Arc::clone(&store), Arc::clone(&shutdown));
        worker.start_round(600, 2).unwrap();
        worker.wait_idle().unwrap();

        assert!(store.read().next_pending_match().is_some());
    }

    #[test]
    fn shutdown_unblocks_waiters() {
        let store = Arc::new(XreqStore::new());
        let shutdown = Arc::new(ShutdownFlag::new());
        let mut worker = MatchWorker::spawn(store, shutdown);
        worker.shutdown();
        assert!(worker.start_round(0, 0).is_err());
    }
}
