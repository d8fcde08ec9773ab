//! The match worker: discovery, gating and matching on a dedicated thread.
//!
//! The control loop talks to it only through [`MatchWorkerRequest`] and
//! [`MatchWorkerResponse`] messages correlated by id. The worker keeps no
//! state between requests.

mod handler;
mod types;

pub use handler::handle_match_worker_request;
pub use types::{
    MatchWorkerRequest, MatchWorkerResponse, MatchWorkerResult, MatchWorkerSearchOptions,
    OrphanCandidate, ResolvedMatch,
};

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::BoardError;
use crate::logs::LogDirectories;
use crate::matcher::ScrollbackSource;

/// Requests allowed to queue before submissions are refused
const REQUEST_QUEUE_DEPTH: usize = 2;

/// Handle to the worker thread
pub struct MatchWorker {
    requests: mpsc::Sender<MatchWorkerRequest>,
    responses: mpsc::UnboundedReceiver<MatchWorkerResponse>,
    thread: Option<JoinHandle<()>>,
}

impl MatchWorker {
    pub fn spawn(
        directories: LogDirectories,
        source: Arc<dyn ScrollbackSource>,
    ) -> Result<Self, BoardError> {
        let (request_tx, mut request_rx) = mpsc::channel::<MatchWorkerRequest>(REQUEST_QUEUE_DEPTH);
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name("match-worker".to_string())
            .spawn(move || {
                info!("match worker started");
                while let Some(request) = request_rx.blocking_recv() {
                    if request.id.is_empty() {
                        debug!("dropping match request without id");
                        continue;
                    }
                    let response = handle_match_worker_request(&request, &directories, source.as_ref());
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
                info!("match worker stopped");
            })?;

        Ok(Self {
            requests: request_tx,
            responses: response_rx,
            thread: Some(thread),
        })
    }

    /// Queue a request without waiting; refused while the worker is backed up
    pub fn try_submit(&self, request: MatchWorkerRequest) -> Result<(), BoardError> {
        self.requests.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BoardError::WorkerUnavailable("request queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                BoardError::WorkerUnavailable("worker stopped".to_string())
            }
        })
    }

    /// Next response from the worker
    pub async fn recv(&mut self) -> Option<MatchWorkerResponse> {
        self.responses.recv().await
    }
}

impl Drop for MatchWorker {
    fn drop(&mut self) {
        // Dropping the request sender ends the worker loop; the thread is not joined
        self.responses.close();
        drop(self.thread.take());
    }
}
