//! Controller side of the worker bridge
//!
//! Each call gets a fresh correlation id and parks a oneshot sender in the
//! pending table until the worker answers with the same id. Events never
//! touch the pending table and go straight to the listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{PipelineError, Result};
use crate::event::WorkerEvent;
use crate::worker::{FromWorker, Request, WorkerMessage, WorkerResponse};

type PendingResult = Result<Option<WorkerResponse>>;
type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<PendingResult>>>>;

pub struct AsyncWorker {
  requests: mpsc::UnboundedSender<Request>,
  pending: PendingTable,
  next_id: AtomicU64,
  dispatcher: JoinHandle<()>,
}

impl AsyncWorker {
  /// Start dispatching worker output. Must be called inside a tokio runtime.
  pub fn new<F>(
    requests: mpsc::UnboundedSender<Request>,
    responses: mpsc::UnboundedReceiver<FromWorker>,
    on_event: F,
  ) -> Self
  where
    F: Fn(WorkerEvent) + Send + 'static,
  {
    let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
    let dispatcher = tokio::spawn(dispatch(responses, pending.clone(), on_event));
    Self {
      requests,
      pending,
      next_id: AtomicU64::new(1),
      dispatcher,
    }
  }

  /// Send a request and wait for its response
  pub async fn post(&self, message: WorkerMessage) -> Result<Option<WorkerResponse>> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    self
      .pending
      .lock()
      .map_err(|_| PipelineError::LockPoisoned)?
      .insert(id, tx);

    if self.requests.send(Request { id, message }).is_err() {
      self
        .pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
      return Err(PipelineError::WorkerTerminated);
    }

    rx.await.unwrap_or(Err(PipelineError::WorkerTerminated))
  }

  pub fn pending_requests(&self) -> usize {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
  }
}

impl Drop for AsyncWorker {
  fn drop(&mut self) {
    self.dispatcher.abort();
  }
}

async fn dispatch<F>(mut responses: mpsc::UnboundedReceiver<FromWorker>, pending: PendingTable, on_event: F)
where
  F: Fn(WorkerEvent) + Send + 'static,
{
  while let Some(message) = responses.recv().await {
    match message {
      FromWorker::Event(event) => on_event(event),
      FromWorker::Response { id, response, error } => {
        let sender = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        let Some(sender) = sender else {
          tracing::warn!(target: "smelter", id, "Response for unknown request");
          continue;
        };
        let result = match error {
          Some(message) => Err(PipelineError::Worker(message)),
          None => Ok(response),
        };
        let _ = sender.send(result);
      }
    }
  }

  // Worker is gone, fail everything still waiting
  let senders: Vec<_> = pending
    .lock()
    .unwrap_or_else(PoisonError::into_inner)
    .drain()
    .map(|(_, sender)| sender)
    .collect();
  for sender in senders {
    let _ = sender.send(Err(PipelineError::WorkerTerminated));
  }
}
