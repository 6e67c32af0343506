//! Host-side asynchronous work that a suspended module is waiting on.
//!
//! Backends hand back an [`Op`]: either an answer they already have, or a
//! future. Futures run on a single-threaded [`EventLoop`]; their outcomes
//! queue up until the driver feeds them back into the suspension engine.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use futures::executor::LocalPool;
use futures::future::{FutureExt, LocalBoxFuture};
use futures::task::{LocalSpawnExt, SpawnError};

use crate::error::BackendError;
use crate::stdio::{BackendHandle, Metadata};

/// The result shapes of a pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
  Opened(BackendHandle),
  /// A chunk of file data, or `None` at end of file.
  Chunk(Option<Vec<u8>>),
  Written(usize),
  Closed,
  Removed,
  Stat(Metadata),
}

/// What a suspended host function receives after the rewind.
pub type Outcome = Result<Completion, BackendError>;

/// A backend answer that is either available now or later.
pub enum Op<T> {
  Ready(Result<T, BackendError>),
  Pending(LocalBoxFuture<'static, Result<T, BackendError>>),
}

impl<T: 'static> Op<T> {
  pub fn ready(result: Result<T, BackendError>) -> Self {
    Op::Ready(result)
  }

  pub fn pending<Fut>(future: Fut) -> Self
  where
    Fut: Future<Output = Result<T, BackendError>> + 'static,
  {
    Op::Pending(future.boxed_local())
  }

  pub fn is_ready(&self) -> bool {
    matches!(self, Op::Ready(_))
  }

  /// Lifts the value into a [`Completion`].
  pub fn map(
    self,
    f: impl FnOnce(T) -> Completion + 'static,
  ) -> Op<Completion> {
    match self {
      Op::Ready(result) => Op::Ready(result.map(f)),
      Op::Pending(future) => Op::Pending(future.map(|result| result.map(f)).boxed_local()),
    }
  }
}

impl<T> std::fmt::Debug for Op<T> {
  fn fmt(
    &self,
    f: &mut std::fmt::Formatter<'_>,
  ) -> std::fmt::Result {
    match self {
      Op::Ready(_) => f.write_str("Op::Ready"),
      Op::Pending(_) => f.write_str("Op::Pending"),
    }
  }
}

/// Drives spawned operations and collects their outcomes in completion
/// order.
pub struct EventLoop {
  pool: LocalPool,
  completed: Rc<RefCell<VecDeque<Outcome>>>,
  in_flight: Rc<Cell<usize>>,
}

impl EventLoop {
  pub fn new() -> Self {
    Self {
      pool: LocalPool::new(),
      completed: Rc::new(RefCell::new(VecDeque::new())),
      in_flight: Rc::new(Cell::new(0)),
    }
  }

  pub fn spawn(
    &self,
    future: LocalBoxFuture<'static, Outcome>,
  ) -> Result<(), SpawnError> {
    let completed = Rc::clone(&self.completed);
    let in_flight = Rc::clone(&self.in_flight);

    self.in_flight.set(self.in_flight.get() + 1);

    let task = async move {
      let outcome = future.await;
      in_flight.set(in_flight.get() - 1);
      completed.borrow_mut().push_back(outcome);
    };

    self.pool.spawner().spawn_local(task).inspect_err(|_| {
      self.in_flight.set(self.in_flight.get() - 1);
    })
  }

  /// Polls every task until none can make progress without blocking.
  pub fn run_until_stalled(&mut self) {
    self.pool.run_until_stalled();
  }

  /// Blocks until every spawned task has finished.
  ///
  /// A task waiting on something only this thread can provide never
  /// finishes; drive such work with [`run_until_stalled`](Self::run_until_stalled).
  pub fn wait(&mut self) {
    self.pool.run();
  }

  pub fn next_completion(&self) -> Option<Outcome> {
    self.completed.borrow_mut().pop_front()
  }

  pub fn has_completions(&self) -> bool {
    !self.completed.borrow().is_empty()
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.get()
  }

  /// No task is running and no outcome is waiting to be consumed.
  pub fn is_idle(&self) -> bool {
    self.in_flight() == 0 && !self.has_completions()
  }
}

impl Default for EventLoop {
  fn default() -> Self {
    Self::new()
  }
}
