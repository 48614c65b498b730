use std::cell::{Ref, RefCell, RefMut};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::tree::Tree;

pub const DISPATCH_THREAD_NAME: &str = "fsmirror-dispatch";

type Task = Box<dyn FnOnce(&DispatchContext) + Send + 'static>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch executor is shut down")]
    Closed,
    #[error("failed to start dispatch thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("blocking wait on the dispatch thread would deadlock")]
    WouldBlock,
    #[error("no async runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<DispatchContext>>> = const { RefCell::new(None) };
}

/// Handle to the state owned by the dispatch thread.
///
/// Only ever exists on that thread; it is neither `Send` nor `Sync`, so tree
/// mutation from any other thread does not compile.
pub struct DispatchContext {
    tree: RefCell<Tree>,
    _local: PhantomData<Rc<()>>,
}

impl DispatchContext {
    fn new() -> Self {
        Self {
            tree: RefCell::new(Tree::new()),
            _local: PhantomData,
        }
    }

    pub fn tree(&self) -> Ref<'_, Tree> {
        self.tree.borrow()
    }

    pub fn tree_mut(&self) -> RefMut<'_, Tree> {
        self.tree.borrow_mut()
    }
}

struct DispatcherInner {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.tx.lock().take();
    }
}

/// Single logical thread that owns the mirrored tree and delivers every
/// protocol completion.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn start() -> Result<Self, DispatchError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let join = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || {
                let ctx = Rc::new(DispatchContext::new());
                CURRENT.with(|current| *current.borrow_mut() = Some(Rc::clone(&ctx)));
                while let Some(task) = rx.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(|| task(&ctx))).is_err() {
                        tracing::error!("dispatch task panicked");
                    }
                }
                CURRENT.with(|current| current.borrow_mut().take());
                tracing::debug!("dispatch thread stopped");
            })
            .map_err(DispatchError::Spawn)?;

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                tx: Mutex::new(Some(tx)),
                thread_id: join.thread().id(),
                join: Mutex::new(Some(join)),
            }),
        })
    }

    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Enqueues `task` and returns immediately.
    pub fn submit<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&DispatchContext) + Send + 'static,
    {
        let guard = self.inner.tx.lock();
        let tx = guard.as_ref().ok_or(DispatchError::Closed)?;
        tx.send(Box::new(task)).map_err(|_| DispatchError::Closed)
    }

    pub async fn invoke<R, F>(&self, task: F) -> Result<R, DispatchError>
    where
        F: FnOnce(&DispatchContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move |ctx| {
            let _ = tx.send(task(ctx));
        })?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    /// Runs `task` inline when called on the dispatch thread, otherwise blocks
    /// the calling thread until the task has run there.
    ///
    /// Must not be called from inside an async task.
    pub fn invoke_and_wait<R, F>(&self, task: F) -> Result<R, DispatchError>
    where
        F: FnOnce(&DispatchContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_dispatch_thread() {
            let ctx = CURRENT
                .with(|current| current.borrow().clone())
                .ok_or(DispatchError::Closed)?;
            return Ok(task(&ctx));
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.submit(move |ctx| {
            let _ = tx.send(task(ctx));
        })?;
        rx.recv().map_err(|_| DispatchError::Closed)
    }

    /// Stops accepting tasks, lets the queued ones run, and joins the thread.
    pub fn shutdown(&self) {
        self.inner.tx.lock().take();
        if self.is_dispatch_thread() {
            return;
        }
        if let Some(join) = self.inner.join.lock().take()
            && join.join().is_err()
        {
            tracing::warn!("dispatch thread exited with a panic");
        }
    }
}
