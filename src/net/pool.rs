//! Per-node connection pool.
//!
//! One bounded send queue fans out to a worker per live connection. A
//! worker holds at most one item at a time and blocks until its request
//! settles, so parallelism equals the live connection count. Recovery is a
//! single-writer critical section under the pool mutex: dead connections
//! are unlinked and closed, replacements are connected in parallel, and
//! connect failures are logged here and nowhere else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, bounded};

use crate::config::KvConfig;
use crate::error::KvError;
use crate::proto::KvRequest;

use super::Endpoint;
use super::cancel::CancelToken;
use super::connection::{CompletionSender, Connection, ConnectionFactory};

/// A queued unit of work: the operation, its cancellation token, and the
/// caller's one-shot completion.
pub struct SendRequest {
    pub request: KvRequest,
    pub cancel: CancelToken,
    pub complete: CompletionSender,
    /// A dead-connection send is retried transparently exactly once.
    requeued: bool,
}

impl SendRequest {
    pub fn new(request: KvRequest, cancel: CancelToken, complete: CompletionSender) -> Self {
        Self {
            request,
            cancel,
            complete,
            requeued: false,
        }
    }

    fn fail(self, err: KvError) {
        let _ = self.complete.send(Err(err));
    }
}

struct PoolMember {
    connection: Arc<Connection>,
    /// Dropped to unlink the worker from the queue.
    stop: Sender<()>,
    worker: JoinHandle<()>,
}

struct PoolInner {
    members: Vec<PoolMember>,
    /// Workers of unlinked connections, joined at disposal.
    retired: Vec<JoinHandle<()>>,
    disposed: bool,
}

pub struct ConnectionPool {
    endpoint: Endpoint,
    factory: Arc<dyn ConnectionFactory>,
    min_size: usize,
    max_size: usize,
    queue_tx: Mutex<Option<Sender<SendRequest>>>,
    queue_rx: Receiver<SendRequest>,
    inner: Mutex<PoolInner>,
    disposed: AtomicBool,
    self_weak: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(
        endpoint: Endpoint,
        factory: Arc<dyn ConnectionFactory>,
        config: &KvConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = bounded(config.send_queue_capacity);
        let min_size = config.num_kv_connections.max(1);
        Arc::new_cyclic(|weak| Self {
            endpoint,
            factory,
            min_size,
            max_size: config.max_kv_connections.max(min_size),
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx,
            inner: Mutex::new(PoolInner {
                members: Vec::new(),
                retired: Vec::new(),
                disposed: false,
            }),
            disposed: AtomicBool::new(false),
            self_weak: weak.clone(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .members
            .iter()
            .filter(|member| !member.connection.is_dead())
            .count()
    }

    /// Requests accepted but not yet handed to a worker.
    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }

    fn disposed_error(&self) -> KvError {
        KvError::PoolDisposed {
            endpoint: self.endpoint.to_string(),
        }
    }

    /// Post a request into the send queue.
    ///
    /// Blocks while the queue is full (that is the back-pressure signal)
    /// unless the request's cancel token trips first. A pool with no live
    /// connection runs a recovery cycle before posting.
    pub fn submit(&self, request: SendRequest) -> crate::Result<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        let opcode = request.request.opcode;
        let key = request.request.redacted_key();
        if request.cancel.is_cancelled() {
            return Err(KvError::Cancelled { opcode, key });
        }
        if self.live_count() == 0 {
            self.recover();
        }

        let tx = match &*self.queue_tx.lock().expect("queue sender lock poisoned") {
            Some(tx) => tx.clone(),
            None => return Err(self.disposed_error()),
        };
        let cancel = request.cancel.clone();
        crossbeam::select! {
            send(tx, request) -> res => res.map_err(|_| self.disposed_error()),
            recv(cancel.observer()) -> _ => Err(KvError::Cancelled { opcode, key }),
        }
    }

    /// Hand a not-yet-written request back to the queue after its worker's
    /// connection died.
    fn requeue(&self, mut item: SendRequest) {
        if self.is_disposed() {
            item.fail(self.disposed_error());
            return;
        }
        item.requeued = true;
        let tx = match &*self.queue_tx.lock().expect("queue sender lock poisoned") {
            Some(tx) => tx.clone(),
            None => {
                item.fail(self.disposed_error());
                return;
            }
        };
        if let Err(err) = tx.send(item) {
            err.into_inner().fail(self.disposed_error());
        }
    }

    fn schedule_recovery(&self) {
        if self.is_disposed() {
            return;
        }
        let weak = self.self_weak.clone();
        thread::spawn(move || {
            if let Some(pool) = weak.upgrade() {
                pool.recover();
            }
        });
    }

    /// Replace dead connections and top the pool back up to its minimum.
    ///
    /// Single-writer: the whole cycle runs under the pool mutex, so a
    /// frozen pool defers recovery until the freeze guard drops.
    pub fn recover(&self) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.disposed {
            return;
        }

        let members = std::mem::take(&mut inner.members);
        let mut retired = Vec::new();
        for member in members {
            if member.connection.is_dead() {
                let PoolMember {
                    connection,
                    stop,
                    worker,
                } = member;
                drop(stop);
                connection.close();
                retired.push(worker);
            } else {
                inner.members.push(member);
            }
        }
        inner.retired.extend(retired);

        let live = inner.members.len();
        let need = self
            .min_size
            .saturating_sub(live)
            .min(self.max_size.saturating_sub(live));
        if need == 0 {
            return;
        }

        let (done_tx, done_rx) = bounded(need);
        for _ in 0..need {
            let factory = Arc::clone(&self.factory);
            let endpoint = self.endpoint.clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                let _ = done.send(factory.create(&endpoint));
            });
        }
        drop(done_tx);

        for result in done_rx.iter() {
            match result {
                Ok(connection) => {
                    let member = self.spawn_worker(Arc::new(connection));
                    inner.members.push(member);
                }
                Err(err) => {
                    // The pool stays under strength until the next cycle.
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        "connection recovery failed: {err}"
                    );
                }
            }
        }
    }

    fn spawn_worker(&self, connection: Arc<Connection>) -> PoolMember {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let queue = self.queue_rx.clone();
        let pool = self.self_weak.clone();
        let endpoint = self.endpoint.clone();
        let conn = Arc::clone(&connection);
        let worker = thread::spawn(move || run_worker(conn, queue, stop_rx, pool, endpoint));
        PoolMember {
            connection,
            stop: stop_tx,
            worker,
        }
    }

    /// Atomically quiesce the pool: while the guard lives, no connection is
    /// added or removed.
    pub fn freeze(&self) -> PoolFreeze<'_> {
        PoolFreeze {
            guard: self.inner.lock().expect("pool lock poisoned"),
        }
    }

    /// Tear the pool down. Every request already accepted either completes,
    /// fails with a transport/disposed error, or was cancelled; later
    /// submissions fail immediately.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stop accepting new work.
        self.queue_tx
            .lock()
            .expect("queue sender lock poisoned")
            .take();

        let (members, retired) = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            inner.disposed = true;
            (
                std::mem::take(&mut inner.members),
                std::mem::take(&mut inner.retired),
            )
        };

        let mut workers = Vec::with_capacity(members.len());
        for member in members {
            let PoolMember {
                connection,
                stop,
                worker,
            } = member;
            drop(stop);
            connection.close();
            workers.push(worker);
        }

        // Drain whatever is still queued; recv ends once the last transient
        // sender clone is gone.
        while let Ok(item) = self.queue_rx.recv() {
            item.fail(self.disposed_error());
        }

        for worker in workers.into_iter().chain(retired) {
            let _ = worker.join();
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Scoped freeze: holds the pool mutex until dropped.
pub struct PoolFreeze<'a> {
    guard: MutexGuard<'a, PoolInner>,
}

impl PoolFreeze<'_> {
    pub fn connection_count(&self) -> usize {
        self.guard.members.len()
    }

    pub fn live_count(&self) -> usize {
        self.guard
            .members
            .iter()
            .filter(|member| !member.connection.is_dead())
            .count()
    }
}

fn run_worker(
    connection: Arc<Connection>,
    queue: Receiver<SendRequest>,
    stop: Receiver<()>,
    pool: Weak<ConnectionPool>,
    endpoint: Endpoint,
) {
    loop {
        let item = crossbeam::select! {
            recv(queue) -> msg => match msg {
                Ok(item) => item,
                Err(_) => return,
            },
            // Sender dropped: this worker was unlinked from the queue.
            recv(stop) -> _ => return,
        };

        if item.cancel.is_cancelled() {
            let err = KvError::Cancelled {
                opcode: item.request.opcode,
                key: item.request.redacted_key(),
            };
            item.fail(err);
            continue;
        }

        if connection.is_dead() {
            // Never process on a dead connection: hand the item back and go
            // quiescent until recovery tears this worker down.
            hand_back(&pool, item, &endpoint);
            return;
        }

        match connection.execute(&item.request, item.complete.clone()) {
            Ok(settled) => {
                // One outstanding request per worker: wait until the read
                // loop delivers the response or the connection dies.
                let _ = settled.recv();
            }
            Err(err) => {
                let send_failure = matches!(err, KvError::Transport { during_send: true, .. });
                if send_failure && !item.requeued {
                    hand_back(&pool, item, &endpoint);
                    return;
                }
                item.fail(err);
                if connection.is_dead() {
                    if let Some(pool) = pool.upgrade() {
                        pool.schedule_recovery();
                    }
                    return;
                }
            }
        }
    }
}

fn hand_back(pool: &Weak<ConnectionPool>, item: SendRequest, endpoint: &Endpoint) {
    match pool.upgrade() {
        Some(pool) => {
            pool.requeue(item);
            pool.schedule_recovery();
        }
        None => item.fail(KvError::PoolDisposed {
            endpoint: endpoint.to_string(),
        }),
    }
}
