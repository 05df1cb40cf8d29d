//! Reader/dispatcher pipeline behind a subscription handle.

use super::types::{EventHandler, SubscriptionConfig, SubscriptionId, SubscriptionState};
use crate::channels::ChannelStore;
use crate::error::{panic_message, EngineError, Result};
use crate::log::EventEnvelope;
use crate::types::Sequence;
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifecycle bookkeeping guarded by one lock.
struct Status {
    state: SubscriptionState,
    /// Worker threads that have not exited yet.
    workers: usize,
}

/// State shared between the handle and its worker threads.
struct Shared {
    id: SubscriptionId,
    channel: String,
    status: Mutex<Status>,
    changed: Condvar,
    /// Next sequence number the reader will fetch.
    cursor: AtomicU64,
    delivered: AtomicU64,
    last_delivered: Mutex<Option<Sequence>>,
    failure: Mutex<Option<Arc<EngineError>>>,
    /// Dropping the sender wakes every `select!` on the receiver.
    shutdown: Mutex<Option<Sender<()>>>,
}

impl Shared {
    fn close(&self) -> bool {
        let Some(sender) = self.shutdown.lock().take() else {
            return false;
        };
        drop(sender);

        self.status.lock().state = SubscriptionState::Closed;
        self.changed.notify_all();
        true
    }

    fn fail(&self, error: EngineError) {
        tracing::error!(
            subscription = %self.id,
            channel = %self.channel,
            error = %error,
            "subscription failed"
        );
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(Arc::new(error));
            }
        }
        self.close();
    }

    fn mark_live(&self) {
        let mut status = self.status.lock();
        if status.state == SubscriptionState::Starting {
            status.state = SubscriptionState::Live;
        }
    }

    fn worker_exited(&self) {
        self.status.lock().workers -= 1;
        self.changed.notify_all();
    }
}

fn is_shutdown(shutdown: &Receiver<()>) -> bool {
    matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected))
}

/// A running replay session against one channel.
///
/// Events are read by a reader thread and handed to the handler on a
/// dispatcher thread through a bounded queue, so a slow handler throttles
/// reads instead of growing a buffer. Dropping the handle closes it.
pub struct Subscription {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Subscription {
    /// Spawn the reader and dispatcher threads starting at `start`.
    pub(crate) fn start(
        id: SubscriptionId,
        store: Arc<dyn ChannelStore>,
        channel: &str,
        start: Sequence,
        handler: Box<dyn EventHandler>,
        config: SubscriptionConfig,
        verify_checksums: bool,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (queue_tx, queue_rx) = bounded::<EventEnvelope>(config.queue_capacity);

        let shared = Arc::new(Shared {
            id,
            channel: channel.to_string(),
            status: Mutex::new(Status {
                state: SubscriptionState::Starting,
                workers: 2,
            }),
            changed: Condvar::new(),
            cursor: AtomicU64::new(start.0),
            delivered: AtomicU64::new(0),
            last_delivered: Mutex::new(None),
            failure: Mutex::new(None),
            shutdown: Mutex::new(Some(shutdown_tx)),
        });

        let reader = Reader {
            shared: Arc::clone(&shared),
            store,
            queue: queue_tx,
            shutdown: shutdown_rx.clone(),
            config,
            verify_checksums,
        };
        let reader_handle = match thread::Builder::new()
            .name(format!("{}-reader", id))
            .spawn(move || reader.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.close();
                return Err(e.into());
            }
        };

        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            queue: queue_rx,
            shutdown: shutdown_rx,
            handler,
        };
        let dispatcher_handle = match thread::Builder::new()
            .name(format!("{}-dispatch", id))
            .spawn(move || dispatcher.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.close();
                let _ = reader_handle.join();
                return Err(e.into());
            }
        };

        tracing::info!(subscription = %id, channel, start = start.0, "subscription started");

        Ok(Self {
            shared,
            threads: Mutex::new(vec![reader_handle, dispatcher_handle]),
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.status.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// Next sequence number the reader will fetch.
    pub fn cursor(&self) -> Sequence {
        Sequence(self.shared.cursor.load(Ordering::SeqCst))
    }

    /// Number of events the handler has completed.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Sequence number of the last event the handler completed.
    pub fn last_delivered(&self) -> Option<Sequence> {
        *self.shared.last_delivered.lock()
    }

    /// The error that closed the subscription, if any.
    pub fn failure(&self) -> Option<Arc<EngineError>> {
        self.shared.failure.lock().clone()
    }

    /// Stop reading and dispatching.
    ///
    /// Idempotent and callable from any thread, including the handler
    /// itself. Events still queued are abandoned; an event already inside
    /// the handler runs to completion. Worker threads are joined unless the
    /// caller is one of them.
    pub fn close(&self) {
        if self.shared.close() {
            tracing::info!(
                subscription = %self.shared.id,
                channel = %self.shared.channel,
                delivered = self.delivered(),
                "subscription closed"
            );
        }

        let current = thread::current().id();
        let handles: Vec<_> = {
            let mut threads = self.threads.lock();
            if threads.iter().any(|h| h.thread().id() == current) {
                return;
            }
            threads.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Block until the subscription is closed and both workers have exited.
    ///
    /// Returns false if `timeout` elapses first.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while status.state != SubscriptionState::Closed || status.workers > 0 {
            if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                return status.state == SubscriptionState::Closed && status.workers == 0;
            }
        }
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("channel", &self.shared.channel)
            .field("state", &self.state())
            .field("cursor", &self.cursor())
            .finish()
    }
}

/// Fetches envelopes in sequence order and feeds the queue.
struct Reader {
    shared: Arc<Shared>,
    store: Arc<dyn ChannelStore>,
    queue: Sender<EventEnvelope>,
    shutdown: Receiver<()>,
    config: SubscriptionConfig,
    verify_checksums: bool,
}

impl Reader {
    fn run(self) {
        let mut cursor = Sequence(self.shared.cursor.load(Ordering::SeqCst));
        let mut pause = self.config.poll_interval();
        let mut failures = 0u32;

        while !is_shutdown(&self.shutdown) {
            match self.fetch(cursor, pause) {
                Ok(Some(envelope)) => {
                    failures = 0;
                    pause = self.config.poll_interval();
                    select! {
                        send(self.queue, envelope) -> sent => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        recv(self.shutdown) -> _ => break,
                    }
                    cursor = cursor.next();
                    self.shared.cursor.store(cursor.0, Ordering::SeqCst);
                }
                Ok(None) => {
                    pause = (pause * 2).min(self.config.max_poll_interval());
                }
                Err(e) if e.is_transient() && failures < self.config.max_transient_retries => {
                    failures += 1;
                    tracing::warn!(
                        subscription = %self.shared.id,
                        channel = %self.shared.channel,
                        sequence = cursor.0,
                        attempt = failures,
                        error = %e,
                        "transient read failure, retrying"
                    );
                    select! {
                        recv(self.shutdown) -> _ => break,
                        default(pause) => {}
                    }
                    pause = (pause * 2).min(self.config.max_poll_interval());
                }
                Err(e) => {
                    self.shared.fail(e);
                    break;
                }
            }
        }

        self.shared.worker_exited();
    }

    /// Wait up to `pause` for `cursor` and read it.
    fn fetch(&self, cursor: Sequence, pause: Duration) -> Result<Option<EventEnvelope>> {
        let channel = &self.shared.channel;
        if !self.store.wait_for(channel, cursor, pause)? {
            return Ok(None);
        }
        let Some(bytes) = self.store.read(channel, cursor)? else {
            return Ok(None);
        };

        let envelope = if self.verify_checksums {
            EventEnvelope::decode_verified(&bytes)?
        } else {
            EventEnvelope::decode(&bytes)?
        };
        if envelope.sequence != cursor {
            return Err(EngineError::Corruption(format!(
                "channel {}: slot {} holds event {}",
                channel, cursor, envelope.sequence
            )));
        }
        Ok(Some(envelope))
    }
}

/// Drains the queue into the handler.
struct Dispatcher {
    shared: Arc<Shared>,
    queue: Receiver<EventEnvelope>,
    shutdown: Receiver<()>,
    handler: Box<dyn EventHandler>,
}

impl Dispatcher {
    fn run(mut self) {
        self.shared.mark_live();

        loop {
            let envelope = select! {
                recv(self.queue) -> msg => match msg {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
                recv(self.shutdown) -> _ => break,
            };
            if is_shutdown(&self.shutdown) {
                break;
            }

            let sequence = envelope.sequence;
            let handler = &mut self.handler;
            match catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
                Ok(Ok(())) => {
                    *self.shared.last_delivered.lock() = Some(sequence);
                    self.shared.delivered.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Err(e)) => {
                    self.shared.fail(e);
                    break;
                }
                Err(panic) => {
                    self.shared.fail(EngineError::Handler(format!(
                        "handler panicked at {}: {}",
                        sequence,
                        panic_message(panic.as_ref())
                    )));
                    break;
                }
            }
        }

        self.shared.worker_exited();
    }
}
