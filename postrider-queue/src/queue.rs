//! The durable retry queue.
//!
//! Messages enter through the usual staged delivery protocol; `body` persists
//! the triple to disk and `commit` launches the first attempt immediately on
//! its own task (the header and body are already in memory, so going through
//! the wheel would only force a re-read). Every later attempt is scheduled on
//! the [`TimeWheel`] with exponential backoff and picked up by one of the
//! worker tasks.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postrider_common::{BodyBuffer, Delivery, DeliveryTarget, Error, Header, MsgMetadata};
use postrider_spool::{DiskStore, QueueMetadata};
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{QueueConfig, QueueError, driver, dsn, wheel::TimeWheel};

struct Inner {
    config: QueueConfig,
    store: DiskStore,
    wheel: TimeWheel<String>,
    target: Arc<dyn DeliveryTarget>,
    bounce: Option<Arc<dyn DeliveryTarget>>,
    stop: watch::Sender<bool>,
    // Workers plus commit-launched first attempts. Taken by the first close()
    // call, which joins everything in it.
    tasks: Mutex<Option<JoinSet<()>>>,
}

/// A store-and-forward delivery queue.
///
/// Clones share the same queue. Implements [`DeliveryTarget`], so it can sit
/// anywhere a downstream target can.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    /// Open the on-disk store, reconcile whatever a previous run left
    /// behind, schedule the survivors and start the worker pool.
    ///
    /// `bounce` is the target failure notifications are routed through; when
    /// present, `config.autogenerated_msg_domain` must be set.
    ///
    /// # Errors
    /// Configuration and storage failures only; see [`QueueError`].
    pub async fn new(
        config: QueueConfig,
        target: Arc<dyn DeliveryTarget>,
        bounce: Option<Arc<dyn DeliveryTarget>>,
    ) -> Result<Self, QueueError> {
        if bounce.is_some() && config.autogenerated_msg_domain.is_none() {
            return Err(QueueError::MissingAutogenDomain);
        }

        let store = DiskStore::open(&config.location).await?;
        let (stop, _) = watch::channel(false);
        let queue = Self {
            inner: Arc::new(Inner {
                config,
                store,
                wheel: TimeWheel::new(),
                target,
                bounce,
                stop,
                tasks: Mutex::new(Some(JoinSet::new())),
            }),
        };

        queue.read_disk_queue().await?;
        queue.spawn_workers();
        Ok(queue)
    }

    /// Begin a delivery for an internally generated status notification.
    /// Identical to the regular entry point except that the resulting
    /// message will never be bounced itself.
    #[must_use]
    pub fn start_dsn(&self, msg_meta: MsgMetadata, mail_from: impl Into<String>) -> QueueDelivery {
        QueueDelivery::new(
            Arc::clone(&self.inner),
            QueueMetadata::new(msg_meta, mail_from, true),
        )
    }

    /// Stop the queue: signal the workers, wait for them and for every
    /// in-flight commit-launched attempt, then release the wheel.
    /// Idempotent.
    pub async fn close(&self) {
        let taken = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut tasks) = taken else { return };

        let _ = self.inner.stop.send(true);
        while tasks.join_next().await.is_some() {}
        self.inner.wheel.close();
    }

    async fn read_disk_queue(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        let earliest = Utc::now()
            + chrono::Duration::seconds(
                i64::try_from(inner.config.post_init_delay().as_secs()).unwrap_or(i64::MAX),
            );

        let mut loaded = 0_usize;
        for meta in inner.store.scan().await? {
            let next_try = meta
                .last_attempt
                .checked_add_signed(inner.retry_delay(meta.tries_count))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                .max(earliest);
            debug!(msg_id = %meta.msg_meta.id, %next_try, "scheduling recovered message");
            inner.wheel.add(next_try, meta.msg_meta.id.clone());
            loaded += 1;
        }

        if loaded != 0 {
            info!(count = loaded, "loaded saved queue entries");
        }
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(set) = tasks.as_mut() else { return };

        for _ in 0..self.inner.config.workers {
            let inner = Arc::clone(&self.inner);
            let mut stop = self.inner.stop.subscribe();
            set.spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => return,
                        slot = inner.wheel.dispatch() => {
                            let Some(id) = slot else { return };
                            debug!(msg_id = %id, "worker woke up");
                            match inner.store.open_message(&id).await {
                                Ok(Some((meta, header, body))) => {
                                    Arc::clone(&inner).try_delivery(meta, header, body).await;
                                }
                                // Incomplete triple, already reconciled.
                                Ok(None) => {}
                                Err(err) => {
                                    warn!(msg_id = %id, error = %err, "failed to read message");
                                }
                            }
                        }
                    }
                }
            });
        }
    }
}

#[async_trait]
impl DeliveryTarget for Queue {
    async fn start(
        &self,
        msg_meta: &MsgMetadata,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, Error> {
        Ok(Box::new(QueueDelivery::new(
            Arc::clone(&self.inner),
            QueueMetadata::new(msg_meta.clone(), mail_from, false),
        )))
    }
}

impl Inner {
    /// Delay before attempt `tries_count + 1`:
    /// `initial_retry_time * retry_time_scale ^ (tries_count - 1)`.
    fn retry_delay(&self, tries_count: u32) -> chrono::Duration {
        let factor = self
            .config
            .retry_time_scale
            .powi(i32::try_from(tries_count).unwrap_or(i32::MAX).saturating_sub(1));
        let secs = self.config.initial_retry_time().as_secs_f64() * factor;
        std::time::Duration::try_from_secs_f64(secs)
            .ok()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Run one attempt and apply its outcome: accumulate permanent failures,
    /// refresh per-recipient errors, and either reschedule the remaining
    /// temporary failures or finish the message (removing it from disk and,
    /// when warranted, emitting a notification).
    fn try_delivery(
        self: Arc<Self>,
        mut meta: QueueMetadata,
        header: Header,
        body: BodyBuffer,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        let id = meta.msg_meta.id.clone();
        debug!(msg_id = %id, attempt = meta.tries_count + 1, "delivery attempt");

        let target: &dyn DeliveryTarget = if meta.dsn {
            self.bounce.as_deref().unwrap_or(self.target.as_ref())
        } else {
            self.target.as_ref()
        };
        let perr = driver::attempt(target, &meta, &header, &body).await;
        debug!(
            msg_id = %id,
            failed = ?perr.failed,
            temporary_failed = ?perr.temporary_failed,
            "attempt outcome"
        );

        meta.failed_rcpts.extend(perr.failed.iter().cloned());
        for (rcpt, err) in &perr.errs {
            meta.rcpt_errs.insert(rcpt.clone(), err.to_smtp());
        }
        meta.temporary_failed_rcpts.clone_from(&perr.temporary_failed);
        meta.to = perr.temporary_failed;
        meta.last_attempt = Utc::now();

        if meta.tries_count == self.config.max_tries || meta.to.is_empty() {
            // Giving up on recipients that never got past a temporary
            // failure is as permanent as it gets for the sender.
            let gave_up = !meta.to.is_empty();
            if gave_up {
                info!(
                    msg_id = %id,
                    rcpts = ?meta.temporary_failed_rcpts,
                    errors = ?meta.rcpt_errs,
                    "gave up trying to deliver"
                );
            }
            if !meta.failed_rcpts.is_empty() {
                info!(
                    msg_id = %id,
                    rcpts = ?meta.failed_rcpts,
                    errors = ?meta.rcpt_errs,
                    "permanently failed to deliver"
                );
            }
            if !meta.dsn && (gave_up || !meta.failed_rcpts.is_empty()) {
                Self::emit_dsn(&self, &meta, &header).await;
            }
            self.store.remove(&id).await;
            return;
        }

        meta.tries_count += 1;
        if let Err(err) = self.store.update_metadata(&meta).await {
            warn!(msg_id = %id, error = %err, "failed to update metadata");
        }

        let next_try = Utc::now()
            .checked_add_signed(self.retry_delay(meta.tries_count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        info!(msg_id = %id, attempt = meta.tries_count, %next_try, "attempt failed, will retry");
        self.wheel.add(next_try, id);
        })
    }

    /// Synthesize a failure notification for `meta` and enqueue it as a
    /// regular (but DSN-flagged) message. All failures here are logged and
    /// swallowed; there is nobody left to report them to.
    async fn emit_dsn(inner: &Arc<Self>, meta: &QueueMetadata, header: &Header) {
        if inner.bounce.is_none() {
            return;
        }
        let Some(domain) = inner.config.autogenerated_msg_domain.as_deref() else {
            return;
        };
        if meta.from.is_empty() {
            // Null sender; bouncing would only loop.
            debug!(msg_id = %meta.msg_meta.id, "null sender, not generating notification");
            return;
        }

        let dsn_id = ulid::Ulid::new().to_string();
        let envelope = dsn::DsnEnvelope {
            msg_id: format!("<{dsn_id}@{domain}>"),
            from: format!("MAILER-DAEMON@{domain}"),
            to: meta.from.clone(),
        };
        let mta_info = dsn::ReportingMtaInfo {
            reporting_mta: inner.config.hostname.clone(),
            received_from_mta: (!meta.msg_meta.dont_trace_sender)
                .then(|| meta.msg_meta.src_hostname.clone()),
            x_sender: meta.from.clone(),
            x_message_id: meta.msg_meta.id.clone(),
            arrival_date: meta.first_attempt,
            last_attempt_date: meta.last_attempt,
        };
        let rcpts: Vec<dsn::RecipientInfo> = meta
            .rcpt_errs
            .iter()
            .map(|(rcpt, err)| dsn::RecipientInfo {
                // Report the address as originally submitted where known.
                final_recipient: meta
                    .msg_meta
                    .original_rcpts
                    .get(rcpt)
                    .unwrap_or(rcpt)
                    .clone(),
                status: err.enhanced_code,
                diagnostic: err.clone(),
            })
            .collect();

        let (dsn_header, dsn_body) = dsn::generate(&envelope, &mta_info, &rcpts, header);
        let dsn_meta = MsgMetadata {
            id: dsn_id.clone(),
            src_hostname: inner.config.hostname.clone(),
            ..MsgMetadata::default()
        };
        info!(msg_id = %meta.msg_meta.id, dsn_id = %dsn_id, "generated failure notification");

        let queue = Queue {
            inner: Arc::clone(inner),
        };
        let mut delivery = queue.start_dsn(dsn_meta, envelope.from.clone());
        if let Err(err) = delivery.add_rcpt(&meta.from).await {
            warn!(msg_id = %meta.msg_meta.id, error = %err, "failed to enqueue notification");
            return;
        }
        if let Err(err) = delivery.body(&dsn_header, &dsn_body).await {
            warn!(msg_id = %meta.msg_meta.id, error = %err, "failed to enqueue notification");
            return;
        }
        if let Err(err) = delivery.commit().await {
            warn!(msg_id = %meta.msg_meta.id, error = %err, "failed to enqueue notification");
        }
    }
}

/// An in-progress delivery into the queue.
pub struct QueueDelivery {
    inner: Arc<Inner>,
    meta: QueueMetadata,
    header: Option<Header>,
    body: Option<BodyBuffer>,
}

impl QueueDelivery {
    fn new(inner: Arc<Inner>, meta: QueueMetadata) -> Self {
        Self {
            inner,
            meta,
            header: None,
            body: None,
        }
    }

    /// Record a recipient. Acceptance is decided at delivery time, so this
    /// never fails.
    #[allow(clippy::unused_async)]
    pub async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), Error> {
        self.meta.to.push(rcpt.to_string());
        Ok(())
    }

    /// Persist the message triple. After this the queue no longer depends on
    /// the caller's body buffer.
    ///
    /// # Errors
    /// Storage failures surface to the caller; nothing was enqueued.
    pub async fn body(&mut self, header: &Header, body: &BodyBuffer) -> Result<(), Error> {
        let stored = self
            .inner
            .store
            .store_new_message(&self.meta, header, body)
            .await?;
        self.header = Some(header.clone());
        self.body = Some(stored);
        Ok(())
    }

    /// Drop the delivery, removing the triple if it was already persisted.
    pub async fn abort(self) -> Result<(), Error> {
        if self.body.is_some() {
            self.inner.store.remove(&self.meta.msg_meta.id).await;
        }
        Ok(())
    }

    /// Accept the message and launch the first attempt on its own task. The
    /// task is tracked so [`Queue::close`] waits for it.
    ///
    /// # Errors
    /// Only on protocol misuse (commit without a prior successful `body`).
    pub async fn commit(self) -> Result<(), Error> {
        let Self {
            inner,
            meta,
            header,
            body,
        } = self;
        let (Some(header), Some(body)) = (header, body) else {
            return Err(Error::Failure("commit without a stored body".to_string()));
        };

        match Self::try_spawn_tracked(&inner, meta, header, body) {
            None => Ok(()),
            Some((meta, header, body)) => {
                // The queue is shutting down; run the attempt inline instead
                // of spawning an untracked task.
                Arc::clone(&inner).try_delivery(meta, header, body).await;
                Ok(())
            }
        }
    }

    /// Spawn the first attempt on the tracked task set, if it still exists.
    /// Returns the triple back when the queue is shutting down so the caller
    /// can run the attempt inline instead.
    fn try_spawn_tracked(
        inner: &Arc<Inner>,
        meta: QueueMetadata,
        header: Header,
        body: BodyBuffer,
    ) -> Option<(QueueMetadata, Header, BodyBuffer)> {
        let mut tasks = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = tasks.as_mut() {
            let inner = Arc::clone(inner);
            set.spawn(async move { inner.try_delivery(meta, header, body).await });
            None
        } else {
            Some((meta, header, body))
        }
    }
}

#[async_trait]
impl Delivery for QueueDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), Error> {
        Self::add_rcpt(self, rcpt).await
    }

    async fn body(&mut self, header: &Header, body: &BodyBuffer) -> Result<(), Error> {
        Self::body(self, header, body).await
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        Self::commit(*self).await
    }

    async fn abort(self: Box<Self>) -> Result<(), Error> {
        Self::abort(*self).await
    }
}
