//! Scriptable in-memory delivery target for tests.
//!
//! Records every committed message and can be told to fail individual
//! recipients, the body stage, or the whole `start` call with a configured
//! SMTP reply. Waiters can block on a message count the same way spool tests
//! wait on their mock controller.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    body::BodyBuffer,
    error::Error,
    header::Header,
    message::MsgMetadata,
    smtp::SmtpError,
    target::{Delivery, DeliveryTarget},
};

/// A message as observed by a [`TestTarget`].
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub msg_meta: MsgMetadata,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub header: Header,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
struct TestState {
    messages: Mutex<Vec<ReceivedMessage>>,
    aborted: Mutex<usize>,
    start_failure: Mutex<Option<SmtpError>>,
    rcpt_failures: Mutex<AHashMap<String, SmtpError>>,
    body_failure: Mutex<Option<SmtpError>>,
    notify: Notify,
}

/// Mock delivery target recording committed messages.
#[derive(Debug, Clone, Default)]
pub struct TestTarget {
    state: Arc<TestState>,
}

impl TestTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages committed so far, in commit order.
    #[must_use]
    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.state
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.state
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of deliveries that were aborted instead of committed.
    #[must_use]
    pub fn aborted_count(&self) -> usize {
        *self
            .state
            .aborted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every subsequent `start` with the given reply.
    pub fn fail_start(&self, err: SmtpError) {
        *self
            .state
            .start_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// Fail `add_rcpt` for one recipient with the given reply.
    pub fn fail_rcpt(&self, rcpt: impl Into<String>, err: SmtpError) {
        self.state
            .rcpt_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rcpt.into(), err);
    }

    /// Stop failing a previously scripted recipient.
    pub fn clear_rcpt(&self, rcpt: &str) {
        self.state
            .rcpt_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(rcpt);
    }

    /// Fail every subsequent `body` with the given reply.
    pub fn fail_body(&self, err: SmtpError) {
        *self
            .state
            .body_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// Wait until at least `expected` messages have been committed.
    ///
    /// # Errors
    /// Returns the elapsed-timeout error if the count is not reached in time.
    pub async fn wait_for_count(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.state.notify.notified();
                tokio::pin!(notified);
                // Register before checking, so a commit racing with the
                // check cannot be missed.
                notified.as_mut().enable();
                if self.message_count() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
    }
}

#[async_trait]
impl DeliveryTarget for TestTarget {
    async fn start(
        &self,
        msg_meta: &MsgMetadata,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, Error> {
        if let Some(err) = self
            .state
            .start_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(Error::Smtp(err));
        }
        Ok(Box::new(TestDelivery {
            state: Arc::clone(&self.state),
            msg_meta: msg_meta.clone(),
            mail_from: mail_from.to_string(),
            rcpt_to: Vec::new(),
            header: Header::new(),
            body: Vec::new(),
        }))
    }
}

struct TestDelivery {
    state: Arc<TestState>,
    msg_meta: MsgMetadata,
    mail_from: String,
    rcpt_to: Vec<String>,
    header: Header,
    body: Vec<u8>,
}

#[async_trait]
impl Delivery for TestDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), Error> {
        if let Some(err) = self
            .state
            .rcpt_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rcpt)
            .cloned()
        {
            return Err(Error::Smtp(err));
        }
        self.rcpt_to.push(rcpt.to_string());
        Ok(())
    }

    async fn body(&mut self, header: &Header, body: &BodyBuffer) -> Result<(), Error> {
        if let Some(err) = self
            .state
            .body_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(Error::Smtp(err));
        }
        self.header = header.clone();
        self.body = body.read_to_vec().await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.state
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ReceivedMessage {
                msg_meta: self.msg_meta,
                mail_from: self.mail_from,
                rcpt_to: self.rcpt_to,
                header: self.header,
                body: self.body,
            });
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), Error> {
        *self
            .state
            .aborted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}
