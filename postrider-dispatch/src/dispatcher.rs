//! Two-level envelope routing table.
//!
//! A message is routed first by its envelope sender to a [`SourceBlock`],
//! then each recipient is routed by the source's recipient table to a
//! [`RcptBlock`], which either rejects with a configured SMTP reply,
//! silently drops, or forwards to one or more delivery targets. Match
//! priority per key is full address, then the literal `postmaster` mailbox,
//! then the domain, then the default block; all matching is
//! case-insensitive.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use postrider_common::{
    BodyBuffer, Delivery, DeliveryTarget, EnhancedCode, Error, Header, MsgMetadata, PartialError,
    SmtpError, address,
};
use tracing::warn;

/// Terminal routing decision for a class of recipients.
#[derive(Clone, Default)]
pub struct RcptBlock {
    reject: Option<SmtpError>,
    targets: Vec<Arc<dyn DeliveryTarget>>,
}

impl RcptBlock {
    /// Forward matching recipients to the given targets.
    #[must_use]
    pub fn deliver_to(targets: Vec<Arc<dyn DeliveryTarget>>) -> Self {
        Self {
            reject: None,
            targets,
        }
    }

    /// Reject matching recipients with the given reply.
    #[must_use]
    pub const fn reject(err: SmtpError) -> Self {
        Self {
            reject: Some(err),
            targets: Vec::new(),
        }
    }

    /// Accept and discard matching recipients.
    #[must_use]
    pub fn drop_silently() -> Self {
        Self::default()
    }
}

/// Per-sender routing: a recipient table plus an optional outright reject.
#[derive(Clone, Default)]
pub struct SourceBlock {
    reject: Option<SmtpError>,
    per_rcpt: AHashMap<String, RcptBlock>,
    default_rcpt: RcptBlock,
}

impl SourceBlock {
    /// Route every recipient of matching senders through `default_rcpt`.
    #[must_use]
    pub fn deliver_to(targets: Vec<Arc<dyn DeliveryTarget>>) -> Self {
        Self {
            reject: None,
            per_rcpt: AHashMap::new(),
            default_rcpt: RcptBlock::deliver_to(targets),
        }
    }

    /// Reject matching senders at `start`.
    #[must_use]
    pub fn reject(err: SmtpError) -> Self {
        Self {
            reject: Some(err),
            per_rcpt: AHashMap::new(),
            default_rcpt: RcptBlock::default(),
        }
    }

    /// Recipient table with a fallback block.
    #[must_use]
    pub fn route(default_rcpt: RcptBlock) -> Self {
        Self {
            reject: None,
            per_rcpt: AHashMap::new(),
            default_rcpt,
        }
    }

    /// Add a recipient rule; the key is a full address, bare `postmaster`,
    /// or a domain, stored lowercased.
    #[must_use]
    pub fn rcpt(mut self, key: &str, block: RcptBlock) -> Self {
        self.per_rcpt.insert(key.to_ascii_lowercase(), block);
        self
    }
}

/// The routing table itself. Implements [`DeliveryTarget`].
#[derive(Clone, Default)]
pub struct Dispatcher {
    per_source: AHashMap<String, SourceBlock>,
    default_source: SourceBlock,
}

impl Dispatcher {
    #[must_use]
    pub fn new(default_source: SourceBlock) -> Self {
        Self {
            per_source: AHashMap::new(),
            default_source,
        }
    }

    /// Add a sender rule; same key grammar as recipient rules.
    #[must_use]
    pub fn source(mut self, key: &str, block: SourceBlock) -> Self {
        self.per_source.insert(key.to_ascii_lowercase(), block);
        self
    }
}

/// First match wins: full address, then domain, then the default block. The
/// bare `postmaster` mailbox matches through the full-address lookup, its
/// domain being empty.
fn match_block<'a, B>(
    map: &'a AHashMap<String, B>,
    default: &'a B,
    addr: &str,
    domain: &str,
) -> &'a B {
    if let Some(block) = map.get(&addr.to_ascii_lowercase()) {
        return block;
    }
    if !domain.is_empty()
        && let Some(block) = map.get(&domain.to_ascii_lowercase())
    {
        return block;
    }
    default
}

fn invalid_sender(err: &address::AddressError) -> Error {
    Error::Smtp(SmtpError {
        code: 501,
        enhanced_code: EnhancedCode(5, 1, 7),
        message: format!("invalid sender address: {err}"),
    })
}

fn invalid_rcpt(err: &address::AddressError) -> Error {
    Error::Smtp(SmtpError {
        code: 501,
        enhanced_code: EnhancedCode(5, 1, 3),
        message: format!("invalid recipient address: {err}"),
    })
}

#[async_trait]
impl DeliveryTarget for Dispatcher {
    async fn start(
        &self,
        msg_meta: &MsgMetadata,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, Error> {
        // The empty sender is the null reverse-path; it can only ever match
        // the default block.
        let from_domain = if mail_from.is_empty() {
            ""
        } else {
            let (_, domain) = address::split(mail_from).map_err(|err| invalid_sender(&err))?;
            domain
        };

        let source = match_block(&self.per_source, &self.default_source, mail_from, from_domain);
        if let Some(err) = &source.reject {
            return Err(Error::Smtp(err.clone()));
        }

        Ok(Box::new(DispatcherDelivery {
            source: source.clone(),
            msg_meta: msg_meta.clone(),
            mail_from: mail_from.to_string(),
            deliveries: Vec::new(),
        }))
    }
}

struct SubDelivery {
    // Identity of the target this delivery was started against, so
    // recipients sharing a target share one downstream delivery.
    target_key: usize,
    rcpts: Vec<String>,
    delivery: Box<dyn Delivery>,
}

struct DispatcherDelivery {
    source: SourceBlock,
    msg_meta: MsgMetadata,
    mail_from: String,
    deliveries: Vec<SubDelivery>,
}

fn target_key(target: &Arc<dyn DeliveryTarget>) -> usize {
    Arc::as_ptr(target).cast::<()>() as usize
}

/// Fold a downstream stage failure into the fan-out result, attributing it
/// to the failed sub-delivery's recipients unless it already partitions them.
fn fail_subdelivery(perr: &mut PartialError, err: Error, rcpts: &[String]) {
    match err {
        Error::Partial(expanded) => perr.merge(expanded),
        err => {
            if err.is_temporary() {
                perr.temporary_failed.extend_from_slice(rcpts);
            } else {
                perr.failed.extend_from_slice(rcpts);
            }
            for rcpt in rcpts {
                perr.errs.insert(rcpt.clone(), err.clone());
            }
        }
    }
}

#[async_trait]
impl Delivery for DispatcherDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), Error> {
        let (_, domain) = address::split(rcpt).map_err(|err| invalid_rcpt(&err))?;

        let block = match_block(
            &self.source.per_rcpt,
            &self.source.default_rcpt,
            rcpt,
            domain,
        );
        if let Some(err) = &block.reject {
            return Err(Error::Smtp(err.clone()));
        }

        for target in &block.targets {
            let key = target_key(target);
            let pos = self.deliveries.iter().position(|sub| sub.target_key == key);
            let idx = match pos {
                Some(idx) => idx,
                None => {
                    let delivery = target.start(&self.msg_meta, &self.mail_from).await?;
                    self.deliveries.push(SubDelivery {
                        target_key: key,
                        rcpts: Vec::new(),
                        delivery,
                    });
                    self.deliveries.len() - 1
                }
            };
            let Some(sub) = self.deliveries.get_mut(idx) else {
                continue;
            };
            sub.delivery.add_rcpt(rcpt).await?;
            sub.rcpts.push(rcpt.to_string());
        }

        Ok(())
    }

    async fn body(&mut self, header: &Header, body: &BodyBuffer) -> Result<(), Error> {
        let mut perr = PartialError::default();
        for sub in &mut self.deliveries {
            if let Err(err) = sub.delivery.body(header, body).await {
                fail_subdelivery(&mut perr, err, &sub.rcpts);
            }
        }
        if perr.is_empty() {
            Ok(())
        } else {
            Err(Error::Partial(perr))
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        let mut perr = PartialError::default();
        for sub in self.deliveries {
            if let Err(err) = sub.delivery.commit().await {
                fail_subdelivery(&mut perr, err, &sub.rcpts);
            }
        }
        if perr.is_empty() {
            Ok(())
        } else {
            Err(Error::Partial(perr))
        }
    }

    async fn abort(self: Box<Self>) -> Result<(), Error> {
        for sub in self.deliveries {
            if let Err(err) = sub.delivery.abort().await {
                warn!(error = %err, "sub-delivery abort failed");
            }
        }
        Ok(())
    }
}
