//! One delivery attempt against a downstream target.

use postrider_common::{BodyBuffer, Delivery as _, DeliveryTarget, Error, Header, PartialError};
use postrider_spool::QueueMetadata;
use tracing::warn;

/// Run the staged protocol once for every recipient in `meta.to`,
/// classifying each as succeeded, temporarily failed or permanently failed.
///
/// Never fails as a whole: the outcome is always a [`PartialError`] (possibly
/// empty) describing this attempt.
pub(crate) async fn attempt(
    target: &dyn DeliveryTarget,
    meta: &QueueMetadata,
    header: &Header,
    body: &BodyBuffer,
) -> PartialError {
    let mut perr = PartialError::default();

    let mut delivery = match target.start(&meta.msg_meta, &meta.from).await {
        Ok(delivery) => delivery,
        Err(err) => {
            // Nothing was accepted; the whole envelope fails with one error.
            for rcpt in &meta.to {
                perr.failed.push(rcpt.clone());
                perr.errs.insert(rcpt.clone(), err.clone());
            }
            return perr;
        }
    };

    let mut accepted = Vec::new();
    for rcpt in &meta.to {
        match delivery.add_rcpt(rcpt).await {
            Ok(()) => accepted.push(rcpt.clone()),
            Err(err) => perr.push(rcpt.clone(), err),
        }
    }

    if accepted.is_empty() {
        if let Err(err) = delivery.abort().await {
            warn!(msg_id = %meta.msg_meta.id, error = %err, "delivery abort failed");
        }
        return perr;
    }

    if let Err(err) = delivery.body(header, body).await {
        expand(&mut perr, err, &accepted);
        // No accepted recipient survived; there is nothing left to commit.
        if accepted.iter().all(|rcpt| perr.errs.contains_key(rcpt)) {
            if let Err(err) = delivery.abort().await {
                warn!(msg_id = %meta.msg_meta.id, error = %err, "delivery abort failed");
            }
            return perr;
        }
    }

    if let Err(err) = delivery.commit().await {
        expand(&mut perr, err, &accepted);
    }

    perr
}

/// Fold a body/commit stage error into the attempt outcome.
///
/// A composite error already partitions recipients and is merged as-is;
/// anything else applies to every accepted recipient, classified by the
/// temporary-failure predicate.
fn expand(perr: &mut PartialError, err: Error, accepted: &[String]) {
    match err {
        Error::Partial(expanded) => perr.merge(expanded),
        err => {
            if err.is_temporary() {
                perr.temporary_failed.extend_from_slice(accepted);
            } else {
                perr.failed.extend_from_slice(accepted);
            }
            for rcpt in accepted {
                perr.errs.insert(rcpt.clone(), err.clone());
            }
        }
    }
}
