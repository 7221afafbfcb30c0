//! Message processors: one per client message type.
//!
//! Every processor runs in two phases. [`pre_process`](MessageProcessor::pre_process)
//! checks the message structure against the protocol rules and rejects it
//! without touching any state; [`process`](MessageProcessor::process) runs
//! the binding logic and decides whether a reply goes out.

use std::future::Future;

use tracing::debug;

use crate::error::Result;

pub mod v4;
pub mod v6;

pub trait MessageProcessor {
    type Reply;

    /// Structural validation. `false` discards the message silently.
    fn pre_process(&self) -> bool;

    /// Business logic. `Ok(false)` means no reply is sent.
    fn process(&mut self) -> impl Future<Output = Result<bool>> + Send;

    /// The finished reply, if `process` produced one.
    fn into_reply(self) -> Option<Self::Reply>;
}

/// Runs both phases and returns the reply, if one should be sent.
pub async fn execute<P>(mut processor: P) -> Result<Option<P::Reply>>
where
    P: MessageProcessor + Send,
{
    if !processor.pre_process() {
        debug!("Message failed validation, discarding");
        return Ok(None);
    }
    if !processor.process().await? {
        return Ok(None);
    }
    Ok(processor.into_reply())
}
