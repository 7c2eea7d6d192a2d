use async_trait::async_trait;

use crate::domain::models::{Event, HandlerContext, HandlerDescriptor, HandlerError, HandlerOutput};

/// A unit of work invoked by the dispatcher for matching events.
///
/// Implementations must be cheap to describe: `describe` is called at registration and the
/// returned descriptor is stored alongside the handler. `execute` runs inside the
/// dispatcher's task under a deadline; a handler that outlives it is dropped.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Registration metadata.
    fn describe(&self) -> HandlerDescriptor;

    /// Handle one event.
    async fn execute(
        &self,
        event: &Event,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError>;
}
