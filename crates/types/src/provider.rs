use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Context, ProviderError, ProviderId, StreamEvent};

/// Receiving half of one streamed turn. The channel closes after the
/// terminator, after a transport failure, or when the transport ends.
pub type ProviderStream = mpsc::Receiver<Result<StreamEvent, ProviderError>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_id(&self) -> &ProviderId;

    async fn stream(
        &self,
        context: &Context,
        buffer_size: usize,
    ) -> Result<ProviderStream, ProviderError>;
}
