use async_trait::async_trait;

use crate::model::CoreId;
use crate::units::Nanosecs;

/// An interface to the machine running the experiment, real or simulated.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Loads a packed command stream onto a core.
    async fn load(&self, core: CoreId, program: &[u8]) -> Result<(), TransportError>;

    /// Starts every listed core. The cores run for `duration` and then stop on their own.
    async fn start(&self, cores: &[CoreId], duration: Nanosecs) -> Result<(), TransportError>;

    /// Reads back the counter block of a core that has finished running.
    async fn read_counters(&self, core: CoreId) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn load(&self, core: CoreId, program: &[u8]) -> Result<(), TransportError> {
        (**self).load(core, program).await
    }

    async fn start(&self, cores: &[CoreId], duration: Nanosecs) -> Result<(), TransportError> {
        (**self).start(cores, duration).await
    }

    async fn read_counters(&self, core: CoreId) -> Result<Vec<u8>, TransportError> {
        (**self).read_counters(core).await
    }
}

/// Transport error. All of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("core {0} is unreachable")]
    Unreachable(CoreId),

    #[error("no answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("core {core} rejected the request: {reason}")]
    Rejected { core: CoreId, reason: String },

    #[error("IO error")]
    Io(#[from] std::io::Error),
}
