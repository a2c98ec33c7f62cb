use std::sync::Arc;

use jobqueue_core::{JobQueueResult, Queue, QueueBackend, QueueConfig};
use tracing::{debug, info};

use crate::{InMemoryQueue, RedisQueue};

pub struct QueueFactory;

impl QueueFactory {
    pub async fn create(config: &QueueConfig) -> JobQueueResult<Arc<dyn Queue>> {
        debug!("Creating queue with backend: {:?}", config.backend);

        match config.backend {
            QueueBackend::Memory => {
                info!("Initializing in-memory queue");
                Ok(Arc::new(InMemoryQueue::new()))
            }
            QueueBackend::Redis => {
                info!("Initializing Redis queue");
                let queue = RedisQueue::new(config).await?;
                Ok(Arc::new(queue))
            }
        }
    }
}
