//! Pinwall Pipeline - Kafka messaging layer for the moderation pipeline
//!
//! This library is the only coupling between the Pinwall workers. It
//! carries:
//!
//! - Lifecycle events for posts and comments on a checkpointed append log
//! - Resize and validation jobs on leased-delivery work queues
//! - Dead-lettering and redelivery policy shared by every consumer
//!
//! # Example
//!
//! ```rust,no_run
//! use pinwall_pipeline::{KafkaConfig, PinwallProducer, ResizeJob};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let producer = PinwallProducer::new(config)?;
//!
//!     let job = ResizeJob {
//!         image_id: Uuid::new_v4(),
//!         post_id: Uuid::new_v4(),
//!     };
//!     producer.enqueue_resize(&job).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod event;
pub mod producer;
pub mod queue;

// Re-export main types
pub use crate::config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, QueueConfig, ReliabilityConfig,
    SaslConfig, SaslMechanism, SecurityProtocol, SslConfig, TopicConfig,
};
pub use crate::consumer::{ConsumerError, EventHandler, EventSubscriber};
pub use crate::event::{Event, EventAction, EventError, MediaType};
pub use crate::producer::{DeliveryResult, OutgoingMessage, PinwallProducer, ProducerError};
pub use crate::queue::{
    ContentKind, JobConsumer, JobDelivery, JobHandler, QueueError, ResizeJob, ValidationJob,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{ConsumerError, EventHandler, EventSubscriber};
    pub use crate::event::{Event, EventAction, MediaType};
    pub use crate::producer::{OutgoingMessage, PinwallProducer, ProducerError};
    pub use crate::queue::{
        ContentKind, JobConsumer, JobDelivery, JobHandler, QueueError, ResizeJob, ValidationJob,
    };
}
