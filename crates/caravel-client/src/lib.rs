pub mod backoff;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod producer;
pub mod settings;
pub mod strategy;
pub mod transport;
pub mod txn;
pub mod watermark;

pub use consumer::{Consumer, ConsumerStatsSnapshot, RecordHandler};
pub use error::{Error, HandlerError, Result};
pub use memory::InMemoryBroker;
pub use pool::{ClientPool, PoolSettings, PoolStatsSnapshot};
pub use producer::{Producer, ProducerStatsSnapshot};
pub use settings::{
    ConsumerSettings, ConsumerSettingsBuilder, DeliverySemantics, ProducerSettings,
    ProducerSettingsBuilder,
};
pub use transport::{Acks, BrokerConnector, BrokerTransport, IsolationLevel, TransportConfig};
pub use txn::{TransactionalSession, TxnState, TxnStatsSnapshot};
pub use watermark::{PartitionWatermark, WatermarkMonitor};

// Message types shared with the core crate.
pub use caravel_core::{ConsumedRecord, FailureInfo, Headers, Receipt, Record, TopicPartition};
