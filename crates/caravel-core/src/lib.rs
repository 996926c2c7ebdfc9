pub mod backpressure;
pub mod error;
pub mod hash;
pub mod message;

pub use backpressure::{BoundedQueue, QueueStatsSnapshot};
pub use error::{Error, Result};
pub use message::{
    ConsumedRecord, FailureInfo, Headers, Receipt, Record, TopicPartition, HEADER_CORRELATION_ID,
    HEADER_FAILURE_AT, HEADER_FAILURE_ATTEMPTS, HEADER_FAILURE_ERROR_MESSAGE,
    HEADER_FAILURE_ERROR_TYPE, HEADER_FAILURE_OFFSET, HEADER_FAILURE_PARTITION,
    HEADER_FAILURE_TOPIC, HEADER_IDEMPOTENCE_KEY, HEADER_PRODUCED_AT, HEADER_TRACE_ID,
};
