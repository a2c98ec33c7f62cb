pub mod in_memory_queue;
pub mod queue_factory;
pub mod redis_queue;

pub use in_memory_queue::InMemoryQueue;
pub use queue_factory::QueueFactory;
pub use redis_queue::RedisQueue;
