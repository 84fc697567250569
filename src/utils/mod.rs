pub mod concurrent_futures;

pub use self::concurrent_futures::ConcurrentFutures;
