pub mod backoff;
pub mod cache_padded;
pub(crate) mod panic;

pub use backoff::Backoff;
pub use cache_padded::CachePadded;

pub(crate) use panic::panic_message;
