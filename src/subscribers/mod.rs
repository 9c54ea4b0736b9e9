//! # Event subscribers for the cluster supervisor.
//!
//! ```text
//! Bus ──► listener ──► SubscriberSet ──┬──► LogWriter (tracing)
//!                                      └──► custom (metrics, audit, tests)
//! ```

mod log;
mod set;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
