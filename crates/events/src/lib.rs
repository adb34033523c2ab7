//! Change notification fan-out (mechanics only).
//!
//! The write service publishes a `ChangeNotice` for every row touched by a
//! committed batch. Transports live behind the `Publisher` trait: this crate
//! ships an in-memory implementation, infrastructure crates add Redis etc.

pub mod bus;
pub mod in_memory_bus;
pub mod notice;

pub use bus::{Published, PublishError, Publisher, Subscription};
pub use in_memory_bus::InMemoryPublisher;
pub use notice::{ChangeNotice, record_key};
