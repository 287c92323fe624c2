//! The broadcast hub: a multicast point with one bounded queue per
//! subscriber and a configurable overflow policy, so a slow consumer only
//! ever degrades itself.

pub mod engine;
pub mod subscription;

pub use engine::{BroadcastHub, PublishReport};
pub use subscription::{CloseReason, Delivery, Subscription};
