//! Test doubles.
//!
//! [`MockCluster`] is a whole cluster behind the
//! [`Transport`](crate::network::Transport) seam: hand its
//! [`transport`](MockCluster::transport) to `Producer::with_transport`,
//! `Consumer::with_transport` or `Admin::with_transport` and the real client
//! code runs against it, including rebalances, leader moves and injected
//! faults. [`MockProducer`] and [`MockConsumer`] replace the clients
//! themselves for code that only needs something to send to or read from.

mod cluster;
mod doubles;
mod group;

pub use cluster::MockCluster;
pub use doubles::{MockConsumer, MockProducer};
pub use group::GroupState;
