//! # Topology runtime
//!
//! A rule runs as a [`Topology`]: a DAG of [`Node`]s connected by bounded queues.
//!
//! - [`SourceNode`] pulls records from the shared source pool;
//! - [`OperatorNode`] runs a pure operator, [`WindowNode`] the stateful window;
//! - [`SinkNode`] delivers results, optionally through the durable sink cache.

pub mod node;
pub mod operator_node;
pub mod sink_node;
pub mod source_node;
pub mod topology;
pub mod window_node;


pub use node::{Emitter, Inbox, InputStream, Item, Node, NodeContext};
pub use operator_node::OperatorNode;
pub use sink_node::SinkNode;
pub use source_node::{OFFSET_KEY, SourceNode};
pub use topology::{Topology, TopologyErrors, TopologyOptions};
pub use window_node::WindowNode;
