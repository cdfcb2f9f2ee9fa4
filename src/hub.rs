//! Channel-indexed pub/sub dispatch on top of the reassembler
//!
//! A [`Hub`] registers itself as a single packet listener and fans each
//! packet out to the [`Node`]s connected to that packet's channel. The
//! node list for a channel is copied out under the hub lock and the
//! nodes are invoked after the lock is released, so a node callback may
//! connect or disconnect nodes (including itself) without deadlocking.

use crate::protocol::Packet;
use crate::reassembler::{ListenerToken, Reassembler};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// A packet consumer attachable to a hub channel.
///
/// `process` runs synchronously on the parsing thread; implementations
/// must not block for long.
pub trait Node: Send {
    /// Consume one packet from the connected channel.
    fn process(&mut self, packet: &Packet);
}

/// Shared, lockable node handle as stored by the hub.
pub type SharedNode = Arc<Mutex<dyn Node>>;

/// Adapter turning a closure into a [`Node`].
pub struct FnNode<F: FnMut(&Packet) + Send> {
    callback: F,
}

impl<F: FnMut(&Packet) + Send> FnNode<F> {
    /// Wrap a closure as a node.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F: FnMut(&Packet) + Send + 'static> FnNode<F> {
    /// Wrap a closure as a ready-to-connect shared node.
    pub fn shared(callback: F) -> SharedNode {
        Arc::new(Mutex::new(Self::new(callback)))
    }
}

impl<F: FnMut(&Packet) + Send> Node for FnNode<F> {
    fn process(&mut self, packet: &Packet) {
        (self.callback)(packet)
    }
}

type NodeMap = Mutex<Vec<Vec<SharedNode>>>;

fn dispatch(nodes: &NodeMap, packet: &Packet) {
    let targets: Vec<SharedNode> = {
        let map = nodes.lock();
        map.get(packet.channel as usize).cloned().unwrap_or_default()
    };
    // Lock released: node callbacks may mutate the hub freely.
    for node in targets {
        node.lock().process(packet);
    }
}

/// Pub/sub fabric mapping channels to node sets.
pub struct Hub {
    engine: Arc<Reassembler>,
    nodes: Arc<NodeMap>,
    token: ListenerToken,
}

impl Hub {
    /// Attach a hub to a running reassembly engine.
    pub fn new(engine: Arc<Reassembler>) -> Result<Self> {
        let nodes: Arc<NodeMap> = Arc::new(Mutex::new(Vec::new()));
        let dispatch_nodes = Arc::clone(&nodes);
        let token =
            engine.add_packet_listener(move |packet| dispatch(&dispatch_nodes, packet))?;
        Ok(Self {
            engine,
            nodes,
            token,
        })
    }

    /// Connect a node to a channel.
    pub fn connect(&self, channel: usize, node: SharedNode) {
        let mut map = self.nodes.lock();
        if map.len() <= channel {
            map.resize_with(channel + 1, Vec::new);
        }
        map[channel].push(node);
    }

    /// Disconnect a node from a channel, matching by identity.
    pub fn disconnect(&self, channel: usize, node: &SharedNode) {
        let mut map = self.nodes.lock();
        if let Some(list) = map.get_mut(channel) {
            list.retain(|candidate| !Arc::ptr_eq(candidate, node));
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        log::info!("destroying hub");
        // Fails only when the engine is already down, which is fine.
        let _ = self.engine.remove_packet_listener(self.token);
        log::info!("hub destroyed");
    }
}
