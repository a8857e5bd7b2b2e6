#[cfg(test)] use mockall::automock;

use crate::connection::{ConnectionId, PacketStats};
use crate::packet::CategoryFlags;

/// Notifications from the transport to the layers above it. Callbacks are invoked from the
///  scheduler and must not block.
#[cfg_attr(test, automock)]
pub trait TransportEventListener: Send + Sync + 'static {
    /// The given categories' queues ran empty, so the upper layer may want to refill them (e.g.
    ///  with the next batch of texture or asset data)
    fn on_queue_drained(&self, connection: ConnectionId, categories: CategoryFlags);

    fn on_packet_stats(&self, connection: ConnectionId, stats: PacketStats);
}
