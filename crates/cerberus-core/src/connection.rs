//! The reactor's polymorphic connection slot (spec.md §9): every socket
//! the event loop owns, whatever its role, is dispatched through one tagged
//! variant rather than a trait object, the way `neutronium`'s endpoint
//! registry keys everything off one `ChannelId` space.

use crate::backend::BackendSession;
use crate::client::ClientSession;
use crate::updater::SlotMapUpdater;
use mio::net::TcpListener;

pub enum Connection {
    Listener(TcpListener),
    Client(ClientSession),
    Backend(BackendSession),
    Updater(SlotMapUpdater),
}
