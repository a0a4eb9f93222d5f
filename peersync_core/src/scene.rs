//! Scene-mutation capability handed to the registry.

use crate::pose::Pose;
use peersync_env::PeerId;

/// The part of a scene graph the registry is allowed to touch.
///
/// The registry calls `spawn_proxy` exactly once per peer sighting cycle and
/// hands the handle back through `despawn_proxy` when the peer leaves. Since
/// `despawn_proxy` takes the handle by value, a proxy cannot be destroyed
/// twice.
pub trait ProxyScene {
    /// Whatever the scene uses to refer to a spawned proxy.
    type Handle;

    /// Adds a proxy for `peer` at `initial`.
    fn spawn_proxy(&mut self, peer: &PeerId, initial: &Pose) -> Self::Handle;

    /// Removes a proxy, releasing its handle.
    fn despawn_proxy(&mut self, peer: &PeerId, handle: Self::Handle);

    /// Called with the freshly advanced pose of every moving proxy.
    ///
    /// Scenes that read poses from the registry at draw time can ignore this.
    fn place_proxy(&mut self, _handle: &Self::Handle, _pose: &Pose) {}
}
