//! GPU resource wrappers.
//!
//! A [`Buffer`] or [`Texture`] pairs a backend handle with the identity the
//! state trackers key on. The wrappers own their handles; trackers and
//! barriers only ever hold [`ResourceRef`]s, so destroying a resource is a
//! matter of dropping the wrapper (usually through the device's deferred
//! release queue) and telling the global tracker to forget the id.

mod buffer;
mod texture;

pub use buffer::Buffer;
pub use texture::Texture;

use crate::state::ResourceRef;

/// A resource whose access state is tracked across command lists.
pub trait TrackedResource {
    /// Reference carried by barriers and trackers.
    fn resource_ref(&self) -> ResourceRef;

    /// Number of independently trackable subresources.
    fn subresource_count(&self) -> u32 {
        self.resource_ref().subresource_count
    }
}
