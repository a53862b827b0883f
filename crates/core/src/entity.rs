//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Collaborator records owned by other parts of the order system (shipments,
/// stock items) are entities: two snapshots with the same id describe the same
/// thing even when their other fields differ.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
