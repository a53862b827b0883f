//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values:
/// `Money { 12.00, USD }` equals any other `Money { 12.00, USD }`, while two
/// shipments with identical fields but different ids are still different
/// entities (see [`crate::Entity`]). To "change" a value object, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
