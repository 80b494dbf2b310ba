//! Typed named properties over devices (C12, §3.7).
//!
//! Every backend in [`crate::device`] exposes its tunables through this
//! plane rather than bespoke setters, keeping configuration knobs behind
//! a single typed accessor instead of scattering raw fields through the
//! API.

use std::collections::HashMap;
use std::fmt;

/// How much the current value of a property is to be trusted (§3.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Surety {
    /// Detected from hardware/media, or explicitly set by the user.
    Good,
    /// A guess, a compiled-in default, or a value surviving a failed
    /// detection.
    Bad,
}

/// Where a property's current value came from (§3.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Default,
    Detected,
    User,
}

/// A single property value. `Device` wraps a free-form string because
/// the device layer itself is not generic over value types; typed
/// accessors on top (e.g. [`PropertyValue::as_u64`]) parse on demand.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::UInt(u) => write!(f, "{u}"),
            PropertyValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl PropertyValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::UInt(u) => Some(*u),
            PropertyValue::Int(i) if *i >= 0 => Some(*i as u64),
            PropertyValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// One property record: id/name/type are carried implicitly by the
/// map key and the `PropertyValue` variant; what's tracked here is the
/// mutable part (§3.7).
#[derive(Debug, Clone)]
pub struct Property {
    pub value: PropertyValue,
    pub surety: Surety,
    pub source: Source,
}

impl Property {
    pub fn new(value: PropertyValue, surety: Surety, source: Source) -> Self {
        Self {
            value,
            surety,
            source,
        }
    }
}

/// Well-known property names shared by every backend (§3.7, §4.6).
pub const BLOCK_SIZE: &str = "block-size";
pub const MAX_VOLUME_USAGE: &str = "max-volume-usage";
pub const CONCURRENCY: &str = "concurrency";
pub const STREAMING: &str = "streaming";
pub const APPENDABLE: &str = "appendable";
pub const PARTIAL_DELETION: &str = "partial-deletion";
pub const FULL_DELETION: &str = "full-deletion";
pub const LEOM: &str = "leom";
pub const MEDIUM_ACCESS_TYPE: &str = "medium-access-type";

/// Ordering for `CONCURRENCY`: exclusive < shared-read < random-access
/// (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Concurrency {
    Exclusive,
    SharedRead,
    RandomAccess,
}

/// Ordering for `STREAMING`: none < desired < required (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Streaming {
    None,
    Desired,
    Required,
}

/// Medium access restriction, used for the RAIT read-only/write-only
/// conflict check (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumAccessType {
    ReadWrite,
    ReadOnly,
    WriteOnly,
    NullAccess,
}

impl MediumAccessType {
    /// Intersect two children's access types; `None` signals a
    /// read-only + write-only conflict (§4.6).
    pub fn intersect(a: MediumAccessType, b: MediumAccessType) -> Option<MediumAccessType> {
        use MediumAccessType::*;
        match (a, b) {
            (x, y) if x == y => Some(x),
            (ReadWrite, other) | (other, ReadWrite) => Some(other),
            (NullAccess, other) | (other, NullAccess) => Some(other),
            (ReadOnly, WriteOnly) | (WriteOnly, ReadOnly) => None,
            _ => Some(a),
        }
    }
}

/// Trust ranking for [`Surety`], low to high. Kept separate from the
/// derived `Ord` on `Surety` (declaration order, used for other
/// purposes) so the P7 comparison below reads as "raise" rather than
/// an enum-declaration accident.
fn trust(s: Surety) -> u8 {
    match s {
        Surety::Bad => 0,
        Surety::Good => 1,
    }
}

/// A property store, one per open device (§3.7).
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    values: HashMap<String, Property>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.values.get(name)
    }

    /// Set a property, enforcing the surety monotonicity rule (P7):
    /// a `Default`-sourced set may reduce surety but never raise it
    /// above what a prior `User`/`Detected` set already established.
    pub fn set(&mut self, name: &str, value: PropertyValue, surety: Surety, source: Source) {
        let mut surety = surety;
        if let Some(existing) = self.values.get(name) {
            if existing.source == Source::User && source != Source::User {
                // a later non-user set must not silently override an
                // explicit user choice (P7: "a subsequent get returns
                // the same value" for source=User).
                return;
            }
            if source == Source::Default && trust(surety) > trust(existing.surety) {
                // a default can only ever reduce confidence, never claim
                // more trust than what's already on record.
                surety = existing.surety;
            }
        }
        self.values.insert(name.to_string(), Property::new(value, surety, source));
    }

    /// Directly force a value regardless of prior source. Used when the
    /// device layer itself derives a value rather than receiving one
    /// from a caller, e.g. `RaitDevice::aggregate_properties` building
    /// the parent's view of `BLOCK_SIZE` from its children's.
    pub fn force(&mut self, name: &str, value: PropertyValue, surety: Surety, source: Source) {
        self.values.insert(name.to_string(), Property::new(value, surety, source));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_set_is_sticky() {
        let mut props = PropertyMap::new();
        props.set(BLOCK_SIZE, PropertyValue::UInt(65536), Surety::Good, Source::User);
        props.set(BLOCK_SIZE, PropertyValue::UInt(32768), Surety::Good, Source::Default);
        assert_eq!(
            props.get(BLOCK_SIZE).unwrap().value,
            PropertyValue::UInt(65536)
        );
    }

    #[test]
    fn default_set_still_applies_when_nothing_prior() {
        let mut props = PropertyMap::new();
        props.set(BLOCK_SIZE, PropertyValue::UInt(32768), Surety::Bad, Source::Default);
        assert_eq!(
            props.get(BLOCK_SIZE).unwrap().value,
            PropertyValue::UInt(32768)
        );
    }

    #[test]
    fn default_set_cannot_raise_surety_above_detected() {
        let mut props = PropertyMap::new();
        props.set(BLOCK_SIZE, PropertyValue::UInt(65536), Surety::Bad, Source::Detected);
        props.set(BLOCK_SIZE, PropertyValue::UInt(32768), Surety::Good, Source::Default);
        let prop = props.get(BLOCK_SIZE).unwrap();
        assert_eq!(prop.value, PropertyValue::UInt(32768));
        assert_eq!(prop.surety, Surety::Bad);
    }

    #[test]
    fn default_set_can_reduce_surety() {
        let mut props = PropertyMap::new();
        props.set(BLOCK_SIZE, PropertyValue::UInt(65536), Surety::Good, Source::Detected);
        props.set(BLOCK_SIZE, PropertyValue::UInt(32768), Surety::Bad, Source::Default);
        let prop = props.get(BLOCK_SIZE).unwrap();
        assert_eq!(prop.surety, Surety::Bad);
    }

    #[test]
    fn medium_access_conflict_detected() {
        assert_eq!(
            MediumAccessType::intersect(MediumAccessType::ReadOnly, MediumAccessType::WriteOnly),
            None
        );
        assert_eq!(
            MediumAccessType::intersect(MediumAccessType::ReadWrite, MediumAccessType::ReadOnly),
            Some(MediumAccessType::ReadOnly)
        );
    }

    #[test]
    fn concurrency_ordering() {
        assert!(Concurrency::Exclusive < Concurrency::SharedRead);
        assert!(Concurrency::SharedRead < Concurrency::RandomAccess);
    }
}
