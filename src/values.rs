//! The built-in key and value types stored in B-trees and the named
//! registry.
//!
//! Keys add a total order (and an optional prefix test) on top of
//! [`Serializable`]; values are plain serializables. All of them register
//! themselves in [`TypeRegistry::new`](crate::wire::TypeRegistry::new).

use std::any::Any;
use std::cmp::Ordering;

use crate::allocator::Ptr;
use crate::error::Result;
use crate::hash::Digest;
use crate::wire::{Reader, Serializable, TypeRegistry, WireHeader, Writer};

/// A B-tree key: a serializable with a total order among keys of one
/// concrete type.
///
/// `compare` may assume `other` has the same concrete type; a tree checks
/// the key type name in its header at open, so a mismatch is a caller bug
/// and panics.
pub trait Key: Serializable {
    fn compare(&self, other: &dyn Key) -> Ordering;

    /// Prefix test used by positioned iteration. Defaults to equality for
    /// key types without a meaningful prefix.
    fn starts_with(&self, probe: &dyn Key) -> bool {
        self.compare(probe) == Ordering::Equal
    }
}

fn expect_key<'a, T: 'static>(other: &'a dyn Key, name: &str) -> &'a T {
    match other.as_any().downcast_ref::<T>() {
        Some(key) => key,
        None => panic!("compared {} against a different key type", name),
    }
}

/// 16-byte digest key, compared bytewise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuidKey {
    pub value: [u8; 16],
}

impl GuidKey {
    pub fn new(value: [u8; 16]) -> GuidKey {
        GuidKey { value }
    }

    /// Build a key from the leading 16 bytes of a digest. Returns `None`
    /// for digests narrower than that (none of the built-in kinds are).
    pub fn from_digest(digest: &Digest) -> Option<GuidKey> {
        let bytes = digest.as_bytes();
        if bytes.len() < 16 {
            return None;
        }
        let mut value = [0u8; 16];
        value.copy_from_slice(&bytes[..16]);
        Some(GuidKey { value })
    }
}

impl From<[u8; 16]> for GuidKey {
    fn from(value: [u8; 16]) -> GuidKey {
        GuidKey { value }
    }
}

impl Serializable for GuidKey {
    fn type_name(&self) -> &'static str {
        "GuidKey"
    }

    fn size(&self) -> usize {
        16
    }

    fn write(&self, w: &mut Writer) {
        w.put_bytes(&self.value);
    }

    fn read(&mut self, _header: &WireHeader, r: &mut Reader<'_>) -> Result<()> {
        self.value.copy_from_slice(r.get_bytes(16)?);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Key for GuidKey {
    fn compare(&self, other: &dyn Key) -> Ordering {
        self.value.cmp(&expect_key::<GuidKey>(other, "GuidKey").value)
    }
}

/// String key, optionally case-folded at construction.
///
/// The fold happens once, up front; comparisons are plain byte compares of
/// the stored form, and the flag is persisted so every probe built against
/// the same tree folds the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StringKey {
    value: String,
    folded: bool,
}

impl StringKey {
    /// Case-sensitive key.
    pub fn new(value: &str) -> StringKey {
        StringKey {
            value: value.to_owned(),
            folded: false,
        }
    }

    /// Case-insensitive key; the value is folded here and never again.
    pub fn folded(value: &str) -> StringKey {
        StringKey {
            value: value.to_lowercase(),
            folded: true,
        }
    }

    /// The stored (possibly folded) form.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_folded(&self) -> bool {
        self.folded
    }
}

impl Serializable for StringKey {
    fn type_name(&self) -> &'static str {
        "StringKey"
    }

    fn size(&self) -> usize {
        1 + 4 + self.value.len()
    }

    fn write(&self, w: &mut Writer) {
        w.put_u8(self.folded as u8);
        w.put_string(&self.value);
    }

    fn read(&mut self, _header: &WireHeader, r: &mut Reader<'_>) -> Result<()> {
        self.folded = r.get_u8()? != 0;
        self.value = r.get_string()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Key for StringKey {
    fn compare(&self, other: &dyn Key) -> Ordering {
        let other = expect_key::<StringKey>(other, "StringKey");
        self.value.as_bytes().cmp(other.value.as_bytes())
    }

    fn starts_with(&self, probe: &dyn Key) -> bool {
        let probe = expect_key::<StringKey>(probe, "StringKey");
        self.value.as_bytes().starts_with(probe.value.as_bytes())
    }
}

/// Variable-size string value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringValue {
    pub value: String,
}

impl StringValue {
    pub fn new(value: &str) -> StringValue {
        StringValue {
            value: value.to_owned(),
        }
    }
}

impl Serializable for StringValue {
    fn type_name(&self) -> &'static str {
        "StringValue"
    }

    fn size(&self) -> usize {
        4 + self.value.len()
    }

    fn write(&self, w: &mut Writer) {
        w.put_string(&self.value);
    }

    fn read(&mut self, _header: &WireHeader, r: &mut Reader<'_>) -> Result<()> {
        self.value = r.get_string()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// File-offset value, the registry's bootstrap currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtrValue {
    pub value: Ptr,
}

impl PtrValue {
    pub fn new(value: Ptr) -> PtrValue {
        PtrValue { value }
    }
}

impl Serializable for PtrValue {
    fn type_name(&self) -> &'static str {
        "PtrValue"
    }

    fn size(&self) -> usize {
        8
    }

    fn write(&self, w: &mut Writer) {
        w.put_u64(self.value);
    }

    fn read(&mut self, _header: &WireHeader, r: &mut Reader<'_>) -> Result<()> {
        self.value = r.get_u64()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Element of an [`ArrayValue`].
pub trait WireItem: Clone + PartialEq + std::fmt::Debug + 'static {
    /// Registered type name of `ArrayValue<Self>`.
    const ARRAY_TYPE: &'static str;

    fn item_size(&self) -> usize;
    fn write_item(&self, w: &mut Writer);
    fn read_item(r: &mut Reader<'_>) -> Result<Self>;
}

impl WireItem for String {
    const ARRAY_TYPE: &'static str = "StringArrayValue";

    fn item_size(&self) -> usize {
        4 + self.len()
    }

    fn write_item(&self, w: &mut Writer) {
        w.put_string(self);
    }

    fn read_item(r: &mut Reader<'_>) -> Result<String> {
        r.get_string()
    }
}

impl WireItem for u64 {
    const ARRAY_TYPE: &'static str = "PtrArrayValue";

    fn item_size(&self) -> usize {
        8
    }

    fn write_item(&self, w: &mut Writer) {
        w.put_u64(*self);
    }

    fn read_item(r: &mut Reader<'_>) -> Result<u64> {
        r.get_u64()
    }
}

impl WireItem for [u8; 16] {
    const ARRAY_TYPE: &'static str = "GuidArrayValue";

    fn item_size(&self) -> usize {
        16
    }

    fn write_item(&self, w: &mut Writer) {
        w.put_bytes(self);
    }

    fn read_item(r: &mut Reader<'_>) -> Result<[u8; 16]> {
        let mut value = [0u8; 16];
        value.copy_from_slice(r.get_bytes(16)?);
        Ok(value)
    }
}

/// Length-prefixed sequence value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrayValue<T: WireItem> {
    pub value: Vec<T>,
}

impl<T: WireItem> ArrayValue<T> {
    pub fn new(value: Vec<T>) -> ArrayValue<T> {
        ArrayValue { value }
    }
}

impl<T: WireItem> Serializable for ArrayValue<T> {
    fn type_name(&self) -> &'static str {
        T::ARRAY_TYPE
    }

    fn size(&self) -> usize {
        4 + self.value.iter().map(WireItem::item_size).sum::<usize>()
    }

    fn write(&self, w: &mut Writer) {
        w.put_u32(self.value.len() as u32);
        for item in &self.value {
            item.write_item(w);
        }
    }

    fn read(&mut self, _header: &WireHeader, r: &mut Reader<'_>) -> Result<()> {
        let count = r.get_u32()?;
        let mut value = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            value.push(T::read_item(r)?);
        }
        self.value = value;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type StringArrayValue = ArrayValue<String>;
pub type PtrArrayValue = ArrayValue<u64>;
pub type GuidArrayValue = ArrayValue<[u8; 16]>;

pub(crate) fn register_builtins(registry: &mut TypeRegistry) {
    registry.register_key(|| Box::new(GuidKey::default()));
    registry.register_key(|| Box::new(StringKey::default()));
    registry.register(|| Box::new(StringValue::default()));
    registry.register(|| Box::new(PtrValue::default()));
    registry.register(|| Box::new(StringArrayValue::default()));
    registry.register(|| Box::new(PtrArrayValue::default()));
    registry.register(|| Box::new(GuidArrayValue::default()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{serialize, Endian};

    fn round_trip<T>(value: &T) -> Box<dyn Serializable>
    where
        T: Serializable,
    {
        let registry = TypeRegistry::new();
        let bytes = serialize(value, Endian::NATIVE);
        registry.deserialize(&bytes, Endian::NATIVE).unwrap()
    }

    #[test]
    fn string_value_round_trip() {
        let value = StringValue::new("elderberry");
        let back = round_trip(&value);
        assert_eq!(
            back.as_any().downcast_ref::<StringValue>().unwrap(),
            &value
        );
    }

    #[test]
    fn ptr_value_round_trip() {
        let value = PtrValue::new(0xABCD_EF01_2345);
        let back = round_trip(&value);
        assert_eq!(back.as_any().downcast_ref::<PtrValue>().unwrap(), &value);
    }

    #[test]
    fn array_values_round_trip() {
        let strings = StringArrayValue::new(vec!["node_modules".into(), ".git".into()]);
        let back = round_trip(&strings);
        assert_eq!(
            back.as_any().downcast_ref::<StringArrayValue>().unwrap(),
            &strings
        );

        let guids = GuidArrayValue::new(vec![[7u8; 16], [9u8; 16]]);
        let back = round_trip(&guids);
        assert_eq!(
            back.as_any().downcast_ref::<GuidArrayValue>().unwrap(),
            &guids
        );
    }

    #[test]
    fn keys_round_trip_through_registry() {
        let registry = TypeRegistry::new();
        for endian in [Endian::Little, Endian::Big] {
            let key = StringKey::folded("MiXeD Case");
            let bytes = serialize(&key, endian);
            let back = registry.deserialize_key(&bytes, endian).unwrap();
            assert_eq!(back.compare(&key), Ordering::Equal);
            assert!(back
                .as_any()
                .downcast_ref::<StringKey>()
                .unwrap()
                .is_folded());

            let key = GuidKey::new(*b"0123456789abcdef");
            let bytes = serialize(&key, endian);
            let back = registry.deserialize_key(&bytes, endian).unwrap();
            assert_eq!(back.compare(&key), Ordering::Equal);
        }
    }

    #[test]
    fn string_key_folding() {
        let stored = StringKey::folded("Python38");
        let probe = StringKey::folded("PYTHON");
        assert!(stored.starts_with(&probe));
        assert_eq!(stored.value(), "python38");

        let sensitive = StringKey::new("Python38");
        assert_eq!(sensitive.value(), "Python38");
        assert_ne!(
            sensitive.compare(&StringKey::new("python38")),
            Ordering::Equal
        );
    }

    #[test]
    fn guid_key_ordering() {
        let low = GuidKey::new([0u8; 16]);
        let mut high = [0u8; 16];
        high[15] = 1;
        let high = GuidKey::new(high);
        assert_eq!(low.compare(&high), Ordering::Less);
        assert_eq!(high.compare(&low), Ordering::Greater);
    }
}
