//! Size-prefixed, schema-tagged serialization of objects identified by
//! string type names.
//!
//! Every object stored in a block begins with a [`WireHeader`]
//! (`{u16 name_len}{name}{u16 version}{u32 payload_size}`) followed by a
//! type-specific payload. Readers resolve the name through a
//! [`TypeRegistry`]; the schema version is opaque to this module and handed
//! to the type's own `read`. All integers are encoded in the byte order of
//! the file they live in.

use std::any::Any;
use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::values;

/// Byte order of a store's on-disk primitive fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// The host's byte order.
    pub const NATIVE: Endian = if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    };

    pub(crate) fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    pub(crate) fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    pub(crate) fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(buf),
            Endian::Big => BigEndian::read_u64(buf),
        }
    }

    pub(crate) fn write_u16(self, buf: &mut [u8], v: u16) {
        match self {
            Endian::Little => LittleEndian::write_u16(buf, v),
            Endian::Big => BigEndian::write_u16(buf, v),
        }
    }

    pub(crate) fn write_u32(self, buf: &mut [u8], v: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(buf, v),
            Endian::Big => BigEndian::write_u32(buf, v),
        }
    }

    pub(crate) fn write_u64(self, buf: &mut [u8], v: u64) {
        match self {
            Endian::Little => LittleEndian::write_u64(buf, v),
            Endian::Big => BigEndian::write_u64(buf, v),
        }
    }
}

/// Growable output stream with a fixed byte order.
pub struct Writer {
    endian: Endian,
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(endian: Endian) -> Writer {
        Writer {
            endian,
            buf: Vec::new(),
        }
    }

    pub fn with_capacity(endian: Endian, capacity: usize) -> Writer {
        Writer {
            endian,
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        self.endian.write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        self.endian.write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        self.endian.write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// `{u32 length}{bytes}`.
    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.put_bytes(s.as_bytes());
    }
}

/// Bounds-checked input stream over a byte slice.
pub struct Reader<'a> {
    endian: Endian,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(endian: Endian, buf: &'a [u8]) -> Reader<'a> {
        Reader {
            endian,
            buf,
            pos: 0,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(Error::Corrupt("truncated serialized data"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(self.endian.read_u16(self.take(2)?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(self.endian.read_u32(self.take(4)?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(self.endian.read_u64(self.take(8)?))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Corrupt("invalid utf-8 in serialized string"))
    }
}

/// Header preceding every serialized object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    pub name: String,
    pub version: u16,
    pub payload_size: u32,
}

impl WireHeader {
    pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<WireHeader> {
        let name_len = r.get_u16()? as usize;
        let name_bytes = r.get_bytes(name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| Error::Corrupt("invalid utf-8 in serialized type name"))?
            .to_owned();
        let version = r.get_u16()?;
        let payload_size = r.get_u32()?;
        Ok(WireHeader {
            name,
            version,
            payload_size,
        })
    }
}

/// An object that can round-trip through a store block.
///
/// `size` must return the exact number of bytes `write` will produce; the
/// framework writes it into the wire header so readers can clip the payload
/// without trusting the payload itself.
pub trait Serializable: std::fmt::Debug {
    /// Registered name, written before every instance.
    fn type_name(&self) -> &'static str;

    /// Schema version handed back to `read` on the way in.
    fn version(&self) -> u16 {
        1
    }

    /// Serialized payload size in bytes.
    fn size(&self) -> usize;

    fn write(&self, w: &mut Writer);

    fn read(&mut self, header: &WireHeader, r: &mut Reader<'_>) -> Result<()>;

    /// Escape hatch for recovering the concrete type after a registry read.
    fn as_any(&self) -> &dyn Any;
}

/// Serialize one object, wire header included. Generic so that any trait
/// object whose trait extends [`Serializable`] (keys, in particular) can be
/// passed straight in.
pub fn serialize<T: Serializable + ?Sized>(obj: &T, endian: Endian) -> Vec<u8> {
    let name = obj.type_name();
    let payload_size = obj.size();
    let mut w = Writer::with_capacity(endian, 2 + name.len() + 2 + 4 + payload_size);
    w.put_u16(name.len() as u16);
    w.put_bytes(name.as_bytes());
    w.put_u16(obj.version());
    w.put_u32(payload_size as u32);
    obj.write(&mut w);
    debug_assert_eq!(w.len(), 2 + name.len() + 2 + 4 + payload_size);
    w.into_inner()
}

/// Total on-disk length of the serialized object at the start of `buf`.
pub fn serialized_len(buf: &[u8], endian: Endian) -> Result<usize> {
    let mut r = Reader::new(endian, buf);
    let header = WireHeader::read_from(&mut r)?;
    let total = r.position() + header.payload_size as usize;
    if total > buf.len() {
        return Err(Error::Corrupt("serialized object overruns its block"));
    }
    Ok(total)
}

type Factory = fn() -> Box<dyn Serializable>;
type KeyFactory = fn() -> Box<dyn crate::values::Key>;

/// Maps serialized type names to default-instance factories.
///
/// Built once before a store is opened and immutable afterwards (it is
/// handed to [`Database::open`](crate::Database::open) behind an `Arc`).
/// There is deliberately no process-wide instance; every store carries its
/// own.
pub struct TypeRegistry {
    factories: HashMap<&'static str, Factory>,
    key_factories: HashMap<&'static str, KeyFactory>,
}

impl TypeRegistry {
    /// A registry with the built-in key and value types pre-registered.
    pub fn new() -> TypeRegistry {
        let mut registry = TypeRegistry {
            factories: HashMap::new(),
            key_factories: HashMap::new(),
        };
        values::register_builtins(&mut registry);
        registry
    }

    /// Register a value type. The name is taken from a probe instance, so a
    /// factory can never be filed under the wrong name.
    pub fn register(&mut self, factory: Factory) {
        let name = factory().type_name();
        self.factories.insert(name, factory);
    }

    /// Register a key type. Keys live in their own table so reads can hand
    /// back `Box<dyn Key>` without a downcast through `Serializable`.
    pub fn register_key(&mut self, factory: KeyFactory) {
        let name = factory().type_name();
        self.key_factories.insert(name, factory);
    }

    pub fn resolve(&self, name: &str) -> Result<Box<dyn Serializable>> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(Error::UnknownType(name.to_owned())),
        }
    }

    pub fn resolve_key(&self, name: &str) -> Result<Box<dyn crate::values::Key>> {
        match self.key_factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(Error::UnknownType(name.to_owned())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name) || self.key_factories.contains_key(name)
    }

    /// Read one object, dispatching on the wire header's type name.
    pub fn deserialize(&self, buf: &[u8], endian: Endian) -> Result<Box<dyn Serializable>> {
        let mut r = Reader::new(endian, buf);
        let header = WireHeader::read_from(&mut r)?;
        let payload = r.get_bytes(header.payload_size as usize)?;
        let mut obj = self.resolve(&header.name)?;
        obj.read(&header, &mut Reader::new(endian, payload))?;
        Ok(obj)
    }

    /// Read one key object, dispatching on the wire header's type name.
    pub fn deserialize_key(
        &self,
        buf: &[u8],
        endian: Endian,
    ) -> Result<Box<dyn crate::values::Key>> {
        let mut r = Reader::new(endian, buf);
        let header = WireHeader::read_from(&mut r)?;
        let payload = r.get_bytes(header.payload_size as usize)?;
        let mut key = self.resolve_key(&header.name)?;
        key.read(&header, &mut Reader::new(endian, payload))?;
        Ok(key)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::StringValue;

    #[test]
    fn primitives_round_trip_both_orders() {
        for endian in [Endian::Little, Endian::Big] {
            let mut w = Writer::new(endian);
            w.put_u8(0xAB);
            w.put_u16(0x1234);
            w.put_u32(0xDEAD_BEEF);
            w.put_u64(0x0102_0304_0506_0708);
            w.put_string("héllo");
            let buf = w.into_inner();

            let mut r = Reader::new(endian, &buf);
            assert_eq!(r.get_u8().unwrap(), 0xAB);
            assert_eq!(r.get_u16().unwrap(), 0x1234);
            assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
            assert_eq!(r.get_u64().unwrap(), 0x0102_0304_0506_0708);
            assert_eq!(r.get_string().unwrap(), "héllo");
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn truncated_reads_fail() {
        let buf = [0u8; 3];
        let mut r = Reader::new(Endian::Little, &buf);
        assert!(matches!(r.get_u64(), Err(crate::Error::Corrupt(_))));
    }

    #[test]
    fn unknown_type_is_reported() {
        let registry = TypeRegistry::new();
        let mut w = Writer::new(Endian::Little);
        w.put_u16(6);
        w.put_bytes(b"NoSuch");
        w.put_u16(1);
        w.put_u32(0);
        let err = registry
            .deserialize(&w.into_inner(), Endian::Little)
            .unwrap_err();
        assert!(matches!(err, crate::Error::UnknownType(name) if name == "NoSuch"));
    }

    #[test]
    fn registry_round_trip() {
        let registry = TypeRegistry::new();
        let value = StringValue::new("forty-two");
        for endian in [Endian::Little, Endian::Big] {
            let bytes = serialize(&value, endian);
            assert_eq!(serialized_len(&bytes, endian).unwrap(), bytes.len());
            let back = registry.deserialize(&bytes, endian).unwrap();
            let back = back
                .as_any()
                .downcast_ref::<StringValue>()
                .expect("wrong concrete type");
            assert_eq!(back, &value);
        }
    }
}
