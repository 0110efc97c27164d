//! Polymorphic, reference-counted packets: the unit of data flowing on a
//! [`crate::link::Link`].

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use once_cell::sync::Lazy;

use crate::registry::Datatype;
use crate::timestamp::Timestamp;

/// Base contract every packet kind implements.
///
/// Mirrors the reference implementation's abstract `Data` base: a
/// pointer-stable datatype tag, a deep clone, a symmetric binary codec, an
/// XML debug dump, and an optional value-equality check. `Send + Sync` so a
/// packet may cross a queued link's thread boundary.
pub trait Data: fmt::Debug + Send + Sync {
    /// The datatype this packet was constructed as; pointer-equal to the
    /// registry entry it came from.
    fn datatype(&self) -> &Arc<Datatype>;

    /// Deep-copies this packet.
    fn clone_box(&self) -> Box<dyn Data>;

    /// Reads this packet's payload (not its datatype tag) from `input`.
    fn read(&mut self, input: &mut dyn io::Read) -> io::Result<()>;

    /// Writes this packet's payload (not its datatype tag) to `output`.
    fn write(&self, output: &mut dyn io::Write) -> io::Result<()>;

    /// Renders a debug XML fragment for this packet.
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Value equality, where meaningful; sentinels and types without a
    /// sensible notion of equality return `false` unconditionally.
    fn equals(&self, other: &dyn Data) -> bool;

    /// Supports downcasting to a concrete packet type.
    fn as_any(&self) -> &dyn Any;
}

/// A packet that additionally carries a time interval.
pub trait TimestampedData: Data {
    /// This packet's `[start, end)` interval.
    fn interval(&self) -> Timestamp;

    /// Overwrites this packet's interval.
    fn set_interval(&mut self, t: Timestamp);
}

/// A handle to a shared packet, as stored on a [`crate::link::Link`].
///
/// Reference counting is atomic (`Arc`) since a link between a threaded
/// producer and a consumer may hand packets across a thread boundary.
pub type PacketRef = Arc<dyn Data>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SentinelKind {
    Null,
    Eos,
    Ood,
}

#[derive(Debug)]
struct Sentinel(SentinelKind);

static SENTINEL_DATATYPE: Lazy<Arc<Datatype>> =
    Lazy::new(|| Arc::new(Datatype::new_internal("<sentinel>", || Box::new(Sentinel(SentinelKind::Null)))));

impl Data for Sentinel {
    fn datatype(&self) -> &Arc<Datatype> {
        &SENTINEL_DATATYPE
    }

    fn clone_box(&self) -> Box<dyn Data> {
        Box::new(Sentinel(self.0))
    }

    fn read(&mut self, _input: &mut dyn io::Read) -> io::Result<()> {
        Ok(())
    }

    fn write(&self, _output: &mut dyn io::Write) -> io::Result<()> {
        Ok(())
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let name = match self.0 {
            SentinelKind::Null => "null",
            SentinelKind::Eos => "eos",
            SentinelKind::Ood => "ood",
        };
        write!(out, "<sentinel kind=\"{name}\"/>")
    }

    fn equals(&self, other: &dyn Data) -> bool {
        other.as_any().downcast_ref::<Sentinel>().map(|o| o.0 == self.0).unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

static NULL_SENTINEL: Lazy<PacketRef> = Lazy::new(|| Arc::new(Sentinel(SentinelKind::Null)));
static EOS_SENTINEL: Lazy<PacketRef> = Lazy::new(|| Arc::new(Sentinel(SentinelKind::Eos)));
static OOD_SENTINEL: Lazy<PacketRef> = Lazy::new(|| Arc::new(Sentinel(SentinelKind::Ood)));

/// The empty-slot sentinel, immortal and excluded from refcount teardown.
pub fn sentinel() -> PacketRef {
    Arc::clone(&NULL_SENTINEL)
}

/// The end-of-stream sentinel.
pub fn eos() -> PacketRef {
    Arc::clone(&EOS_SENTINEL)
}

/// The out-of-data (transient stall) sentinel.
pub fn ood() -> PacketRef {
    Arc::clone(&OOD_SENTINEL)
}

/// True if `p` is the `sentinel` value, by pointer identity.
pub fn is_sentinel(p: &PacketRef) -> bool {
    Arc::ptr_eq(p, &NULL_SENTINEL)
}

/// True if `p` is the `eos` value, by pointer identity.
pub fn is_eos(p: &PacketRef) -> bool {
    Arc::ptr_eq(p, &EOS_SENTINEL)
}

/// True if `p` is the `ood` value, by pointer identity.
pub fn is_ood(p: &PacketRef) -> bool {
    Arc::ptr_eq(p, &OOD_SENTINEL)
}

/// True if `p` is any of the three sentinel values.
pub fn is_any_sentinel(p: &PacketRef) -> bool {
    is_sentinel(p) || is_eos(p) || is_ood(p)
}

/// A scalar type a [`Vector`] may hold, with a fixed-width big-endian
/// binary codec (matching the reference implementation's one-codec-per-build
/// convention: all integers/floats in one implementation share an endianness).
pub trait Scalar: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Reads one value.
    fn read_one(input: &mut dyn io::Read) -> io::Result<Self>;
    /// Writes one value.
    fn write_one(&self, output: &mut dyn io::Write) -> io::Result<()>;
}

impl Scalar for f32 {
    fn read_one(input: &mut dyn io::Read) -> io::Result<Self> {
        input.read_f32::<BigEndian>()
    }
    fn write_one(&self, output: &mut dyn io::Write) -> io::Result<()> {
        output.write_f32::<BigEndian>(*self)
    }
}

impl Scalar for f64 {
    fn read_one(input: &mut dyn io::Read) -> io::Result<Self> {
        input.read_f64::<BigEndian>()
    }
    fn write_one(&self, output: &mut dyn io::Write) -> io::Result<()> {
        output.write_f64::<BigEndian>(*self)
    }
}

impl Scalar for i16 {
    fn read_one(input: &mut dyn io::Read) -> io::Result<Self> {
        input.read_i16::<BigEndian>()
    }
    fn write_one(&self, output: &mut dyn io::Write) -> io::Result<()> {
        output.write_i16::<BigEndian>(*self)
    }
}

fn write_name(output: &mut dyn io::Write, name: &str) -> io::Result<()> {
    output.write_u32::<BigEndian>(name.len() as u32)?;
    output.write_all(name.as_bytes())
}

fn read_name(input: &mut dyn io::Read) -> io::Result<String> {
    let len = input.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn unknown_child_datatype(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("aggregate child datatype '{name}' is not registered"))
}

/// Timestamp + ordered sequence of scalar `T`: the workhorse packet kind for
/// audio samples and feature vectors.
#[derive(Debug, Clone)]
pub struct Vector<T: Scalar> {
    datatype: Arc<Datatype>,
    timestamp: Timestamp,
    /// The sample/feature values, in order.
    pub data: Vec<T>,
}

impl<T: Scalar> Vector<T> {
    /// Builds an empty vector packet tagged with `datatype`.
    pub fn new(datatype: Arc<Datatype>) -> Self {
        Vector { datatype, timestamp: Timestamp::invalid(), data: Vec::new() }
    }

    /// Builds a vector packet with an interval and contents.
    pub fn with_data(datatype: Arc<Datatype>, timestamp: Timestamp, data: Vec<T>) -> Self {
        Vector { datatype, timestamp, data }
    }
}

impl<T: Scalar> Data for Vector<T> {
    fn datatype(&self) -> &Arc<Datatype> {
        &self.datatype
    }

    fn clone_box(&self) -> Box<dyn Data> {
        Box::new(self.clone())
    }

    fn read(&mut self, input: &mut dyn io::Read) -> io::Result<()> {
        self.timestamp.start = input.read_f64::<BigEndian>()?;
        self.timestamp.end = input.read_f64::<BigEndian>()?;
        let count = input.read_u32::<BigEndian>()?;
        self.data.clear();
        self.data.reserve(count as usize);
        for _ in 0..count {
            self.data.push(T::read_one(input)?);
        }
        Ok(())
    }

    fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        output.write_f64::<BigEndian>(self.timestamp.start)?;
        output.write_f64::<BigEndian>(self.timestamp.end)?;
        output.write_u32::<BigEndian>(self.data.len() as u32)?;
        for value in &self.data {
            value.write_one(output)?;
        }
        Ok(())
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "<vector start=\"{}\" end=\"{}\">", self.timestamp.start, self.timestamp.end)?;
        for value in &self.data {
            write!(out, "{value:?} ")?;
        }
        write!(out, "</vector>")
    }

    fn equals(&self, other: &dyn Data) -> bool {
        other
            .as_any()
            .downcast_ref::<Vector<T>>()
            .map(|o| o.timestamp.approx_eq(&self.timestamp) && o.data == self.data)
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: Scalar> TimestampedData for Vector<T> {
    fn interval(&self) -> Timestamp {
        self.timestamp
    }
    fn set_interval(&mut self, t: Timestamp) {
        self.timestamp = t;
    }
}

/// Timestamp + ordered sequence of timestamped child packets, with children
/// of possibly differing datatype.
#[derive(Debug, Clone)]
pub struct Aggregate {
    datatype: Arc<Datatype>,
    timestamp: Timestamp,
    /// Children, in order; each is itself a full packet with its own
    /// interval and datatype.
    pub children: Vec<Arc<dyn Data>>,
}

impl Aggregate {
    /// Builds an aggregate with no children.
    pub fn new(datatype: Arc<Datatype>) -> Self {
        Aggregate { datatype, timestamp: Timestamp::invalid(), children: Vec::new() }
    }
}

impl Data for Aggregate {
    fn datatype(&self) -> &Arc<Datatype> {
        &self.datatype
    }

    fn clone_box(&self) -> Box<dyn Data> {
        Box::new(self.clone())
    }

    fn read(&mut self, input: &mut dyn io::Read) -> io::Result<()> {
        self.timestamp.start = input.read_f64::<BigEndian>()?;
        self.timestamp.end = input.read_f64::<BigEndian>()?;
        let homogeneous = input.read_u8()? != 0;
        let count = input.read_u32::<BigEndian>()?;
        self.children.clear();
        self.children.reserve(count as usize);
        if homogeneous {
            if count == 0 {
                return Ok(());
            }
            let name = read_name(input)?;
            let dt = crate::registry::get_datatype(&name).ok_or_else(|| unknown_child_datatype(&name))?;
            for _ in 0..count {
                self.children.push(Arc::from(dt.read_data(input)?));
            }
        } else {
            for _ in 0..count {
                let name = read_name(input)?;
                let dt = crate::registry::get_datatype(&name).ok_or_else(|| unknown_child_datatype(&name))?;
                self.children.push(Arc::from(dt.read_data(input)?));
            }
        }
        Ok(())
    }

    fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        output.write_f64::<BigEndian>(self.timestamp.start)?;
        output.write_f64::<BigEndian>(self.timestamp.end)?;
        let homogeneous = self
            .children
            .windows(2)
            .all(|pair| Arc::ptr_eq(pair[0].datatype(), pair[1].datatype()));
        output.write_u8(homogeneous as u8)?;
        output.write_u32::<BigEndian>(self.children.len() as u32)?;
        if homogeneous {
            if let Some(first) = self.children.first() {
                write_name(output, &first.datatype().name)?;
            }
            for child in &self.children {
                child.write(output)?;
            }
        } else {
            for child in &self.children {
                write_name(output, &child.datatype().name)?;
                child.write(output)?;
            }
        }
        Ok(())
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "<aggregate size=\"{}\"/>", self.children.len())
    }

    fn equals(&self, other: &dyn Data) -> bool {
        other
            .as_any()
            .downcast_ref::<Aggregate>()
            .map(|o| {
                o.timestamp.approx_eq(&self.timestamp)
                    && o.children.len() == self.children.len()
                    && o.children.iter().zip(&self.children).all(|(a, b)| a.equals(b.as_ref()))
            })
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TimestampedData for Aggregate {
    fn interval(&self) -> Timestamp {
        self.timestamp
    }
    fn set_interval(&mut self, t: Timestamp) {
        self.timestamp = t;
    }
}

/// A homogeneous aggregate: timestamp + ordered sequence of `(Timestamp, T)`.
#[derive(Debug, Clone)]
pub struct TypedAggregate<T: Scalar> {
    datatype: Arc<Datatype>,
    timestamp: Timestamp,
    /// The typed, timestamped children.
    pub children: Vec<(Timestamp, T)>,
}

impl<T: Scalar> TypedAggregate<T> {
    /// Builds an empty typed aggregate.
    pub fn new(datatype: Arc<Datatype>) -> Self {
        TypedAggregate { datatype, timestamp: Timestamp::invalid(), children: Vec::new() }
    }
}

impl<T: Scalar> Data for TypedAggregate<T> {
    fn datatype(&self) -> &Arc<Datatype> {
        &self.datatype
    }

    fn clone_box(&self) -> Box<dyn Data> {
        Box::new(self.clone())
    }

    fn read(&mut self, input: &mut dyn io::Read) -> io::Result<()> {
        self.timestamp.start = input.read_f64::<BigEndian>()?;
        self.timestamp.end = input.read_f64::<BigEndian>()?;
        let count = input.read_u32::<BigEndian>()?;
        self.children.clear();
        self.children.reserve(count as usize);
        for _ in 0..count {
            let start = input.read_f64::<BigEndian>()?;
            let end = input.read_f64::<BigEndian>()?;
            let value = T::read_one(input)?;
            self.children.push((Timestamp::new(start, end), value));
        }
        Ok(())
    }

    fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        output.write_f64::<BigEndian>(self.timestamp.start)?;
        output.write_f64::<BigEndian>(self.timestamp.end)?;
        output.write_u32::<BigEndian>(self.children.len() as u32)?;
        for (interval, value) in &self.children {
            output.write_f64::<BigEndian>(interval.start)?;
            output.write_f64::<BigEndian>(interval.end)?;
            value.write_one(output)?;
        }
        Ok(())
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "<typed-aggregate size=\"{}\"/>", self.children.len())
    }

    fn equals(&self, other: &dyn Data) -> bool {
        other
            .as_any()
            .downcast_ref::<TypedAggregate<T>>()
            .map(|o| {
                o.timestamp.approx_eq(&self.timestamp)
                    && o.children.len() == self.children.len()
                    && o.children
                        .iter()
                        .zip(&self.children)
                        .all(|(a, b)| a.0.approx_eq(&b.0) && a.1 == b.1)
            })
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: Scalar> TimestampedData for TypedAggregate<T> {
    fn interval(&self) -> Timestamp {
        self.timestamp
    }
    fn set_interval(&mut self, t: Timestamp) {
        self.timestamp = t;
    }
}

/// A typed handle onto a [`PacketRef`], supporting downcast-or-sentinel
/// access and copy-on-write mutation.
///
/// On a type mismatch the handle silently takes the [`sentinel`] value
/// rather than panicking or returning `None` for the whole handle, matching
/// the reference implementation's "downcast never null, falls back to
/// sentinel" contract.
pub struct Ref<T: Data + Clone + 'static> {
    inner: PacketRef,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Data + Clone + 'static> Ref<T> {
    /// Wraps `inner`, downcasting it to `T` or falling back to [`sentinel`]
    /// if `inner` is neither a `T` nor already a sentinel/eos/ood.
    pub fn downcast(inner: PacketRef) -> Self {
        if inner.as_any().downcast_ref::<T>().is_some() || is_any_sentinel(&inner) {
            Ref { inner, _marker: std::marker::PhantomData }
        } else {
            Ref { inner: sentinel(), _marker: std::marker::PhantomData }
        }
    }

    /// The concrete payload, if this handle holds a `T` rather than a
    /// sentinel.
    pub fn get(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// True if this handle holds any of the three sentinel values.
    pub fn is_sentinel(&self) -> bool {
        is_any_sentinel(&self.inner)
    }

    /// Copy-on-write: if more than one handle shares this packet, replaces
    /// `self` with a private clone before the caller mutates it.
    pub fn make_private(&mut self) {
        if Arc::strong_count(&self.inner) > 1 {
            if let Some(value) = self.get() {
                self.inner = Arc::new(value.clone());
            }
        }
    }

    /// Extracts an owned `T` when this handle is the sole owner of the
    /// backing packet; otherwise returns `self` unchanged. Unsized trait
    /// objects cannot be moved out of an `Arc` directly, so the sole-owner
    /// case is satisfied by cloning the payload rather than unwrapping it.
    pub fn release(self) -> Result<T, Self> {
        if Arc::strong_count(&self.inner) == 1 {
            if let Some(value) = self.get() {
                return Ok(value.clone());
            }
        }
        Err(self)
    }

    /// The underlying untyped packet reference.
    pub fn raw(&self) -> &PacketRef {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_datatype() -> Arc<Datatype> {
        Arc::new(Datatype::new_internal("test-vector-f32", || unreachable!()))
    }

    #[test]
    fn sentinels_are_pointer_stable_and_distinct() {
        assert!(is_sentinel(&sentinel()));
        assert!(is_eos(&eos()));
        assert!(is_ood(&ood()));
        assert!(!is_sentinel(&eos()));
        assert!(!is_eos(&ood()));
    }

    #[test]
    fn vector_binary_round_trip() {
        let dt = f32_datatype();
        let original = Vector::with_data(Arc::clone(&dt), Timestamp::new(0.0, 0.01), vec![1.0f32, 2.0, 3.0]);
        let mut buf = Vec::new();
        original.write(&mut buf).unwrap();

        let mut restored: Vector<f32> = Vector::new(dt);
        restored.read(&mut &buf[..]).unwrap();

        assert!(restored.equals(&original));
        assert!(original.equals(&restored));
    }

    #[test]
    fn ref_downcast_falls_back_to_sentinel_on_type_mismatch() {
        let p: PacketRef = eos();
        let r: Ref<Vector<f32>> = Ref::downcast(p);
        assert!(r.is_sentinel());
        assert!(r.get().is_none());
    }

    fn register_test_child_datatype(name: &'static str) -> Arc<Datatype> {
        let _ = crate::registry::register_datatype(name, move || {
            Box::new(Vector::<f32>::new(crate::registry::get_datatype(name).unwrap()))
        });
        crate::registry::get_datatype(name).unwrap()
    }

    fn register_test_i16_child_datatype(name: &'static str) -> Arc<Datatype> {
        let _ = crate::registry::register_datatype(name, move || {
            Box::new(Vector::<i16>::new(crate::registry::get_datatype(name).unwrap()))
        });
        crate::registry::get_datatype(name).unwrap()
    }

    #[test]
    fn aggregate_homogeneous_round_trip() {
        let child_dt = register_test_child_datatype("test-aggregate-child-f32");
        let agg_dt = Arc::new(Datatype::new_internal("test-aggregate-homogeneous", || unreachable!()));
        let mut original = Aggregate::new(Arc::clone(&agg_dt));
        original.timestamp = Timestamp::new(0.0, 2.0);
        original.children.push(Arc::new(Vector::with_data(Arc::clone(&child_dt), Timestamp::new(0.0, 1.0), vec![1.0f32, 2.0])));
        original.children.push(Arc::new(Vector::with_data(child_dt, Timestamp::new(1.0, 2.0), vec![3.0f32])));

        let mut buf = Vec::new();
        original.write(&mut buf).unwrap();

        let mut restored = Aggregate::new(agg_dt);
        restored.read(&mut &buf[..]).unwrap();

        assert_eq!(restored.children.len(), 2);
        assert!(restored.equals(&original));
        assert!(original.equals(&restored));
    }

    #[test]
    fn aggregate_heterogeneous_round_trip_tags_each_child() {
        let f32_dt = register_test_child_datatype("test-aggregate-child-f32-hetero");
        let i16_dt = register_test_i16_child_datatype("test-aggregate-child-i16-hetero");
        let agg_dt = Arc::new(Datatype::new_internal("test-aggregate-heterogeneous", || unreachable!()));
        let mut original = Aggregate::new(Arc::clone(&agg_dt));
        original.children.push(Arc::new(Vector::with_data(f32_dt, Timestamp::new(0.0, 1.0), vec![1.0f32])));
        original.children.push(Arc::new(Vector::with_data(i16_dt, Timestamp::new(1.0, 2.0), vec![7i16, 8])));

        let mut buf = Vec::new();
        original.write(&mut buf).unwrap();

        let mut restored = Aggregate::new(agg_dt);
        restored.read(&mut &buf[..]).unwrap();

        assert_eq!(restored.children.len(), 2);
        assert!(restored.equals(&original));
    }

    #[test]
    fn typed_aggregate_round_trip() {
        let dt = Arc::new(Datatype::new_internal("test-typed-aggregate", || unreachable!()));
        let mut original = TypedAggregate::<f32>::new(Arc::clone(&dt));
        original.timestamp = Timestamp::new(0.0, 2.0);
        original.children.push((Timestamp::new(0.0, 1.0), 1.5f32));
        original.children.push((Timestamp::new(1.0, 2.0), -2.25f32));

        let mut buf = Vec::new();
        original.write(&mut buf).unwrap();

        let mut restored = TypedAggregate::<f32>::new(dt);
        restored.read(&mut &buf[..]).unwrap();

        assert!(restored.equals(&original));
        assert!(original.equals(&restored));
    }

    #[test]
    fn make_private_clones_only_when_shared() {
        let dt = f32_datatype();
        let inner: PacketRef = Arc::new(Vector::with_data(dt, Timestamp::new(0.0, 1.0), vec![1.0]));
        let mut r: Ref<Vector<f32>> = Ref::downcast(Arc::clone(&inner));
        let before = Arc::as_ptr(&r.inner);
        r.make_private();
        assert!(!std::ptr::addr_eq(before, Arc::as_ptr(&r.inner)));
    }
}
