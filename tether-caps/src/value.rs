// Capability container: an ordered, append-only list of tagged members
use std::fmt;
use std::sync::Arc;

use crate::CapsError;

/// Kind tag of a single container member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberType {
    Integer,
    Long,
    Float,
    Double,
    String,
    Binary,
    Object,
    Void,
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberType::Integer => "integer",
            MemberType::Long => "long",
            MemberType::Float => "float",
            MemberType::Double => "double",
            MemberType::String => "string",
            MemberType::Binary => "binary",
            MemberType::Object => "object",
            MemberType::Void => "void",
        };
        f.write_str(name)
    }
}

/// One member of a [`Caps`] container.
#[derive(Debug, Clone, PartialEq)]
pub enum CapsValue {
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Object(Arc<Caps>),
    Void,
}

impl CapsValue {
    pub fn member_type(&self) -> MemberType {
        match self {
            CapsValue::Integer(_) => MemberType::Integer,
            CapsValue::Long(_) => MemberType::Long,
            CapsValue::Float(_) => MemberType::Float,
            CapsValue::Double(_) => MemberType::Double,
            CapsValue::String(_) => MemberType::String,
            CapsValue::Binary(_) => MemberType::Binary,
            CapsValue::Object(_) => MemberType::Object,
            CapsValue::Void => MemberType::Void,
        }
    }
}

/// Binary-safe message payload container.
///
/// Members are appended with the `write_*` family and read back strictly in
/// write order through a [`CapsReader`]. There is no random access: readers
/// step from member to member until [`CapsReader::next_type`] reports the end
/// of the object.
///
/// Nested objects are held behind an [`Arc`], so a container shared between
/// the producer side and the host thread is never deep-copied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Caps {
    members: Vec<CapsValue>,
}

impl Caps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.members.push(CapsValue::Integer(v));
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.members.push(CapsValue::Long(v));
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.members.push(CapsValue::Float(v));
        self
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        self.members.push(CapsValue::Double(v));
        self
    }

    pub fn write_str(&mut self, v: impl Into<String>) -> &mut Self {
        self.members.push(CapsValue::String(v.into()));
        self
    }

    pub fn write_binary(&mut self, v: impl Into<Vec<u8>>) -> &mut Self {
        self.members.push(CapsValue::Binary(v.into()));
        self
    }

    pub fn write_object(&mut self, v: Arc<Caps>) -> &mut Self {
        self.members.push(CapsValue::Object(v));
        self
    }

    pub fn write_void(&mut self) -> &mut Self {
        self.members.push(CapsValue::Void);
        self
    }

    /// Append an already-built member.
    pub fn write(&mut self, v: CapsValue) -> &mut Self {
        self.members.push(v);
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Start a step-wise read from the first member.
    pub fn reader(&self) -> CapsReader<'_> {
        CapsReader {
            members: &self.members,
            pos: 0,
        }
    }
}

// Nested objects are released from a work list so that tearing down a deep
// container does not recurse once per level.
impl Drop for Caps {
    fn drop(&mut self) {
        let mut pending: Vec<Caps> = Vec::new();
        let mut members = std::mem::take(&mut self.members);
        loop {
            for member in members.drain(..) {
                if let CapsValue::Object(obj) = member {
                    if let Ok(inner) = Arc::try_unwrap(obj) {
                        pending.push(inner);
                    }
                }
            }
            match pending.pop() {
                Some(mut next) => members = std::mem::take(&mut next.members),
                None => break,
            }
        }
    }
}

impl FromIterator<CapsValue> for Caps {
    fn from_iter<T: IntoIterator<Item = CapsValue>>(iter: T) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

/// Forward-only cursor over a [`Caps`] container.
#[derive(Debug, Clone)]
pub struct CapsReader<'a> {
    members: &'a [CapsValue],
    pos: usize,
}

impl<'a> CapsReader<'a> {
    /// Kind of the next unread member, or `None` at end-of-object.
    pub fn next_type(&self) -> Option<MemberType> {
        self.members.get(self.pos).map(CapsValue::member_type)
    }

    fn take(&mut self, expected: MemberType) -> Result<&'a CapsValue, CapsError> {
        let member = self.members.get(self.pos).ok_or(CapsError::EndOfObject)?;
        let found = member.member_type();
        if found != expected {
            return Err(CapsError::TypeMismatch { expected, found });
        }
        self.pos += 1;
        Ok(member)
    }

    pub fn read_i32(&mut self) -> Result<i32, CapsError> {
        match self.take(MemberType::Integer)? {
            CapsValue::Integer(v) => Ok(*v),
            other => Err(mismatch(MemberType::Integer, other)),
        }
    }

    pub fn read_i64(&mut self) -> Result<i64, CapsError> {
        match self.take(MemberType::Long)? {
            CapsValue::Long(v) => Ok(*v),
            other => Err(mismatch(MemberType::Long, other)),
        }
    }

    pub fn read_f32(&mut self) -> Result<f32, CapsError> {
        match self.take(MemberType::Float)? {
            CapsValue::Float(v) => Ok(*v),
            other => Err(mismatch(MemberType::Float, other)),
        }
    }

    pub fn read_f64(&mut self) -> Result<f64, CapsError> {
        match self.take(MemberType::Double)? {
            CapsValue::Double(v) => Ok(*v),
            other => Err(mismatch(MemberType::Double, other)),
        }
    }

    pub fn read_str(&mut self) -> Result<&'a str, CapsError> {
        match self.take(MemberType::String)? {
            CapsValue::String(v) => Ok(v.as_str()),
            other => Err(mismatch(MemberType::String, other)),
        }
    }

    pub fn read_binary(&mut self) -> Result<&'a [u8], CapsError> {
        match self.take(MemberType::Binary)? {
            CapsValue::Binary(v) => Ok(v.as_slice()),
            other => Err(mismatch(MemberType::Binary, other)),
        }
    }

    pub fn read_object(&mut self) -> Result<Arc<Caps>, CapsError> {
        match self.take(MemberType::Object)? {
            CapsValue::Object(v) => Ok(Arc::clone(v)),
            other => Err(mismatch(MemberType::Object, other)),
        }
    }

    pub fn read_void(&mut self) -> Result<(), CapsError> {
        self.take(MemberType::Void).map(|_| ())
    }
}

fn mismatch(expected: MemberType, found: &CapsValue) -> CapsError {
    CapsError::TypeMismatch {
        expected,
        found: found.member_type(),
    }
}
