//! Structured values exchanged with PVA servers.
//!
//! PVA transfers structured data: a tree of named fields whose leaves are
//! scalars. A *prototype* is such a tree with no leaf data set, and is what
//! a server communicates at operation INIT time; subsequent data replies
//! are decoded against it. This module models the tree, per-leaf set/unset
//! state, and the scalar conversions used when copying user-supplied
//! values into a server-defined type.

use std::fmt;

use num::NumCast;

use crate::error::Error;

/// The scalar types supported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    Int32,
    UInt32,
    Float64,
    String,
}

/// A single scalar datum.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Float64(f64),
    String(String),
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::Int32(_) => ScalarKind::Int32,
            Scalar::UInt32(_) => ScalarKind::UInt32,
            Scalar::Float64(_) => ScalarKind::Float64,
            Scalar::String(_) => ScalarKind::String,
        }
    }

    /// Convert to another scalar kind.
    ///
    /// Numeric kinds convert through [`num::NumCast`] and fail when the
    /// value is not representable in the target. Strings parse from and
    /// format to their usual textual form. Bool maps to 0/1 numerically.
    pub fn convert_to(&self, kind: ScalarKind) -> Result<Scalar, Error> {
        fn cast<T: NumCast + Copy, U: NumCast>(v: T) -> Result<U, Error> {
            NumCast::from(v).ok_or_else(|| Error::Conversion("value out of range".into()))
        }
        fn parse<T: std::str::FromStr>(s: &str) -> Result<T, Error> {
            s.parse()
                .map_err(|_| Error::Conversion(format!("cannot parse '{s}'")))
        }

        if self.kind() == kind {
            return Ok(self.clone());
        }
        Ok(match (self, kind) {
            (Scalar::Bool(b), ScalarKind::Int32) => Scalar::Int32(*b as i32),
            (Scalar::Bool(b), ScalarKind::UInt32) => Scalar::UInt32(*b as u32),
            (Scalar::Bool(b), ScalarKind::Float64) => Scalar::Float64(*b as u8 as f64),
            (Scalar::Bool(b), ScalarKind::String) => Scalar::String(b.to_string()),
            (Scalar::Int32(v), ScalarKind::Bool) => Scalar::Bool(*v != 0),
            (Scalar::Int32(v), ScalarKind::UInt32) => Scalar::UInt32(cast(*v)?),
            (Scalar::Int32(v), ScalarKind::Float64) => Scalar::Float64(cast(*v)?),
            (Scalar::Int32(v), ScalarKind::String) => Scalar::String(v.to_string()),
            (Scalar::UInt32(v), ScalarKind::Bool) => Scalar::Bool(*v != 0),
            (Scalar::UInt32(v), ScalarKind::Int32) => Scalar::Int32(cast(*v)?),
            (Scalar::UInt32(v), ScalarKind::Float64) => Scalar::Float64(cast(*v)?),
            (Scalar::UInt32(v), ScalarKind::String) => Scalar::String(v.to_string()),
            (Scalar::Float64(v), ScalarKind::Bool) => Scalar::Bool(*v != 0.0),
            (Scalar::Float64(v), ScalarKind::Int32) => Scalar::Int32(cast(*v)?),
            (Scalar::Float64(v), ScalarKind::UInt32) => Scalar::UInt32(cast(*v)?),
            (Scalar::Float64(v), ScalarKind::String) => Scalar::String(v.to_string()),
            (Scalar::String(s), ScalarKind::Bool) => Scalar::Bool(parse(s)?),
            (Scalar::String(s), ScalarKind::Int32) => Scalar::Int32(parse(s)?),
            (Scalar::String(s), ScalarKind::UInt32) => Scalar::UInt32(parse(s)?),
            (Scalar::String(s), ScalarKind::Float64) => Scalar::Float64(parse(s)?),
            _ => unreachable!("same-kind handled above"),
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.convert_to(ScalarKind::Float64) {
            Ok(Scalar::Float64(v)) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self.convert_to(ScalarKind::Int32) {
            Ok(Scalar::Int32(v)) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A node in a structured value tree.
///
/// Scalar leaves distinguish "set" from "unset": a prototype has every
/// leaf unset, and a partial assignment (as produced by a put builder)
/// sets only the leaves it touches.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar {
        kind: ScalarKind,
        store: Option<Scalar>,
    },
    Struct {
        id: String,
        fields: Vec<(String, Value)>,
    },
}

impl Value {
    /// An unset scalar leaf of the given kind.
    pub fn scalar(kind: ScalarKind) -> Value {
        Value::Scalar { kind, store: None }
    }

    /// A structure with the given type id and ordered fields.
    pub fn structure(id: impl Into<String>, fields: Vec<(String, Value)>) -> Value {
        Value::Struct {
            id: id.into(),
            fields,
        }
    }

    /// The empty structure, e.g. a successful PUT's result payload.
    pub fn empty() -> Value {
        Value::Struct {
            id: String::new(),
            fields: Vec::new(),
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Value::Struct { .. })
    }

    /// The structure type id, empty for scalars.
    pub fn type_id(&self) -> &str {
        match self {
            Value::Struct { id, .. } => id,
            Value::Scalar { .. } => "",
        }
    }

    /// Same tree shape with every leaf unset.
    pub fn clone_empty(&self) -> Value {
        match self {
            Value::Scalar { kind, .. } => Value::Scalar {
                kind: *kind,
                store: None,
            },
            Value::Struct { id, fields } => Value::Struct {
                id: id.clone(),
                fields: fields
                    .iter()
                    .map(|(n, v)| (n.clone(), v.clone_empty()))
                    .collect(),
            },
        }
    }

    /// Look up a field by dotted path, e.g. `"query.lhs"`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut cur = self;
        for part in path.split('.') {
            let Value::Struct { fields, .. } = cur else {
                return None;
            };
            cur = fields.iter().find(|(n, _)| n == part).map(|(_, v)| v)?;
        }
        Some(cur)
    }

    pub fn field_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut cur = self;
        for part in path.split('.') {
            let Value::Struct { fields, .. } = cur else {
                return None;
            };
            cur = fields
                .iter_mut()
                .find(|(n, _)| n == part)
                .map(|(_, v)| v)?;
        }
        Some(cur)
    }

    /// The set scalar at a dotted path, if any.
    pub fn get(&self, path: &str) -> Option<&Scalar> {
        match self.field(path)? {
            Value::Scalar { store, .. } => store.as_ref(),
            Value::Struct { .. } => None,
        }
    }

    /// Assign a scalar into the leaf at `path`, converting to the leaf's
    /// kind. Fails on missing path, non-leaf target, or inconvertible
    /// value.
    pub fn set(&mut self, path: &str, value: impl Into<Scalar>) -> Result<(), Error> {
        let value = value.into();
        let fld = self
            .field_mut(path)
            .ok_or_else(|| Error::Conversion(format!("no such field '{path}'")))?;
        fld.assign_scalar(&value)
    }

    /// Assign a scalar into this leaf, converting to this leaf's kind.
    pub fn assign_scalar(&mut self, value: &Scalar) -> Result<(), Error> {
        match self {
            Value::Scalar { kind, store } => {
                *store = Some(value.convert_to(*kind)?);
                Ok(())
            }
            Value::Struct { .. } => Err(Error::Conversion(
                "cannot assign a scalar to a structure".into(),
            )),
        }
    }

    /// Assign from another value. Scalar sources convert into this leaf;
    /// a struct source assigns field-by-field onto matching names.
    pub fn assign(&mut self, src: &Value) -> Result<(), Error> {
        match src {
            Value::Scalar { store, .. } => match store {
                Some(s) => self.assign_scalar(s),
                None => Ok(()),
            },
            Value::Struct { fields, .. } => {
                for (name, v) in fields {
                    if let Some(dst) = self.field_mut(name) {
                        dst.assign(v)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Scalar leaves in depth-first field order.
    pub(crate) fn leaves(&self) -> Vec<&Value> {
        fn walk<'a>(v: &'a Value, out: &mut Vec<&'a Value>) {
            match v {
                Value::Scalar { .. } => out.push(v),
                Value::Struct { fields, .. } => {
                    for (_, f) in fields {
                        walk(f, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }

    pub(crate) fn leaves_mut(&mut self) -> Vec<&mut Value> {
        fn walk<'a>(v: &'a mut Value, out: &mut Vec<&'a mut Value>) {
            match v {
                Value::Scalar { .. } => out.push(v),
                Value::Struct { fields, .. } => {
                    for (_, f) in fields {
                        walk(f, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int32(v) => write!(f, "{v}"),
            Scalar::UInt32(v) => write!(f, "{v}"),
            Scalar::Float64(v) => write!(f, "{v}"),
            Scalar::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Scalar {
        Scalar::Bool(v)
    }
}
impl From<i32> for Scalar {
    fn from(v: i32) -> Scalar {
        Scalar::Int32(v)
    }
}
impl From<u32> for Scalar {
    fn from(v: u32) -> Scalar {
        Scalar::UInt32(v)
    }
}
impl From<f64> for Scalar {
    fn from(v: f64) -> Scalar {
        Scalar::Float64(v)
    }
}
impl From<&str> for Scalar {
    fn from(v: &str) -> Scalar {
        Scalar::String(v.to_string())
    }
}
impl From<String> for Scalar {
    fn from(v: String) -> Scalar {
        Scalar::String(v)
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Value {
        Value::Scalar {
            kind: s.kind(),
            store: Some(s),
        }
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Scalar::from(v).into()
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Scalar::from(v).into()
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Scalar::from(v).into()
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Scalar::from(v).into()
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Scalar::from(v).into()
    }
}
impl From<String> for Value {
    fn from(v: String) -> Value {
        Scalar::from(v).into()
    }
}
