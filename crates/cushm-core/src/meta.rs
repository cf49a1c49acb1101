//! Segment descriptors and the metadata tree persisted in project records

use crate::array::{byte_len, numel, overflow, Array};
use crate::dtype::DType;
use crate::shm::SharedMemory;
use crate::tree::{join, Tree};
use crate::view::{AccessMode, ArrayView};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Key marking a record table as a segment descriptor.
const LEAF_MARKER: &str = "public_name";

/// Bytes actually allocated for an array of `nbytes`.
///
/// The OS refuses zero-sized mappings, so empty arrays get one byte.
pub const fn segment_len(nbytes: usize) -> usize {
    if nbytes == 0 {
        1
    } else {
        nbytes
    }
}

/// Scalar attribute attached to an array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{}", v),
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v.into())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

/// Everything needed to find a segment and view it as a typed array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Stable name other processes open the segment by
    pub public_name: String,
    /// Identity the segment was created under by the OS
    pub private_name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    /// Fields written by newer versions, kept as-is
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl SegmentDescriptor {
    /// Describe `array` stored in `shm`.
    pub fn new(shm: &SharedMemory, array: &Array) -> Self {
        Self {
            public_name: shm.name().to_string(),
            private_name: shm.os_id().to_string(),
            shape: array.shape().to_vec(),
            dtype: array.dtype(),
            attrs: array.attrs().clone(),
            extra: toml::Table::new(),
        }
    }

    /// Element count
    pub fn numel(&self) -> Result<usize> {
        numel(&self.shape).ok_or_else(|| overflow(&self.shape, self.dtype))
    }

    /// Size of the described array in bytes
    pub fn nbytes(&self) -> Result<usize> {
        byte_len(&self.shape, self.dtype).ok_or_else(|| overflow(&self.shape, self.dtype))
    }
}

/// Tree of segment descriptors, the content of a project record.
pub type MetadataTree = Tree<SegmentDescriptor>;

fn malformed(reason: impl Into<String>) -> Error {
    Error::Malformed {
        path: PathBuf::new(),
        reason: reason.into(),
    }
}

impl Tree<SegmentDescriptor> {
    /// Publish every leaf of `arrays` through `allocate`.
    ///
    /// `allocate` receives the key path of each leaf and must return the
    /// filled segment plus its descriptor. Handles come back in depth-first
    /// order. If any allocation fails the segments created so far are
    /// dropped, which removes them while they still hold auto-cleanup
    /// authority.
    pub fn from_arrays<F>(arrays: &Tree<Array>, mut allocate: F) -> Result<(Self, Vec<SharedMemory>)>
    where
        F: FnMut(&str, &Array) -> Result<(SegmentDescriptor, SharedMemory)>,
    {
        let mut handles = Vec::with_capacity(arrays.leaf_count());
        let tree = build(arrays, "", &mut allocate, &mut handles)?;
        Ok((tree, handles))
    }

    /// Open and bind every leaf.
    ///
    /// Leaves that fail keep their error in place; siblings are still
    /// visited so the caller sees everything that could be attached.
    pub fn to_views(&self, mode: AccessMode) -> Tree<Result<ArrayView>> {
        self.map_with_path(&mut |path, descriptor| open_view(path, descriptor, mode))
    }

    /// Total bytes of all described arrays.
    pub fn nbytes(&self) -> Result<usize> {
        self.leaves().iter().try_fold(0usize, |total, (key, d)| {
            total.checked_add(d.nbytes()?).ok_or_else(|| {
                Error::InvalidShape(format!("total size overflows at '{}'", key))
            })
        })
    }

    /// Encode as the TOML text stored in a project record.
    pub fn to_toml_string(&self) -> Result<String> {
        let table = match self {
            Tree::Node(_) => to_table(self)?,
            Tree::Leaf(_) => {
                return Err(Error::InvalidShape(
                    "a record root must be a group, not a single array".to_string(),
                ))
            }
        };
        toml::to_string(&table).map_err(|e| Error::InvalidShape(e.to_string()))
    }

    /// Decode a project record.
    ///
    /// A table is a leaf exactly when it carries a string `public_name`.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = text.parse().map_err(|e: toml::de::Error| malformed(e.message()))?;
        from_table(table, "")
    }
}

fn build<F>(
    arrays: &Tree<Array>,
    path: &str,
    allocate: &mut F,
    handles: &mut Vec<SharedMemory>,
) -> Result<MetadataTree>
where
    F: FnMut(&str, &Array) -> Result<(SegmentDescriptor, SharedMemory)>,
{
    match arrays {
        Tree::Leaf(array) => {
            let (descriptor, shm) = allocate(path, array)?;
            handles.push(shm);
            Ok(Tree::Leaf(descriptor))
        }
        Tree::Node(children) => {
            let mut node = BTreeMap::new();
            for (key, child) in children {
                let subtree = build(child, &join(path, key), allocate, handles)?;
                node.insert(key.clone(), subtree);
            }
            Ok(Tree::Node(node))
        }
    }
}

fn open_view(path: &str, descriptor: &SegmentDescriptor, mode: AccessMode) -> Result<ArrayView> {
    let shm = SharedMemory::open(&descriptor.public_name).map_err(|e| match e {
        Error::NotFound(_) => Error::SegmentMissing(path.to_string()),
        other => other,
    })?;
    let expected = segment_len(descriptor.nbytes()?);
    if shm.size() != expected {
        return Err(Error::SizeMismatch {
            key: path.to_string(),
            expected,
            actual: shm.size(),
        });
    }
    ArrayView::bind(shm, descriptor.shape.clone(), descriptor.dtype, mode)
}

fn to_table(tree: &MetadataTree) -> Result<toml::Table> {
    let mut table = toml::Table::new();
    if let Tree::Node(children) = tree {
        for (key, child) in children {
            let value = match child {
                Tree::Leaf(descriptor) => toml::Value::try_from(descriptor)
                    .map_err(|e| Error::InvalidShape(format!("{}: {}", key, e)))?,
                Tree::Node(_) => toml::Value::Table(to_table(child)?),
            };
            table.insert(key.clone(), value);
        }
    }
    Ok(table)
}

fn from_table(table: toml::Table, path: &str) -> Result<MetadataTree> {
    let mut node = BTreeMap::new();
    for (key, value) in table {
        let key_path = join(path, &key);
        let toml::Value::Table(inner) = value else {
            return Err(malformed(format!(
                "'{}' is neither an array descriptor nor a group",
                key_path
            )));
        };
        let child = if matches!(inner.get(LEAF_MARKER), Some(toml::Value::String(_))) {
            let descriptor: SegmentDescriptor = toml::Value::Table(inner)
                .try_into()
                .map_err(|e: toml::de::Error| malformed(format!("'{}': {}", key_path, e.message())))?;
            descriptor
                .nbytes()
                .map_err(|e| malformed(format!("'{}': {}", key_path, e)))?;
            Tree::Leaf(descriptor)
        } else {
            from_table(inner, &key_path)?
        };
        node.insert(key, child);
    }
    Ok(Tree::Node(node))
}
