//! Loading `.npy` files, and directories of them, into array trees

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use cushm_core::array::{byte_len, numel};
use cushm_core::{Array, DType, Tree};

const MAGIC: &[u8] = b"\x93NUMPY";
const EXTENSION: &str = "npy";

/// Element layout from the header's `descr`
#[derive(Debug, PartialEq)]
enum Descr {
    Simple(String),
    /// Structured dtype, fields in storage order
    Record(Vec<Field>),
}

#[derive(Debug, PartialEq)]
struct Field {
    name: String,
    descr: String,
    /// Sub-array shape, empty for scalar fields
    shape: Vec<usize>,
}

/// Parsed `.npy` header dictionary
#[derive(Debug, PartialEq)]
struct Header {
    descr: Descr,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Load every `.npy` file under `dir`.
///
/// Each file becomes an entry keyed by its stem, each sub-directory a group.
/// A structured array becomes a group with one array per field. Hidden
/// entries and other files are skipped.
pub fn load_dir(dir: &Path) -> Result<Tree<Array>> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut node = Tree::node();
    for entry in entries {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(path = %path.display(), "skipping non UTF-8 name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let (key, child) = if path.is_dir() {
            (name.to_string(), load_dir(&path)?)
        } else if path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
            let stem = name.trim_end_matches(".npy").to_string();
            (stem, read_npy(&path)?)
        } else {
            tracing::debug!(path = %path.display(), "skipping non-npy file");
            continue;
        };

        if node.insert(key.clone(), child).is_some() {
            bail!("'{}' appears both as a file and a directory in {}", key, dir.display());
        }
    }
    Ok(node)
}

/// Read one `.npy` file.
pub fn read_npy(path: &Path) -> Result<Tree<Array>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let tree = parse(&bytes).with_context(|| format!("Invalid .npy file: {}", path.display()))?;
    for (key, array) in tree.leaves() {
        tracing::debug!(
            path = %path.display(),
            field = %key,
            shape = ?array.shape(),
            dtype = %array.dtype(),
            "loaded array"
        );
    }
    Ok(tree)
}

fn parse(bytes: &[u8]) -> Result<Tree<Array>> {
    let rest = bytes.strip_prefix(MAGIC).context("missing NUMPY magic")?;
    let [major, _minor, rest @ ..] = rest else {
        bail!("truncated preamble");
    };
    let (header_len, rest) = match major {
        1 => match rest {
            [a, b, rest @ ..] => (u16::from_le_bytes([*a, *b]) as usize, rest),
            _ => bail!("truncated header length"),
        },
        2 | 3 => match rest {
            [a, b, c, d, rest @ ..] => (u32::from_le_bytes([*a, *b, *c, *d]) as usize, rest),
            _ => bail!("truncated header length"),
        },
        v => bail!("unsupported format version {}", v),
    };
    if rest.len() < header_len {
        bail!("truncated header");
    }
    let (header, data) = rest.split_at(header_len);
    let header = parse_header(std::str::from_utf8(header).context("header is not text")?)?;

    if header.fortran_order {
        bail!("Fortran-ordered arrays are not supported, save with C order");
    }
    match header.descr {
        Descr::Simple(descr) => {
            let dtype = dtype_of(&descr)?;
            let nbytes = byte_len(&header.shape, dtype)
                .with_context(|| format!("shape {:?} overflows", header.shape))?;
            if data.len() < nbytes {
                bail!("truncated data: need {} bytes, file has {}", nbytes, data.len());
            }
            Ok(Tree::Leaf(Array::from_bytes(header.shape, dtype, data[..nbytes].to_vec())?))
        }
        Descr::Record(fields) => split_fields(&fields, &header.shape, data),
    }
}

fn dtype_of(descr: &str) -> Result<DType> {
    DType::from_numpy_descr(descr).with_context(|| format!("unsupported dtype '{}'", descr))
}

/// Padding bytes for a `|V<n>` void field, `None` for real fields.
fn padding(descr: &str) -> Option<usize> {
    descr.strip_prefix("|V")?.parse().ok()
}

/// De-interleave records into one array per field.
fn split_fields(fields: &[Field], shape: &[usize], data: &[u8]) -> Result<Tree<Array>> {
    // (field, dtype, offset in record, bytes per record)
    let mut layout = Vec::with_capacity(fields.len());
    let mut itemsize = 0usize;
    for field in fields {
        let size = match padding(&field.descr) {
            Some(pad) => pad,
            None => {
                if field.name.is_empty() {
                    bail!("unnamed field of type '{}'", field.descr);
                }
                let dtype = dtype_of(&field.descr)?;
                let size = byte_len(&field.shape, dtype)
                    .with_context(|| format!("field '{}' overflows", field.name))?;
                layout.push((field, dtype, itemsize, size));
                size
            }
        };
        itemsize = itemsize.checked_add(size).context("record size overflows")?;
    }

    let count = numel(shape).with_context(|| format!("shape {:?} overflows", shape))?;
    let total = count.checked_mul(itemsize).context("data size overflows")?;
    if data.len() < total {
        bail!("truncated data: need {} bytes, file has {}", total, data.len());
    }

    let mut node = Tree::node();
    for (field, dtype, offset, size) in layout {
        let mut bytes = Vec::with_capacity(count * size);
        for record in data[..total].chunks_exact(itemsize.max(1)).take(count) {
            bytes.extend_from_slice(&record[offset..offset + size]);
        }
        let mut field_shape = shape.to_vec();
        field_shape.extend_from_slice(&field.shape);
        let array = Array::from_bytes(field_shape, dtype, bytes)?;
        if node.insert(field.name.clone(), Tree::Leaf(array)).is_some() {
            bail!("duplicate field '{}'", field.name);
        }
    }
    Ok(node)
}

fn parse_header(text: &str) -> Result<Header> {
    let descr = value_of(text, "descr")?;
    let descr = match descr.chars().next() {
        Some('\'' | '"') => Descr::Simple(unquote(descr)?),
        Some('[') => Descr::Record(parse_fields(descr)?),
        _ => bail!("malformed descr"),
    };

    let fortran_order = match value_of(text, "fortran_order")? {
        v if v.starts_with("True") => true,
        v if v.starts_with("False") => false,
        _ => bail!("malformed fortran_order"),
    };

    let shape = parse_shape(value_of(text, "shape")?)?;

    Ok(Header {
        descr,
        fortran_order,
        shape,
    })
}

/// Parse `[('name', '<f4'), ('sub', '<i2', (3,)), ...]`.
fn parse_fields(text: &str) -> Result<Vec<Field>> {
    let end = matching(text, '[', ']').context("unterminated field list")?;
    let list = &text[1..end];
    if list.contains('[') {
        bail!("nested structured dtypes are not supported");
    }
    split_top(list)
        .into_iter()
        .filter(|item| !item.is_empty())
        .map(|item| {
            let inner = item
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .with_context(|| format!("malformed field {}", item))?;
            let parts = split_top(inner);
            let (name, descr, shape) = match parts.as_slice() {
                [name, descr] => (name, descr, None),
                [name, descr, shape] => (name, descr, Some(shape)),
                _ => bail!("malformed field {}", item),
            };
            if name.starts_with('(') {
                bail!("titled fields are not supported");
            }
            let shape = match shape {
                None => Vec::new(),
                Some(shape) if shape.starts_with('(') => parse_shape(shape)?,
                Some(dim) => vec![dim.parse().with_context(|| format!("bad dimension '{}'", dim))?],
            };
            Ok(Field {
                name: unquote(name)?,
                descr: unquote(descr)?,
                shape,
            })
        })
        .collect()
}

/// Parse a Python tuple of dimensions such as `(3, 4)` or `(5,)`.
fn parse_shape(text: &str) -> Result<Vec<usize>> {
    let inner = text
        .strip_prefix('(')
        .and_then(|s| s.split(')').next())
        .context("malformed shape")?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.parse::<usize>().with_context(|| format!("bad dimension '{}'", dim)))
        .collect()
}

/// Contents of the quoted string at the start of `text`.
fn unquote(text: &str) -> Result<String> {
    let quote = match text.chars().next() {
        Some(quote @ ('\'' | '"')) => quote,
        _ => bail!("expected a quoted string at {}", text),
    };
    Ok(text[1..]
        .split(quote)
        .next()
        .context("unterminated string")?
        .to_string())
}

/// Index of the bracket closing the one `text` starts with.
fn matching(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, c) if c == open => depth += 1,
            (None, c) if c == close => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas outside parentheses and quotes, trimming each item.
fn split_top(text: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                items.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(text[start..].trim());
    items
}

/// Text following `'key':` in the header dictionary.
fn value_of<'a>(text: &'a str, key: &str) -> Result<&'a str> {
    let pattern = format!("'{}':", key);
    let start = text
        .find(&pattern)
        .with_context(|| format!("header has no '{}'", key))?;
    Ok(text[start + pattern.len()..].trim_start())
}
