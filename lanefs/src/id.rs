//! Hierarchical storage identifiers.
//!
//! An [`FsId`] is a `(path, name)` pair such as `/pa/target/123/flux` where the
//! path is `/pa/target/123/` and the name is `flux`. Every series and blob is
//! addressed by one.
//!
//! Identifiers are produced in very large numbers, so the path component is
//! reference counted and can be shared through a [`PathInterner`]. Sharing is
//! purely a memory optimisation: equality, ordering and hashing only look at
//! the string contents.

use std::collections::HashSet;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CodecError, IdError, Result};

/// Maximum encoded length of either component.
const MAX_COMPONENT_LEN: usize = u16::MAX as usize;

/// A validated hierarchical identifier.
///
/// Ordering is lexicographic on the path, then the name, which makes ids
/// usable as merge keys in bulk operations.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsId {
    path: Arc<str>,
    name: Arc<str>,
}

impl FsId {
    /// Parses the full string form `path + name`.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Malformed`] if the path or name is invalid.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lanefs::id::FsId;
    ///
    /// let id = FsId::parse("/pa/flux/42")?;
    /// assert_eq!(id.path(), "/pa/flux/");
    /// assert_eq!(id.name(), "42");
    /// # Ok::<(), lanefs::FsError>(())
    /// ```
    pub fn parse(s: &str) -> Result<Self> {
        let (path, name) = split_full(s)?;
        Self::from_parts(path, name)
    }

    /// Builds an identifier from a separate path and name.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Malformed`] if either component is invalid.
    pub fn from_parts(path: &str, name: &str) -> Result<Self> {
        validate_path(path)?;
        validate_name(path, name)?;
        Ok(Self {
            path: Arc::from(path),
            name: Arc::from(name),
        })
    }

    /// Builds an identifier reusing an already validated shared path.
    fn with_shared_path(path: Arc<str>, name: &str) -> Result<Self> {
        validate_name(&path, name)?;
        Ok(Self {
            path,
            name: Arc::from(name),
        })
    }

    /// The path component, always starting and ending with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The name component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` if both ids hold the same path allocation.
    pub fn shares_path_with(&self, other: &FsId) -> bool {
        Arc::ptr_eq(&self.path, &other.path)
    }

    /// Returns `true` if this id's full string starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        if prefix.len() <= self.path.len() {
            self.path.starts_with(prefix)
        } else {
            prefix.starts_with(&*self.path) && self.name.starts_with(&prefix[self.path.len()..])
        }
    }

    /// Number of bytes [`FsId::write_to`] produces.
    pub fn encoded_len(&self) -> usize {
        4 + self.path.len() + self.name.len()
    }

    /// Writes the binary form: little-endian `u16` length plus UTF-8 bytes,
    /// first for the path then for the name.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Stream`] if the writer fails.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        for part in [&*self.path, &*self.name] {
            #[allow(clippy::cast_possible_truncation)] // validated <= u16::MAX at construction
            let len = part.len() as u16;
            out.write_all(&len.to_le_bytes()).map_err(CodecError::Stream)?;
            out.write_all(part.as_bytes()).map_err(CodecError::Stream)?;
        }
        Ok(())
    }

    /// Reads the binary form written by [`FsId::write_to`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short read or invalid UTF-8, and
    /// [`IdError::Malformed`] if the decoded text is not a valid id.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let path = read_component(input)?;
        let name = read_component(input)?;
        Self::from_parts(&path, &name)
    }

    /// Decodes an id from the front of `buf`, returning it and the number of
    /// bytes consumed.
    ///
    /// # Errors
    ///
    /// Same as [`FsId::read_from`].
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = std::io::Cursor::new(buf);
        let id = Self::read_from(&mut cursor)?;
        #[allow(clippy::cast_possible_truncation)] // cursor position is bounded by buf.len()
        let used = cursor.position() as usize;
        Ok((id, used))
    }
}

fn read_component<R: Read>(input: &mut R) -> Result<String> {
    let mut len = [0u8; 2];
    input.read_exact(&mut len).map_err(CodecError::Stream)?;
    let mut bytes = vec![0u8; usize::from(u16::from_le_bytes(len))];
    input.read_exact(&mut bytes).map_err(CodecError::Stream)?;
    String::from_utf8(bytes).map_err(|e| {
        CodecError::Frame {
            reason: format!("identifier is not UTF-8: {e}"),
        }
        .into()
    })
}

fn malformed(input: &str, reason: impl Into<String>) -> IdError {
    IdError::Malformed {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn split_full(s: &str) -> Result<(&str, &str)> {
    if !s.starts_with('/') {
        return Err(malformed(s, "must start with '/'").into());
    }
    // The leading '/' guarantees rfind succeeds.
    let cut = s.rfind('/').map_or(0, |i| i + 1);
    Ok((&s[..cut], &s[cut..]))
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-' | '+' | '@' | '=' | ',')
}

fn validate_path(path: &str) -> Result<()> {
    if path.len() > MAX_COMPONENT_LEN {
        return Err(malformed(path, "path too long").into());
    }
    if !path.starts_with('/') || !path.ends_with('/') {
        return Err(malformed(path, "path must start and end with '/'").into());
    }
    if path.len() == 1 {
        return Ok(());
    }
    for segment in path[1..path.len() - 1].split('/') {
        if segment.is_empty() {
            return Err(malformed(path, "empty path segment").into());
        }
        if let Some(bad) = segment.chars().find(|c| !is_path_char(*c)) {
            return Err(malformed(path, format!("illegal character {bad:?} in path")).into());
        }
    }
    Ok(())
}

fn validate_name(path: &str, name: &str) -> Result<()> {
    let full = || format!("{path}{name}");
    if name.is_empty() {
        return Err(malformed(&full(), "name must not be empty").into());
    }
    if name.len() > MAX_COMPONENT_LEN {
        return Err(malformed(&full(), "name too long").into());
    }
    if let Some(bad) = name
        .chars()
        .find(|c| matches!(c, '/' | '*' | '\\') || c.is_control())
    {
        return Err(malformed(&full(), format!("illegal character {bad:?} in name")).into());
    }
    Ok(())
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.path, self.name)
    }
}

impl fmt::Debug for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsId({self})")
    }
}

impl FromStr for FsId {
    type Err = crate::error::FsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for FsId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FsId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FsId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Deduplicates identifier paths so millions of ids under the same path
/// share one allocation.
///
/// The interner is an explicit value owned by whoever creates ids in bulk
/// (a backend, a test). Dropping or [clearing](PathInterner::clear) it
/// releases the cache; ids already handed out keep their paths alive.
#[derive(Debug, Default)]
pub struct PathInterner {
    paths: Mutex<HashSet<Arc<str>>>,
}

impl PathInterner {
    /// Creates an empty interner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a full identifier, sharing its path with earlier ids.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Malformed`] if the input is not a valid id.
    pub fn parse(&self, s: &str) -> Result<FsId> {
        let (path, name) = split_full(s)?;
        self.from_parts(path, name)
    }

    /// Builds an identifier from parts, sharing the path.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Malformed`] if either component is invalid.
    pub fn from_parts(&self, path: &str, name: &str) -> Result<FsId> {
        let shared = self.intern(path)?;
        FsId::with_shared_path(shared, name)
    }

    /// Decodes an id in the binary form of [`FsId::write_to`] from the front
    /// of `buf`, sharing its path. Returns the id and the bytes consumed.
    ///
    /// # Errors
    ///
    /// Same as [`FsId::read_from`].
    pub fn decode(&self, buf: &[u8]) -> Result<(FsId, usize)> {
        let mut cursor = std::io::Cursor::new(buf);
        let path = read_component(&mut cursor)?;
        let name = read_component(&mut cursor)?;
        let id = self.from_parts(&path, &name)?;
        #[allow(clippy::cast_possible_truncation)] // cursor position is bounded by buf.len()
        let used = cursor.position() as usize;
        Ok((id, used))
    }

    /// `id` with its path swapped for the shared copy.
    pub fn share(&self, id: &FsId) -> FsId {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        let path = match paths.get(&*id.path) {
            Some(existing) => Arc::clone(existing),
            None => {
                paths.insert(Arc::clone(&id.path));
                Arc::clone(&id.path)
            }
        };
        FsId {
            path,
            name: Arc::clone(&id.name),
        }
    }

    fn intern(&self, path: &str) -> Result<Arc<str>> {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = paths.get(path) {
            return Ok(Arc::clone(existing));
        }
        validate_path(path)?;
        let shared: Arc<str> = Arc::from(path);
        paths.insert(Arc::clone(&shared));
        Ok(shared)
    }

    /// Number of distinct paths currently cached.
    pub fn len(&self) -> usize {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` if no paths are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached path.
    pub fn clear(&self) {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_path_and_name() {
        let id = FsId::parse("/pa/target/123/flux").unwrap();
        assert_eq!(id.path(), "/pa/target/123/");
        assert_eq!(id.name(), "flux");
        assert_eq!(id.to_string(), "/pa/target/123/flux");
    }

    #[test]
    fn test_round_trip_through_string() {
        for s in ["/a", "/x/y:z/n-1", "/dv/planet/7.5/model fit", "/p/q/r,s/name#1"] {
            let id = FsId::parse(s).unwrap();
            assert_eq!(FsId::parse(&id.to_string()).unwrap(), id);
        }
    }

    #[test]
    fn test_malformed_inputs() {
        for bad in ["", "noslash", "/", "/a//b", "/a/b/", "/a b/c", "/a/n*", "/a/n\\x"] {
            let err = FsId::parse(bad).unwrap_err();
            assert!(
                matches!(err, crate::FsError::Id(IdError::Malformed { .. })),
                "expected malformed for {bad:?}, got {err}"
            );
        }
    }

    #[test]
    fn test_from_parts_validation() {
        assert!(FsId::from_parts("/a/", "b").is_ok());
        assert!(FsId::from_parts("a/", "b").is_err());
        assert!(FsId::from_parts("/a", "b").is_err());
        assert!(FsId::from_parts("/a/", "").is_err());
        assert!(FsId::from_parts("/a/", "b/c").is_err());
    }

    #[test]
    fn test_ordering_is_path_then_name() {
        let mut ids = vec![
            FsId::parse("/b/a").unwrap(),
            FsId::parse("/a/z").unwrap(),
            FsId::parse("/a/b/c").unwrap(),
            FsId::parse("/a/a").unwrap(),
        ];
        ids.sort();
        let strs: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(strs, vec!["/a/a", "/a/z", "/a/b/c", "/b/a"]);
    }

    #[test]
    fn test_binary_encoding() {
        let id = FsId::parse("/cal/pixels/12/row 5").unwrap();
        let mut buf = Vec::new();
        id.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), id.encoded_len());
        buf.extend_from_slice(b"trailing");

        let (decoded, used) = FsId::decode(&buf).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(used, id.encoded_len());
    }

    #[test]
    fn test_interner_shares_paths() {
        let interner = PathInterner::new();
        let a = interner.parse("/pa/flux/1").unwrap();
        let b = interner.parse("/pa/flux/2").unwrap();
        assert!(Arc::ptr_eq(&a.path, &b.path));
        assert_eq!(interner.len(), 1);

        // Shared and unshared ids compare equal.
        assert_eq!(a, FsId::parse("/pa/flux/1").unwrap());

        let mut buf = Vec::new();
        FsId::parse("/pa/flux/3").unwrap().write_to(&mut buf).unwrap();
        let (decoded, used) = interner.decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert!(decoded.shares_path_with(&a));

        let outsider = FsId::parse("/pa/flux/4").unwrap();
        assert!(!outsider.shares_path_with(&a));
        let shared = interner.share(&outsider);
        assert_eq!(shared, outsider);
        assert!(shared.shares_path_with(&a));

        interner.clear();
        assert!(interner.is_empty());
        assert_eq!(b.path(), "/pa/flux/");
    }

    #[test]
    fn test_has_prefix() {
        let id = FsId::parse("/pa/flux/42").unwrap();
        assert!(id.has_prefix("/"));
        assert!(id.has_prefix("/pa/"));
        assert!(id.has_prefix("/pa/fl"));
        assert!(id.has_prefix("/pa/flux/4"));
        assert!(!id.has_prefix("/pa/flux/5"));
        assert!(!id.has_prefix("/pb/"));
    }

    #[test]
    fn test_serde_as_string() {
        let id = FsId::parse("/a/b").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"/a/b\"");
        let back: FsId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
