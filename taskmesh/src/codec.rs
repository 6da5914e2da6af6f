//! User-supplied codecs for opaque external references.
//!
//! Task payloads are opaque byte sequences, but they may reference objects
//! the byte stream cannot carry (live handles, foreign-heap values). Those
//! travel out-of-band: the caller attaches [`ExternalRef`]s to a
//! submission, the registry serializes them into extension-table entries
//! alongside the payload, and the receiving side runs the inverse hook.
//!
//! A codec is registered per class tag. When `vectorized` is set, every
//! occurrence of that class in a task is gathered into a single serializer
//! call producing one entry; the deserializer returns the list in the same
//! order. Otherwise each occurrence gets its own call and entry.
//!
//! The core never rewrites the payload itself; callers embed their own
//! placeholders; only the side-channel entries pass through here.

use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// One out-of-band entry of a task's extension table: a class tag plus the
/// serializer-produced blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtEntry {
    pub tag: String,
    pub blob: Bytes,
}

/// An opaque reference object carried alongside a payload.
///
/// `data` is whatever the registered serializer understands for `class`;
/// for unregistered classes it passes through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRef {
    pub class: String,
    pub data: Bytes,
}

impl ExternalRef {
    pub fn new(class: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            class: class.into(),
            data: data.into(),
        }
    }
}

/// Error from a user codec hook or the registry plumbing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("serializer for class {class:?} failed: {message}")]
    Serialize { class: String, message: String },

    #[error("deserializer for tag {tag:?} failed: {message}")]
    Deserialize { tag: String, message: String },
}

/// Serializer hook: receives every ref handed to one call (a single ref,
/// or all refs of the class when vectorized) and produces one blob.
pub type SerializeFn = Arc<dyn Fn(&[ExternalRef]) -> Result<Bytes, CodecError> + Send + Sync>;

/// Deserializer hook: inverse of [`SerializeFn`]; must return the refs in
/// the order they were serialized.
pub type DeserializeFn = Arc<dyn Fn(&Bytes) -> Result<Vec<ExternalRef>, CodecError> + Send + Sync>;

#[derive(Clone)]
struct Codec {
    serialize: SerializeFn,
    deserialize: DeserializeFn,
    vectorized: bool,
}

/// Thread-safe per-profile registry `{class_tag → codec}`.
///
/// Cloning is cheap and shares the underlying table, so registrations made
/// after a pool is configured are visible to it.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Arc<DashMap<String, Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the codec for a class tag.
    pub fn register(
        &self,
        tag: impl Into<String>,
        serialize: SerializeFn,
        deserialize: DeserializeFn,
        vectorized: bool,
    ) {
        self.codecs.insert(
            tag.into(),
            Codec {
                serialize,
                deserialize,
                vectorized,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    /// Serializes refs into extension-table entries.
    ///
    /// Refs of a vectorized class collapse into one entry (one serializer
    /// call over all of them, first-occurrence order); other registered
    /// classes get one entry per ref. Refs of unregistered classes pass
    /// through as-is.
    pub fn encode(&self, refs: &[ExternalRef]) -> Result<Vec<ExtEntry>, CodecError> {
        let mut entries = Vec::new();
        let mut consumed = vec![false; refs.len()];

        for (i, r) in refs.iter().enumerate() {
            if consumed[i] {
                continue;
            }
            // Clone the hooks out so no table guard is held while user
            // code runs.
            let codec = self.codecs.get(&r.class).map(|c| c.clone());
            match codec {
                Some(codec) if codec.vectorized => {
                    let mut group = Vec::new();
                    for (j, other) in refs.iter().enumerate().skip(i) {
                        if other.class == r.class {
                            consumed[j] = true;
                            group.push(other.clone());
                        }
                    }
                    let blob = (codec.serialize)(&group)?;
                    entries.push(ExtEntry {
                        tag: r.class.clone(),
                        blob,
                    });
                }
                Some(codec) => {
                    consumed[i] = true;
                    let blob = (codec.serialize)(std::slice::from_ref(r))?;
                    entries.push(ExtEntry {
                        tag: r.class.clone(),
                        blob,
                    });
                }
                None => {
                    consumed[i] = true;
                    entries.push(ExtEntry {
                        tag: r.class.clone(),
                        blob: r.data.clone(),
                    });
                }
            }
        }
        Ok(entries)
    }

    /// Runs the inverse hooks over received extension-table entries.
    ///
    /// Entries with no registered deserializer surface as opaque refs
    /// rather than failing the task.
    pub fn decode(&self, entries: &[ExtEntry]) -> Result<Vec<ExternalRef>, CodecError> {
        let mut refs = Vec::new();
        for entry in entries {
            let codec = self.codecs.get(&entry.tag).map(|c| c.clone());
            match codec {
                Some(codec) => {
                    let mut decoded = (codec.deserialize)(&entry.blob)?;
                    refs.append(&mut decoded);
                }
                None => refs.push(ExternalRef {
                    class: entry.tag.clone(),
                    data: entry.blob.clone(),
                }),
            }
        }
        Ok(refs)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("classes", &self.codecs.len())
            .finish()
    }
}
