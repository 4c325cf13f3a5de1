//! Source file spans and locations
//!
//! Every bound node carries a [`FileSpan`] pointing back at the syntax it was
//! produced from. Lowering passes must thread these through unchanged so that
//! diagnostics and sequence points keep pointing at the original source.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A unique identifier for a source file
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    /// Creates a new file id
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// A byte offset span in a source file
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Span {
    /// Start byte offset (inclusive)
    pub start: u32,
    /// End byte offset (exclusive)
    pub end: u32,
}

impl Span {
    /// Creates a new span
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// The span as a `usize` range, for slicing source text
    pub fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }

    /// Length in bytes
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    /// Whether the span covers no bytes
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Smallest span covering both `self` and `other`
    pub fn to(&self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }

    /// Whether `other` lies entirely within `self`
    pub fn contains(&self, other: Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A span with associated file
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FileSpan {
    /// File the span belongs to
    pub file: FileId,
    /// Byte span within the file
    pub span: Span,
}

impl FileSpan {
    /// Creates a new file span
    pub fn new(file: FileId, span: Span) -> Self {
        Self { file, span }
    }

    /// Zero-length span in file 0, used for synthesized nodes that have no
    /// syntax of their own
    pub fn synthesized() -> Self {
        Self::new(FileId(0), Span::new(0, 0))
    }

    /// The span as a `usize` range
    pub fn range(&self) -> Range<usize> {
        self.span.range()
    }

    /// Joins two spans in the same file; falls back to `self` across files
    pub fn to(&self, other: FileSpan) -> FileSpan {
        if self.file == other.file {
            FileSpan::new(self.file, self.span.to(other.span))
        } else {
            *self
        }
    }
}
