//! Core data structures and types for the triple indexer

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier space of a string. Entities and relations are numbered independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Space {
    Entity,
    Relation,
}

impl Space {
    /// Name used for files and tables belonging to this space.
    pub fn name(self) -> &'static str {
        match self {
            Space::Entity => "entities",
            Space::Relation => "relations",
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer-indexed triple, the unit written to the output array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedTriple {
    pub subject: u64,  // 8 bytes - entity id
    pub relation: u64, // 8 bytes - relation id
    pub object: u64,   // 8 bytes - entity id
}

/// Where the reader stands in the input file. Recorded after every chunk so a
/// later run can reopen the file at the same place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPosition {
    /// Byte offset of the first unread line
    pub byte_offset: u64,
    /// Number of lines consumed so far (including malformed and blank ones)
    pub line: u64,
    /// Number of triples accepted so far
    pub rows: u64,
    /// Number of chunks produced so far
    pub chunks: u64,
}

/// A columnar batch of triples, the unit of deduplication, memory accounting
/// and checkpointing.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Zero-based chunk counter, continuing across resumed runs
    pub index: u64,
    pub subjects: Vec<String>,
    pub relations: Vec<String>,
    pub objects: Vec<String>,
    /// Position right after the last line of this chunk
    pub end: ReadPosition,
    /// Lines in this chunk that did not contain three tokens
    pub malformed: u64,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn push(&mut self, subject: &str, relation: &str, object: &str) {
        self.subjects.push(subject.to_string());
        self.relations.push(relation.to_string());
        self.objects.push(object.to_string());
    }

    /// Unique entity strings over the subject and object columns, in order of
    /// first appearance (row by row, subject before object).
    pub fn unique_entities(&self) -> Vec<&str> {
        let mut seen = HashSet::with_capacity(self.len() * 2);
        let mut unique = Vec::new();
        for (subject, object) in self.subjects.iter().zip(&self.objects) {
            for value in [subject.as_str(), object.as_str()] {
                if seen.insert(value) {
                    unique.push(value);
                }
            }
        }
        unique
    }

    /// Unique relation strings in order of first appearance.
    pub fn unique_relations(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.relations.iter().map(String::as_str).filter(|r| seen.insert(*r)).collect()
    }

    /// Rough heap footprint of the string columns.
    pub fn estimated_bytes(&self) -> usize {
        [&self.subjects, &self.relations, &self.objects]
            .iter()
            .flat_map(|column| column.iter())
            .map(|s| s.capacity() + std::mem::size_of::<String>())
            .sum()
    }
}

pub mod digest;
pub mod encoding;
pub use digest::digest;
pub use encoding::*;
