//! Fingerprints of declared input and output properties.
//!
//! A [`Fingerprint`] maps each path of a property (or the property name for
//! scalar values) to a structural kind plus a SHA-256 content digest. It is a
//! pure function of the filesystem state at call time.

mod fingerprint;
mod fingerprinter;
mod hasher;

pub use fingerprint::{
    hash_properties, EntryKind, FileChange, Fingerprint, FingerprintEntry, PathChange,
};
pub use fingerprinter::Fingerprinter;
