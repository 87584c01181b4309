//! # fissure-core
//!
//! A library for cracking raw bit streams into declarative data models.
//!
//! Cracking is the reverse of generation: given a tree-shaped description of
//! a format and a stream of bytes, fill in every element of the tree with the
//! bits that belong to it. This crate provides:
//! - A bit-addressable, demand-growable input stream
//! - An arena-backed element tree with size, count and offset relations
//! - A cracker that infers missing sizes from structure, tokens and offsets,
//!   resolves relations out of order, and relocates elements after the fact
//!
//! ## Architecture
//!
//! - [`stream`]: Bit streams and bit writers
//! - [`model`]: Element tree, relations and the `ElementSpec` builder
//! - [`cracker`]: The cracking driver, size scanner and placement pass
//! - [`transform`], [`constraint`], [`analyzer`]: Collaborators the cracker drives
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```
//! use fissure_core::{BitStream, Cracker, ElementSpec, Model};
//!
//! let spec = ElementSpec::block("Line")
//!     .child(ElementSpec::blob("text"))
//!     .child(ElementSpec::blob("eol").token(&b"\r\n"[..]));
//! let mut model = Model::build(spec)?;
//!
//! let mut stream = BitStream::new(b"ABC\r\nDEF");
//! let root = model.root();
//! let mut cracker = Cracker::new();
//! cracker.crack(&mut model, root, &mut stream)?;
//!
//! let text = model.find(root, "text").unwrap();
//! assert_eq!(cracker.size_of(text), Some(24));
//! assert_eq!(stream.tell_bits(), 40);
//! # Ok::<(), fissure_core::Error>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`CrackObserver`]: Receive entered/exited/failed/placed notifications
//! - [`Transform`]: Decode element content before it is cracked
//! - [`ConstraintEvaluator`]: Plug in a constraint expression language
//! - [`Analyzer`]: Restructure cracked content after the fact

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod analyzer;
pub mod constraint;
pub mod cracker;
pub mod error;
pub mod model;
pub mod stream;
pub mod transform;

// Re-export primary types for convenience
pub use analyzer::{Analyzer, DelimitedAnalyzer};
pub use constraint::{ConstraintEvaluator, SimpleEvaluator};
pub use cracker::{
    CrackEvent, CrackObserver, Cracker, CrackerConfig, EventLog, NullObserver, Position,
    PositionTable, SizeOutcome,
};
pub use error::{Error, Result};
pub use model::{ElementId, ElementKind, ElementSpec, Model};
pub use stream::{BitStream, BitWriter};
pub use transform::{Hex, Transform, Xor};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
