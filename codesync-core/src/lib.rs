//! # codesync-core: edit algebra for collaborative text editing
//!
//! An [`Operation`] is an ordered list of retain / insert / delete steps.
//! The [`transform`] module applies operations to text, composes two
//! causally ordered operations into one, and compacts redundant steps.
//!
//! ```
//! use codesync_core::Operation;
//!
//! let op = Operation::new().retain(5).insert("X").delete(2);
//! assert_eq!(op.apply("helloworld").unwrap(), "helloXrld");
//! ```
//!
//! Everything in this crate is synchronous and free of I/O.

pub mod error;
pub mod operation;
pub mod transform;

pub use error::OtError;
pub use operation::{Operation, Step};
pub use transform::{apply, compact, compose};
