//! Wren Proc Macros
//!
//! `#[foreign]` turns an inherent `impl` block into a foreign class
//! description the `wren` crate can bind, so scripts can construct the type
//! and call its methods.
//!
//! # Example
//!
//! ```ignore
//! use wren::{foreign, Value};
//!
//! pub struct File { /* ... */ }
//!
//! #[foreign]
//! impl File {
//!     pub fn open(path: String) -> Self { /* ... */ }
//!
//!     pub fn write(&mut self, text: String) -> Result<(), std::io::Error> { /* ... */ }
//!
//!     #[wren(name = "size")]
//!     pub fn len(&self) -> i64 { /* ... */ }
//!
//!     #[wren(ignore)]
//!     pub fn flush_all(&mut self) { /* ... */ }
//! }
//! ```

use proc_macro::TokenStream;

mod attrs;
mod foreign;

/// Expose the public functions of an inherent `impl` block to scripts.
///
/// Generates `impl wren::binder::ForeignClass` for the type.
///
/// # Members
///
/// Only `pub`, non-generic, non-`async`, non-`unsafe` functions are exposed,
/// and only when every parameter is one of `bool`, `i32`, `i64`, `f64`,
/// `String` or `Value`.
///
/// - A function without a receiver returning `Self` (or the type by name) is a
///   constructor. Candidates are tried with the most parameters first.
/// - A function without a receiver returning anything else is a static
///   method; one taking `&self` or `&mut self` is an instance method.
/// - Methods may return `()`, a supported kind, or `Result` of either. An
///   `Err` aborts the calling fiber with the error's `Display` text.
///
/// The script name is the Rust name with its first letter lower-cased and
/// `snake_case` joined into `camelCase`, so `add_ints` and `AddInts` are both
/// called as `addInts(_,_)`.
///
/// # Attributes
///
/// - `#[foreign(name = "...")]` - Override the class name
/// - `#[wren(name = "...")]` - Override a member's script name
/// - `#[wren(ignore)]` - Leave a public function out
#[proc_macro_attribute]
pub fn foreign(attr: TokenStream, item: TokenStream) -> TokenStream {
    foreign::foreign_impl(attr, item)
}
