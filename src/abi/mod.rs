//! Calling-convention rules and parameter marshalling.
//!
//! This module owns everything between "the core stopped at an intercepted
//! address" and "hooks see typed, named arguments":
//!
//! - [`CallingConvention`]: per-convention argument slot sequencing, stack
//!   cleanup responsibility and return-value location
//! - [`ParamSpec`] / [`ParamKind`]: the ordered, typed parameter declaration
//!   a hook registration supplies
//! - [`ResolvedParams`]: the decoded, mutable name → value view hooks operate
//!   on, with enough slot bookkeeping to re-encode mutations in place
//! - [`resolve`] / [`commit`]: the two directions of the marshalling layer
//! - [`VariadicCursor`]: the frozen-cursor protocol for trailing arguments
//!   whose count and types are only known after inspecting earlier ones
//!
//! A caller-declared convention that disagrees with what the binary actually
//! uses is undetectable from the data; resolution then produces garbage
//! values by design and nothing here attempts to detect or repair that.

mod convention;
mod params;
mod resolver;

pub use convention::{ArgSlot, CallingConvention, SlotCursor, StackCleanup};
pub use params::{ParamKind, ParamSpec, ParamValue, ResolvedParams};
pub use resolver::{commit, resolve, VariadicCursor};
