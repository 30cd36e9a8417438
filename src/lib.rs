// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # wintercept
//!
//! API interception and dispatch runtime for user-mode Windows binary
//! emulation. `wintercept` sits between an external CPU-emulation core and
//! hook callbacks written by the host program: whenever the guest program
//! counter reaches a registered API address, the runtime decodes the call's
//! arguments per its calling convention, runs the hook chain, writes back any
//! mutations and sequences the guest onto its return address, all without
//! the core ever executing the API's real code.
//!
//! ## Features
//!
//! - **Convention-aware marshalling** - cdecl, stdcall, fastcall and the
//!   Microsoft x64 convention, including shadow space and cleanup sides
//! - **Three-stage hook chains** - Enter, Call and Exit callbacks per
//!   address, with parameter and return-value mutation
//! - **Variadic arguments** - a frozen-cursor protocol for `printf`-style
//!   APIs whose trailing argument count is only known at dispatch time
//! - **Cooperative guest threads** - deterministic round-robin scheduling
//!   atop the single-threaded core
//! - **Persisted export cache** - parsed library metadata reused across runs,
//!   validated by content fingerprint and safely rebuilt on corruption
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use wintercept::prelude::*;
//!
//! # fn main() -> wintercept::Result<()> {
//! let mut session = Session::new(SessionConfig::win32());
//!
//! // Export view normally produced by the container parser.
//! let mut exports = ImageExports::default();
//! exports.library = "kernel32.dll".to_string();
//! exports.exports.insert("Sleep".to_string(), 0x1400);
//! session.add_image(&exports, GuestAddress::new(0x7600_0000));
//!
//! let engine = DispatchEngine::new(session.config().reentrancy_limit);
//! let address = engine.declare_symbol(
//!     session.symbols(),
//!     &SymbolName::new("kernel32.dll", "Sleep"),
//!     ParamSpec::new().with("ms", ParamKind::U32),
//! )?;
//! engine.set_call(address, Arc::new(|_call| Ok(CallOutcome::Return(0))));
//! # Ok(())
//! # }
//! ```
//!
//! The driver program wires the core's intercepted-address callback to
//! [`DispatchEngine::intercept`](dispatch::DispatchEngine::intercept) and
//! steps the core until it reports a [`DispatchOutcome::Stopped`] or the
//! guest exits.
//!
//! ## Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`cpu`] | Boundary types for the external CPU-emulation core |
//! | [`memory`] | Typed read/decode/write view over guest memory |
//! | [`abi`] | Calling conventions and parameter marshalling |
//! | [`symbols`] | Load-time symbol-to-address resolution |
//! | [`cache`] | Pluggable persisted export cache |
//! | [`dispatch`] | Hook chains and the dispatch engine |
//! | [`thread`] | Cooperative guest thread scheduling |
//! | [`session`] | Shared session state, configuration and tracing |

pub mod abi;
pub mod cache;
pub mod cpu;
pub mod dispatch;
mod error;
pub mod memory;
pub mod prelude;
pub mod session;
pub mod symbols;
#[cfg(test)]
pub(crate) mod test;
pub mod thread;

pub use error::{Error, Result};

pub use dispatch::{DispatchEngine, DispatchOutcome};
pub use session::{Session, SessionConfig};
