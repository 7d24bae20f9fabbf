// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

pub mod absorber;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod emitter;
pub mod error;
pub mod hash;
pub mod net;
pub mod pool;
pub mod process;
pub mod proto;
pub mod queue;
pub mod runtime;

pub use absorber::Absorber;
pub use emitter::Emitter;
pub use error::{Error, Result};
pub use runtime::Runtime;
