// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Summary-based interprocedural dataflow.
//!
//! The analysis walks each reachable method statement by statement,
//! maintaining symbolic descriptors for pointers and folding what escapes
//! a method into its [`summary::Summary`]. Calls requiring a callee summary
//! suspend the current frame and resume it once the callee is done.

pub mod behavior;
pub mod driver;
pub mod stack;
pub mod stmt_processor;
pub mod summary;

pub use driver::SummaryAnalysis;
