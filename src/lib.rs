// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Gadget-chain discovery for managed-runtime class libraries.
//!
//! The analysis core computes reusable per-method taint/shape summaries with
//! a whole-program dataflow pass, then searches the taint-annotated call
//! graph backward from declared sinks for verifiable gadget chains.

pub mod analysis;
pub mod collector;
pub mod contr;
pub mod graph;
pub mod model;
pub mod util;
