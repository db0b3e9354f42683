// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Backward chain collection over the taint-annotated call graph.

pub mod gc_collector;

pub use gc_collector::GcCollector;
