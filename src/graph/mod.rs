// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Graph representations: the pointer flow graph built per method and the
//! taint-annotated call graph built across methods.

pub mod call_graph;
pub mod pfg;
