// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Utilities: option parsing and result persistence.

pub mod options;
pub mod results_dumper;
