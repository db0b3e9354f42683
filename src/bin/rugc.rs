// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The main routine of `rugc`.
//!
//! Loads a serialized program model and a knowledge base, runs the summary
//! analysis, then collects and persists gadget chains.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use log::*;

use rugc::analysis::SummaryAnalysis;
use rugc::collector::GcCollector;
use rugc::model::knowledge::Knowledge;
use rugc::model::{AnalysisContext, Program};
use rugc::util::options::AnalysisOptions;
use rugc::util::results_dumper;

fn main() -> Result<()> {
    if env::var("RUGC_LOG").is_ok() {
        let e = env_logger::Env::new()
            .filter("RUGC_LOG")
            .write_style("RUGC_LOG_STYLE");
        env_logger::init_from_env(e);
    }

    let args: Vec<String> = env::args().collect();
    let options = AnalysisOptions::parse_from_args(&args);

    let program = load_program(Path::new(&options.program))?;
    let knowledge = Knowledge::load(Path::new(&options.knowledge))?;
    let acx = AnalysisContext::from_program(program, knowledge, options);

    info!(
        "[+] loaded {} methods over {} classes",
        acx.methods.len(),
        acx.hierarchy.classes().count()
    );

    let mut analysis = SummaryAnalysis::new(&acx);
    analysis.run();
    let (mut call_graph, summaries, sources) = analysis.into_parts();

    let chains = GcCollector::new(&acx, sources).collect(&mut call_graph);
    results_dumper::dump_results(&acx, &call_graph, &chains, &summaries)?;
    Ok(())
}

fn load_program(path: &Path) -> Result<Program> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read program model {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("malformed program model {}", path.display()))
}
