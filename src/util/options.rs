// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Analysis options.

use clap::{Arg, Command};

const RUGC_USAGE: &str = r#"rugc [OPTIONS] --program <FILE> --knowledge <FILE>"#;

/// Creates the clap::Command metadata for argument parsing.
fn make_options_parser() -> Command<'static> {
    Command::new("rugc")
        .override_usage(RUGC_USAGE)
        .version(env!("CARGO_PKG_VERSION"))
        .arg(Arg::new("program")
            .long("program")
            .takes_value(true)
            .required(true)
            .help("The program model file (types, hierarchy, methods, IR) to analyze."))
        .arg(Arg::new("knowledge")
            .long("knowledge")
            .takes_value(true)
            .required(true)
            .help("The knowledge file declaring sources, sinks, transfers and behaviors."))
        .arg(Arg::new("output")
            .long("output")
            .takes_value(true)
            .default_value("gc_chains.txt")
            .help("The file the discovered gadget chains are written to."))
        .arg(Arg::new("max-len")
            .long("max-len")
            .takes_value(true)
            .value_parser(clap::value_parser!(usize))
            .default_value("8")
            .help("The maximum number of edges in a reported chain."))
        .arg(Arg::new("max-units-per-sink")
            .long("max-units-per-sink")
            .takes_value(true)
            .value_parser(clap::value_parser!(u64))
            .help("Bound on backward-search work units spent per sink.")
            .long_help("The search from one sink stops after this many visited \
                        edges, making runs reproducible regardless of machine speed."))
        .arg(Arg::new("keep-non-serializable")
            .long("keep-non-serializable")
            .takes_value(false)
            .help("Also consider classes that are not declared serializable."))
        .arg(Arg::new("call-graph-output")
            .long("dump-call-graph")
            .takes_value(true)
            .help("Dump the taint-annotated call graph to the output file."))
        .arg(Arg::new("summaries-output")
            .long("dump-summaries")
            .takes_value(true)
            .help("Dump the computed method summaries to the output file."))
}

#[derive(Clone, Debug)]
pub struct AnalysisOptions {
    pub program: String,
    pub knowledge: String,
    pub output: String,
    /// Maximum chain length, in edges.
    pub max_len: usize,
    /// Work-unit budget per sink; unlimited when absent.
    pub max_units_per_sink: Option<u64>,
    pub filter_non_serializable: bool,
    pub call_graph_output: Option<String>,
    pub summaries_output: Option<String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            program: String::new(),
            knowledge: String::new(),
            output: String::from("gc_chains.txt"),
            max_len: 8,
            max_units_per_sink: None,
            filter_non_serializable: true,
            call_graph_output: None,
            summaries_output: None,
        }
    }
}

impl AnalysisOptions {
    /// Parses options from the command line, exiting with a diagnostic on
    /// invalid input.
    pub fn parse_from_args(args: &[String]) -> Self {
        let matches = match make_options_parser().try_get_matches_from(args.iter()) {
            Ok(matches) => matches,
            Err(e) => e.exit(),
        };
        AnalysisOptions {
            program: matches.get_one::<String>("program").cloned().unwrap_or_default(),
            knowledge: matches.get_one::<String>("knowledge").cloned().unwrap_or_default(),
            output: matches.get_one::<String>("output").cloned().unwrap_or_default(),
            max_len: *matches.get_one::<usize>("max-len").unwrap_or(&8),
            max_units_per_sink: matches.get_one::<u64>("max-units-per-sink").copied(),
            filter_non_serializable: !matches.contains_id("keep-non-serializable"),
            call_graph_output: matches.get_one::<String>("call-graph-output").cloned(),
            summaries_output: matches.get_one::<String>("summaries-output").cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("rugc")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn defaults() {
        let opts = AnalysisOptions::parse_from_args(&args(&[
            "--program", "p.json", "--knowledge", "k.json",
        ]));
        assert_eq!(opts.output, "gc_chains.txt");
        assert_eq!(opts.max_len, 8);
        assert!(opts.filter_non_serializable);
        assert!(opts.max_units_per_sink.is_none());
    }

    #[test]
    fn overrides() {
        let opts = AnalysisOptions::parse_from_args(&args(&[
            "--program", "p.json",
            "--knowledge", "k.json",
            "--max-len", "12",
            "--max-units-per-sink", "100000",
            "--keep-non-serializable",
        ]));
        assert_eq!(opts.max_len, 12);
        assert_eq!(opts.max_units_per_sink, Some(100_000));
        assert!(!opts.filter_non_serializable);
    }
}
