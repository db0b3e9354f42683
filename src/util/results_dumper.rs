// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Persists analysis results: discovered chains, and optionally the call
//! graph and the computed summaries.

use log::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{bail, Context as _, Result};
use itertools::Itertools;

use crate::analysis::summary::Summary;
use crate::graph::call_graph::{CallEdge, CallGraph};
use crate::model::method::MethodId;
use crate::model::AnalysisContext;

pub fn dump_results(
    acx: &AnalysisContext,
    call_graph: &CallGraph,
    chains: &[Vec<CallEdge>],
    summaries: &HashMap<MethodId, Summary>,
) -> Result<()> {
    info!("Dumping {} gadget chains...", chains.len());
    let file = File::create(&acx.options.output)
        .with_context(|| format!("cannot create {}", acx.options.output))?;
    let mut w = BufWriter::new(file);
    write_chains(acx, chains, &mut w)?;
    w.flush()?;

    if let Some(cg_output) = &acx.options.call_graph_output {
        info!("Dumping call graph...");
        dump_call_graph(acx, call_graph, cg_output)?;
    }
    if let Some(sum_output) = &acx.options.summaries_output {
        info!("Dumping method summaries...");
        dump_summaries(acx, summaries, sum_output)?;
    }
    Ok(())
}

/// Writes chains in the persisted line format: one `caller->[k0, k1, ...]`
/// line per hop, the sink signature, then a blank line; a trailing total.
pub fn write_chains<W: Write>(
    acx: &AnalysisContext,
    chains: &[Vec<CallEdge>],
    w: &mut W,
) -> Result<()> {
    for chain in chains {
        for edge in chain {
            let line = format!("{}->{:?}", acx.method_str(edge.caller()), edge.int_contr);
            info!("{}", line);
            writeln!(w, "{}", line)?;
        }
        if let Some(last) = chain.last() {
            let sink = acx.method_str(last.callee);
            info!("{}", sink);
            writeln!(w, "{}", sink)?;
        }
        info!("");
        writeln!(w)?;
    }
    writeln!(w, "total gadget chains : {}", chains.len())?;
    Ok(())
}

/// A chain read back from the persisted text form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedChain {
    /// `(caller signature, taint vector)` per hop, sink-last order.
    pub hops: Vec<(String, Vec<i32>)>,
    pub sink: String,
}

/// Parses the text form written by [`write_chains`] back into hops. The
/// trailing total line is validated against the number of parsed chains.
pub fn parse_chains(text: &str) -> Result<Vec<ParsedChain>> {
    let mut chains = Vec::new();
    let mut hops: Vec<(String, Vec<i32>)> = Vec::new();
    let mut sink: Option<String> = None;
    for line in text.lines() {
        if line.is_empty() {
            match sink.take() {
                Some(sink) => chains.push(ParsedChain {
                    hops: std::mem::take(&mut hops),
                    sink,
                }),
                None if hops.is_empty() => {}
                None => bail!("chain without a sink line"),
            }
            continue;
        }
        if let Some(total) = line.strip_prefix("total gadget chains : ") {
            let total: usize = total
                .parse()
                .with_context(|| format!("malformed total line {:?}", line))?;
            if total != chains.len() {
                bail!("total says {} chains, parsed {}", total, chains.len());
            }
            continue;
        }
        match line.rsplit_once("->") {
            Some((caller, vector)) => {
                hops.push((caller.to_string(), parse_taint_vector(vector)?));
            }
            None => {
                if sink.replace(line.to_string()).is_some() {
                    bail!("two sink lines in one chain near {:?}", line);
                }
            }
        }
    }
    if sink.is_some() || !hops.is_empty() {
        bail!("unterminated chain at end of input");
    }
    Ok(chains)
}

fn parse_taint_vector(s: &str) -> Result<Vec<i32>> {
    let inner = s
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .with_context(|| format!("malformed taint vector {:?}", s))?;
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(", ")
        .map(|k| {
            k.parse::<i32>()
                .with_context(|| format!("malformed taint key {:?}", k))
        })
        .collect()
}

pub fn dump_call_graph(acx: &AnalysisContext, call_graph: &CallGraph, path: &str) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create {}", path))?;
    let mut w = BufWriter::new(file);
    for edge in call_graph.edges() {
        writeln!(
            w,
            "{} -> {} {:?}",
            acx.method_str(edge.caller()),
            acx.method_str(edge.callee),
            edge.int_contr
        )?;
    }
    writeln!(
        w,
        "{} reachable methods, {} call edges",
        call_graph.reachable_count(),
        call_graph.edge_count()
    )?;
    w.flush()?;
    Ok(())
}

pub fn dump_summaries(
    acx: &AnalysisContext,
    summaries: &HashMap<MethodId, Summary>,
    path: &str,
) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create {}", path))?;
    let mut w = BufWriter::new(file);
    for m in summaries.keys().copied().sorted() {
        let summary = &summaries[&m];
        if summary.is_empty() {
            continue;
        }
        writeln!(w, "{}", acx.method_str(m))?;
        for (key, value) in summary.iter() {
            writeln!(w, "  {} = {}", key, value)?;
        }
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_persisted_chains_hop_by_hop() {
        let text = "<a.B: void readObject(java.lang.Object)>->[-1, -1]\n\
                    <a.C: void call(java.lang.String)>->[-2, 0]\n\
                    <x.Sink: void exec(java.lang.String)>\n\
                    \n\
                    total gadget chains : 1\n";
        let chains = parse_chains(text).unwrap();
        assert_eq!(chains.len(), 1);
        let chain = &chains[0];
        assert_eq!(chain.sink, "<x.Sink: void exec(java.lang.String)>");
        assert_eq!(
            chain.hops,
            vec![
                (
                    "<a.B: void readObject(java.lang.Object)>".to_string(),
                    vec![-1, -1]
                ),
                ("<a.C: void call(java.lang.String)>".to_string(), vec![-2, 0]),
            ]
        );
    }

    #[test]
    fn rejects_inconsistent_totals() {
        let text = "<a.B: void m()>->[-1]\n<x.Sink: void s()>\n\ntotal gadget chains : 2\n";
        assert!(parse_chains(text).is_err());
        assert!(parse_chains("<x.Sink: void s()>\n").is_err());
    }
}
