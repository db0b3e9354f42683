// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Declared method knowledge, supplied ahead of analysis: untrusted entry
//! points, sinks with their required-taint vectors, ignore lists, taint
//! transfer models and imitated-behavior models for reflection-like
//! dispatch idioms.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Slot index space shared with taint vectors: `-1` is the receiver, `-2`
/// the call result, `k >= 0` the k-th argument.
pub const SLOT_BASE: i32 = -1;
pub const SLOT_RESULT: i32 = -2;

/// A declarative taint-transfer model for a utility method: the value at
/// `from` flows to `to`, with `ty` describing the produced type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaintTransfer {
    pub from: i32,
    pub to: i32,
    /// `"from"` keeps the source type; any other value names the result type.
    #[serde(default = "default_transfer_ty")]
    pub ty: String,
    /// The transfer denotes object creation.
    #[serde(default)]
    pub new: bool,
    /// The transfer exposes a dispatch name (e.g. a member-name getter) that
    /// downstream conditionals may route on.
    #[serde(default)]
    pub route: bool,
}

fn default_transfer_ty() -> String {
    "from".to_string()
}

/// A closed model of one reflection-like indirect-dispatch idiom.
///
/// Indices are call-site argument positions (`-1` receiver).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    /// Dynamic instantiation: resolve constructors of a class named by the
    /// value at `from`, expanding candidate argument types from `param`.
    JumpConstructor { from: i32, param: i32 },
    /// Dynamic member lookup: resolve methods by name pattern (`from`) on
    /// the receiver at `recv` with arguments expanded from `param`.
    JumpInference { from: i32, recv: i32, param: i32 },
    /// Property read: the result inherits controllability from `from`.
    Get { from: i32 },
    /// Property write: the result inherits controllability from `from`.
    Set { from: i32 },
    /// Privileged-action idiom: dispatch to the single `run()` method of the
    /// value at `from`.
    Run { from: i32 },
    /// Concretize a string-replace over fully literal operands.
    Replace,
    /// Self-mutating builder idiom: any controllable argument pollutes the
    /// receiver.
    PolluteRec,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinkSpec {
    pub method: String,
    /// Required-taint positions in call-key space.
    pub taint: Vec<i32>,
    #[serde(default)]
    pub filter_extends_generic: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferSpec {
    pub method: String,
    #[serde(flatten)]
    pub transfer: TaintTransfer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BehaviorSpec {
    pub method: String,
    #[serde(flatten)]
    pub behavior: Behavior,
}

/// The full knowledge configuration, loaded once and applied to the model.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Knowledge {
    /// Entry methods, by full signature.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Subsignatures that mark any matching method as an entry once it
    /// becomes reachable (deserialization callbacks).
    #[serde(default)]
    pub source_subsignatures: Vec<String>,
    #[serde(default)]
    pub sinks: Vec<SinkSpec>,
    #[serde(default)]
    pub ignored_methods: Vec<String>,
    #[serde(default)]
    pub ignored_classes: Vec<String>,
    #[serde(default)]
    pub transfers: Vec<TransferSpec>,
    #[serde(default)]
    pub behaviors: Vec<BehaviorSpec>,
    /// Proxy invocation-handler methods, by full signature.
    #[serde(default)]
    pub invocation_handlers: Vec<String>,
}

impl Knowledge {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read knowledge file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("malformed knowledge file {}", path.display()))
    }
}

/// Splits a full `<pkg.Class: ret name(args)>` signature into the class
/// name and the subsignature.
pub fn parse_signature(sig: &str) -> Option<(&str, &str)> {
    let inner = sig.strip_prefix('<')?.strip_suffix('>')?;
    let (class, subsig) = inner.split_once(": ")?;
    Some((class, subsig))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_splits_into_class_and_subsig() {
        let (class, subsig) =
            parse_signature("<java.lang.Class: java.lang.Object newInstance()>").unwrap();
        assert_eq!(class, "java.lang.Class");
        assert_eq!(subsig, "java.lang.Object newInstance()");
        assert!(parse_signature("not a signature").is_none());
    }

    #[test]
    fn behavior_specs_deserialize_by_kind_tag() {
        let spec: BehaviorSpec = serde_json::from_str(
            r#"{"method": "<a.B: void m()>", "kind": "jump_inference", "from": 1, "recv": 0, "param": 2}"#,
        )
        .unwrap();
        assert_eq!(
            spec.behavior,
            Behavior::JumpInference {
                from: 1,
                recv: 0,
                param: 2
            }
        );
    }
}
