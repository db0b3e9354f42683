// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The symbolic value model.
//!
//! A [`ContrValue`] describes where the value held by a pointer may come
//! from: nowhere interesting, a fresh allocation, or a chain of fragments
//! rooted in the attacker-facing surface (`this`, a parameter, or an
//! already-polluted source) possibly interleaved with literal text. A
//! [`Contr`] wraps the value with the shape information the dispatcher
//! needs (declared type, allocation type-set, array elements).

pub mod points_to;

use std::fmt;
use std::str::FromStr;

use crate::graph::pfg::PointerId;
use crate::model::ty::TypeId;

/// Integer keys of the persisted taint lattice.
pub const KEY_THIS: i32 = -1;
pub const KEY_POLLUTED: i32 = -2;
pub const KEY_NOT_POLLUTED: i32 = -3;

/// One fragment of a value chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Frag {
    /// Attacker-controlled with no traceable origin.
    Polluted,
    /// Rooted in the receiver, with a field access path.
    This(Vec<String>),
    /// Rooted in parameter `i`, with a field access path.
    Param(usize, Vec<String>),
    /// A literal text fragment.
    Str(String),
}

impl Frag {
    pub fn key(&self) -> i32 {
        match self {
            Frag::Polluted => KEY_POLLUTED,
            Frag::This(_) => KEY_THIS,
            Frag::Param(i, _) => *i as i32,
            Frag::Str(_) => KEY_NOT_POLLUTED,
        }
    }

    pub fn is_controllable(&self) -> bool {
        !matches!(self, Frag::Str(_))
    }

    fn push_field(&mut self, name: &str) {
        match self {
            Frag::This(path) | Frag::Param(_, path) => path.push(name.to_string()),
            Frag::Str(s) => {
                s.push('-');
                s.push_str(name);
            }
            Frag::Polluted => {}
        }
    }
}

impl fmt::Display for Frag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frag::Polluted => write!(f, "polluted"),
            Frag::This(path) => {
                write!(f, "this")?;
                for p in path {
                    write!(f, "-{}", p)?;
                }
                Ok(())
            }
            Frag::Param(i, path) => {
                write!(f, "param-{}", i)?;
                for p in path {
                    write!(f, "-{}", p)?;
                }
                Ok(())
            }
            Frag::Str(s) => write!(f, "{}", s),
        }
    }
}

/// A symbolic value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContrValue {
    /// Bottom: nothing attacker-visible reaches here.
    NotPolluted,
    /// A fresh allocation; the runtime type-set lives on the [`Contr`].
    New,
    /// A non-empty chain of fragments.
    Frags(Vec<Frag>),
}

impl ContrValue {
    pub fn polluted() -> Self {
        ContrValue::Frags(vec![Frag::Polluted])
    }

    pub fn this() -> Self {
        ContrValue::Frags(vec![Frag::This(Vec::new())])
    }

    pub fn param(i: usize) -> Self {
        ContrValue::Frags(vec![Frag::Param(i, Vec::new())])
    }

    pub fn literal(s: &str) -> Self {
        ContrValue::Frags(vec![Frag::Str(s.to_string())])
    }

    pub fn frags(&self) -> &[Frag] {
        match self {
            ContrValue::Frags(fs) => fs,
            _ => &[],
        }
    }

    /// Collapses the chain to its integer lattice key. A polluted fragment
    /// dominates a receiver-rooted one, which dominates a parameter-rooted
    /// one; literal-only chains collapse to bottom.
    pub fn call_key(&self) -> i32 {
        let frags = self.frags();
        if frags.iter().any(|f| matches!(f, Frag::Polluted)) {
            return KEY_POLLUTED;
        }
        if frags.iter().any(|f| matches!(f, Frag::This(_))) {
            return KEY_THIS;
        }
        for f in frags {
            if let Frag::Param(i, _) = f {
                return *i as i32;
            }
        }
        KEY_NOT_POLLUTED
    }

    pub fn is_controllable(&self) -> bool {
        self.call_key() >= KEY_POLLUTED
    }

    pub fn is_controllable_param(&self) -> bool {
        self.call_key() > KEY_THIS
    }

    pub fn is_call_site(&self) -> bool {
        self.call_key() >= KEY_THIS
    }

    pub fn is_this(&self) -> bool {
        self.call_key() == KEY_THIS
    }

    /// Whether the value carries literal text. A fresh allocation counts as
    /// a literal carrier for merge precedence.
    pub fn has_const_str(&self) -> bool {
        match self {
            ContrValue::NotPolluted => false,
            ContrValue::New => true,
            ContrValue::Frags(fs) => fs.iter().any(|f| matches!(f, Frag::Str(_))),
        }
    }

    /// Concatenation of the literal fragments, if any.
    pub fn const_str(&self) -> Option<String> {
        let mut out = String::new();
        for f in self.frags() {
            if let Frag::Str(s) = f {
                out.push_str(s);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Renders the chain as a lookup regex: controllable fragments become
    /// a wildcard, literal fragments stay verbatim.
    pub fn to_name_regex(&self) -> String {
        let mut out = String::new();
        for f in self.frags() {
            if f.is_controllable() {
                if !out.ends_with(".*") {
                    out.push_str(".*");
                }
            } else {
                out.push_str(&f.to_string());
            }
        }
        out
    }

    /// Appends a field access to the chain. Only the trailing fragment
    /// carries the access path.
    pub fn append_field(&self, name: &str) -> ContrValue {
        match self {
            ContrValue::Frags(fs) => {
                let mut fs = fs.clone();
                if let Some(last) = fs.last_mut() {
                    last.push_field(name);
                }
                ContrValue::Frags(fs)
            }
            other => other.clone(),
        }
    }

    /// Concatenates two chains, literal-append style.
    pub fn concat(&self, rhs: &ContrValue) -> ContrValue {
        let mut fs: Vec<Frag> = self.frags().to_vec();
        fs.extend(rhs.frags().iter().cloned());
        if fs.is_empty() {
            return rhs.clone();
        }
        ContrValue::Frags(fs)
    }

    /// Substitutes the placeholder `root` with `replacement` wherever a
    /// fragment starts with it, carrying leftover field accesses onto the
    /// replacement's trailing fragment.
    pub fn substitute_prefix(&self, root: &Frag, replacement: &ContrValue) -> ContrValue {
        let matches_root = |f: &Frag| -> Option<Vec<String>> {
            match (f, root) {
                (Frag::This(path), Frag::This(rpath)) if path.starts_with(rpath) => {
                    Some(path[rpath.len()..].to_vec())
                }
                (Frag::Param(i, path), Frag::Param(ri, rpath))
                    if i == ri && path.starts_with(rpath) =>
                {
                    Some(path[rpath.len()..].to_vec())
                }
                _ => None,
            }
        };
        let mut out: Vec<Frag> = Vec::new();
        for f in self.frags() {
            match matches_root(f) {
                Some(rest) => {
                    let mut spliced: Vec<Frag> = replacement.frags().to_vec();
                    if spliced.is_empty() {
                        // bottom replacement erases the fragment
                        continue;
                    }
                    if let Some(last) = spliced.last_mut() {
                        for field in &rest {
                            last.push_field(field);
                        }
                    }
                    out.extend(spliced);
                }
                None => out.push(f.clone()),
            }
        }
        if out.is_empty() {
            return ContrValue::NotPolluted;
        }
        ContrValue::Frags(out)
    }

    /// Rewrites controllable fragments with `replacement` while keeping the
    /// literal skeleton, collapsing adjacent equal-controllability runs.
    pub fn replace_controllable(&self, replacement: &ContrValue) -> ContrValue {
        let frags = self.frags();
        if !self.has_const_str() || frags.is_empty() {
            return replacement.clone();
        }
        let mut out: Vec<Frag> = Vec::new();
        let mut prev: Option<&Frag> = None;
        for frag in frags {
            if prev.map_or(true, |p| needs_update_in_append_frag(p, frag)) {
                if frag.is_controllable() {
                    match replacement {
                        ContrValue::Frags(rs) => out.extend(rs.iter().cloned()),
                        _ => out.push(frag.clone()),
                    }
                } else {
                    out.push(frag.clone());
                }
            }
            prev = Some(frag);
        }
        ContrValue::Frags(out)
    }
}

impl fmt::Display for ContrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContrValue::NotPolluted => write!(f, "null"),
            ContrValue::New => write!(f, "new"),
            ContrValue::Frags(fs) => {
                for (i, frag) in fs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "+")?;
                    }
                    write!(f, "{}", frag)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for ContrValue {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "null" {
            return Ok(ContrValue::NotPolluted);
        }
        if s == "new" || s.starts_with("new ") {
            return Ok(ContrValue::New);
        }
        let mut frags = Vec::new();
        for part in s.split('+') {
            if part == "polluted" {
                frags.push(Frag::Polluted);
            } else if part == "this" || part.starts_with("this-") {
                let path = part
                    .split('-')
                    .skip(1)
                    .map(str::to_string)
                    .collect();
                frags.push(Frag::This(path));
            } else if let Some(rest) = part.strip_prefix("param-") {
                let mut segs = rest.split('-');
                match segs.next().and_then(|i| i.parse::<usize>().ok()) {
                    Some(i) => {
                        frags.push(Frag::Param(i, segs.map(str::to_string).collect()))
                    }
                    None => frags.push(Frag::Str(part.to_string())),
                }
            } else {
                frags.push(Frag::Str(part.to_string()));
            }
        }
        if frags.is_empty() {
            return Err(());
        }
        Ok(ContrValue::Frags(frags))
    }
}

/// Merge precedence between a held value and an incoming one.
pub fn needs_update_in_merge(old: Option<&ContrValue>, new: &ContrValue) -> bool {
    let old = match old {
        None => return *new != ContrValue::NotPolluted,
        Some(v) => v,
    };
    if *new == ContrValue::New && *old != ContrValue::New {
        return true;
    }
    let oldc = old.is_controllable();
    let newc = new.is_controllable();
    if !oldc && !newc {
        // a newer literal replaces whatever non-controllable value is held
        new.has_const_str()
    } else if oldc && newc {
        new.has_const_str() && !old.has_const_str()
    } else {
        !oldc && newc
    }
}

/// Append precedence: keep appending while controllability alternates or a
/// distinct literal arrives.
pub fn needs_update_in_append(left: &ContrValue, right: &ContrValue) -> bool {
    left.is_controllable() != right.is_controllable()
        || (right.has_const_str() && right != left)
}

fn needs_update_in_append_frag(left: &Frag, right: &Frag) -> bool {
    left.is_controllable() != right.is_controllable()
        || (!right.is_controllable() && right != left)
}

/// A taint vector is fully controllable when no slot is bottom.
pub fn all_controllable(keys: &[i32]) -> bool {
    !keys.contains(&KEY_NOT_POLLUTED)
}

/// How an incoming value combines with a held one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Assign,
    Append,
}

/// A symbolic contribution: a value plus the shape facts attached to it.
#[derive(Clone, Debug)]
pub struct Contr {
    pub value: ContrValue,
    /// Declared or refined runtime type.
    pub ty: Option<TypeId>,
    /// The pointer this contribution was computed for.
    pub origin: Option<PointerId>,
    pub casted: bool,
    pub serializable: bool,
    /// Whether this stands for a fresh allocation.
    pub is_new: bool,
    /// Extra runtime types accumulated from unrelated allocation merges.
    pub new_types: Vec<TypeId>,
    /// Child contributions for array contents.
    pub elements: Vec<Contr>,
    /// Rooted in an allocation local to the current method; such state
    /// never escapes into the summary.
    pub intra: bool,
    /// Literal values are pinned: assignment merges never overwrite them.
    pub pinned: bool,
}

impl Contr {
    pub fn new(origin: Option<PointerId>, ty: Option<TypeId>, value: ContrValue) -> Self {
        Contr {
            value,
            ty,
            origin,
            casted: false,
            serializable: false,
            is_new: false,
            new_types: Vec::new(),
            elements: Vec::new(),
            intra: false,
            pinned: false,
        }
    }

    pub fn not_polluted(origin: Option<PointerId>, ty: Option<TypeId>) -> Self {
        Self::new(origin, ty, ContrValue::NotPolluted)
    }

    pub fn is_controllable(&self) -> bool {
        self.value.is_controllable()
    }

    pub fn is_controllable_param(&self) -> bool {
        self.value.is_controllable_param()
    }

    pub fn call_key(&self) -> i32 {
        self.value.call_key()
    }

    pub fn add_new_type(&mut self, ty: TypeId) {
        if Some(ty) != self.ty && !self.new_types.contains(&ty) {
            self.new_types.push(ty);
        }
    }

    /// Declared type plus every accumulated allocation type.
    pub fn type_set(&self) -> Vec<TypeId> {
        let mut out = Vec::new();
        if let Some(ty) = self.ty {
            out.push(ty);
        }
        for ty in &self.new_types {
            if !out.contains(ty) {
                out.push(*ty);
            }
        }
        out
    }

    /// Combines `v` into the held value. Returns whether anything changed.
    pub fn update_value(&mut self, v: &ContrValue, action: Action) -> bool {
        match action {
            Action::Assign => {
                if self.pinned {
                    return false;
                }
                if needs_update_in_merge(Some(&self.value), v) {
                    self.value = v.clone();
                    true
                } else {
                    false
                }
            }
            Action::Append => {
                if needs_update_in_append(&self.value, v) {
                    self.value = match &self.value {
                        ContrValue::NotPolluted | ContrValue::New => v.clone(),
                        held => held.concat(v),
                    };
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_key_priority() {
        let v: ContrValue = "param-0+this-f".parse().unwrap();
        assert_eq!(v.call_key(), KEY_THIS);
        let v: ContrValue = "param-2-data+abc".parse().unwrap();
        assert_eq!(v.call_key(), 2);
        let v: ContrValue = "polluted+param-1".parse().unwrap();
        assert_eq!(v.call_key(), KEY_POLLUTED);
        assert_eq!(ContrValue::NotPolluted.call_key(), KEY_NOT_POLLUTED);
        assert_eq!(ContrValue::New.call_key(), KEY_NOT_POLLUTED);
    }

    #[test]
    fn display_round_trip() {
        for s in ["this-f-g", "param-0", "polluted", "get+param-1-name"] {
            let v: ContrValue = s.parse().unwrap();
            assert_eq!(v.to_string(), s);
        }
    }

    #[test]
    fn merge_prefers_controllable() {
        let cs = ContrValue::literal("abc");
        let par = ContrValue::param(0);
        assert!(needs_update_in_merge(Some(&cs), &par));
        assert!(!needs_update_in_merge(Some(&par), &cs));
        assert!(!needs_update_in_merge(Some(&par), &ContrValue::NotPolluted));
        assert!(needs_update_in_merge(None, &par));
        assert!(!needs_update_in_merge(None, &ContrValue::NotPolluted));
    }

    #[test]
    fn newest_literal_replaces_a_held_literal() {
        let first = ContrValue::literal("a");
        let second = ContrValue::literal("b");
        assert!(needs_update_in_merge(Some(&first), &second));
        assert!(!needs_update_in_merge(Some(&first), &ContrValue::NotPolluted));
    }

    #[test]
    fn merge_prefers_literal_carrier_between_controllables() {
        let plain = ContrValue::param(0);
        let mixed: ContrValue = "get+param-0".parse().unwrap();
        assert!(needs_update_in_merge(Some(&plain), &mixed));
        assert!(!needs_update_in_merge(Some(&mixed), &plain));
    }

    #[test]
    fn append_field_hits_trailing_frag() {
        let v: ContrValue = "get+this".parse().unwrap();
        assert_eq!(v.append_field("name").to_string(), "get+this-name");
        let v = ContrValue::param(1).append_field("a").append_field("b");
        assert_eq!(v.to_string(), "param-1-a-b");
    }

    #[test]
    fn name_regex_collapses_controllables() {
        let v: ContrValue = "get+param-0".parse().unwrap();
        assert_eq!(v.to_name_regex(), "get.*");
        let v: ContrValue = "param-0+param-1".parse().unwrap();
        assert_eq!(v.to_name_regex(), ".*");
        assert_eq!(ContrValue::NotPolluted.to_name_regex(), "");
    }

    #[test]
    fn replace_controllable_keeps_literal_skeleton() {
        let pat: ContrValue = "get+param-0".parse().unwrap();
        let got = pat.replace_controllable(&ContrValue::this());
        assert_eq!(got.to_string(), "get+this");
        let plain = ContrValue::param(0);
        assert_eq!(
            plain.replace_controllable(&ContrValue::polluted()).to_string(),
            "polluted"
        );
    }

    #[test]
    fn substitute_prefix_carries_leftover_fields() {
        let v: ContrValue = "param-0-name+str".parse().unwrap();
        let actual: ContrValue = "this-handler".parse().unwrap();
        let root = Frag::Param(0, Vec::new());
        assert_eq!(
            v.substitute_prefix(&root, &actual).to_string(),
            "this-handler-name+str"
        );
    }

    #[test]
    fn append_action_concatenates() {
        let mut c = Contr::new(None, None, ContrValue::literal("get"));
        assert!(c.update_value(&ContrValue::param(0), Action::Append));
        assert_eq!(c.value.to_string(), "get+param-0");
        // repeating the same append is a no-op
        assert!(!c.update_value(&ContrValue::param(0), Action::Append));
    }
}
