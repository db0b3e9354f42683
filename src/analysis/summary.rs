// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Method summaries: what a method does to its caller-visible slots.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use crate::contr::{needs_update_in_merge, Action, ContrValue};
use crate::model::ty::TypeId;

/// A caller-visible slot of a method.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotKey {
    Return,
    Param(usize),
    This,
    ThisField(String),
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Return => write!(f, "return"),
            SlotKey::Param(i) => write!(f, "param-{}", i),
            SlotKey::This => write!(f, "this"),
            SlotKey::ThisField(name) => write!(f, "this-{}", name),
        }
    }
}

/// The effect a method has on one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryValue {
    pub action: Action,
    pub value: ContrValue,
    /// Result type, recorded for the return slot.
    pub ty: Option<TypeId>,
}

impl SummaryValue {
    pub fn assign(value: ContrValue) -> Self {
        SummaryValue {
            action: Action::Assign,
            value,
            ty: None,
        }
    }

    pub fn with_ty(value: ContrValue, ty: Option<TypeId>) -> Self {
        SummaryValue {
            action: Action::Assign,
            value,
            ty,
        }
    }
}

impl fmt::Display for SummaryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.action == Action::Append {
            write!(f, "append:")?;
        }
        write!(f, "{}", self.value)
    }
}

/// Per-method summary map. Writers decide precedence before inserting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary(BTreeMap<SlotKey, SummaryValue>);

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SlotKey) -> Option<&SummaryValue> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: SlotKey, value: SummaryValue) {
        self.0.insert(key, value);
    }

    /// Merges `value` into `key` under the assignment precedence rule.
    /// Returns whether the slot changed.
    pub fn merge(&mut self, key: SlotKey, value: SummaryValue) -> bool {
        let old = self.0.get(&key).map(|v| &v.value);
        if needs_update_in_merge(old, &value.value) {
            self.0.insert(key, value);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, SlotKey, SummaryValue> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_respects_precedence() {
        let mut s = Summary::new();
        assert!(s.merge(SlotKey::Return, SummaryValue::assign(ContrValue::param(0))));
        // bottom never displaces a controllable value
        assert!(!s.merge(SlotKey::Return, SummaryValue::assign(ContrValue::NotPolluted)));
        assert_eq!(
            s.get(&SlotKey::Return).unwrap().value,
            ContrValue::param(0)
        );
    }

    #[test]
    fn slot_keys_render_like_summary_keys() {
        assert_eq!(SlotKey::Return.to_string(), "return");
        assert_eq!(SlotKey::Param(2).to_string(), "param-2");
        assert_eq!(SlotKey::ThisField("queue".into()).to_string(), "this-queue");
    }
}
