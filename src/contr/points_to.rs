// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Accumulator that folds a stream of contributions into one merged value.

use crate::contr::{needs_update_in_merge, Contr};
use crate::model::AnalysisContext;

/// One merged contribution per pointer; merging is a precedence rule, not a
/// classical join.
#[derive(Clone, Debug, Default)]
pub struct PointsTo {
    merged: Option<Contr>,
}

impl PointsTo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one contribution, returning whether the held value changed.
    ///
    /// Two allocations: the incoming one wins when it is strictly more
    /// specific or newly controllable; an unrelated type accumulates into
    /// the held type-set instead of dropping either. Anything else goes
    /// through the precedence test.
    pub fn add(&mut self, acx: &AnalysisContext, contr: Contr) -> bool {
        let held = match &mut self.merged {
            None => {
                self.merged = Some(contr);
                return true;
            }
            Some(h) => h,
        };
        if held.is_new && contr.is_new {
            if let (Some(held_ty), Some(new_ty)) = (held.ty, contr.ty) {
                let more_specific =
                    acx.is_subtype(held_ty, new_ty) && held_ty != new_ty;
                if more_specific || (contr.is_controllable() && !held.is_controllable()) {
                    self.merged = Some(contr);
                    return true;
                }
                if !acx.is_subtype(new_ty, held_ty) {
                    held.add_new_type(new_ty);
                    return true;
                }
            }
            false
        } else if needs_update_in_merge(Some(&held.value), &contr.value) {
            self.merged = Some(contr);
            true
        } else {
            false
        }
    }

    pub fn add_pts(&mut self, acx: &AnalysisContext, other: PointsTo) -> bool {
        match other.merged {
            Some(c) => self.add(acx, c),
            None => false,
        }
    }

    pub fn merged(&self) -> Option<&Contr> {
        self.merged.as_ref()
    }

    pub fn into_merged(self) -> Option<Contr> {
        self.merged
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contr::ContrValue;
    use crate::model::testing::small_model;

    fn alloc(acx: &AnalysisContext, ty_name: &str) -> Contr {
        let ty = acx.types.by_name(ty_name).unwrap();
        let mut c = Contr::new(None, Some(ty), ContrValue::New);
        c.is_new = true;
        c
    }

    #[test]
    fn subtype_allocation_wins_either_order() {
        let acx = small_model();
        let obj = alloc(&acx, "java.lang.Object");
        let s = alloc(&acx, "java.lang.String");

        let mut pts = PointsTo::new();
        pts.add(&acx, obj.clone());
        assert!(pts.add(&acx, s.clone()));
        assert_eq!(pts.merged().unwrap().ty, s.ty);

        let mut pts = PointsTo::new();
        pts.add(&acx, s.clone());
        assert!(!pts.add(&acx, obj));
        assert_eq!(pts.merged().unwrap().ty, s.ty);
    }

    #[test]
    fn merge_is_idempotent() {
        let acx = small_model();
        let mut pts = PointsTo::new();
        let c = Contr::new(None, None, ContrValue::param(0));
        pts.add(&acx, c.clone());
        let before = pts.merged().unwrap().value.clone();
        assert!(!pts.add(&acx, c));
        assert_eq!(pts.merged().unwrap().value, before);
    }

    #[test]
    fn unrelated_allocations_accumulate_types() {
        use crate::model::knowledge::Knowledge;
        use crate::model::ProgramBuilder;
        use crate::util::options::AnalysisOptions;

        let mut b = ProgramBuilder::new();
        let object = b.add_class("java.lang.Object", None, false);
        b.add_class("demo.A", Some(object), true);
        b.add_class("demo.B", Some(object), true);
        let acx = b.finish(Knowledge::default(), AnalysisOptions::default());

        let a = alloc(&acx, "demo.A");
        let b = alloc(&acx, "demo.B");
        let mut pts = PointsTo::new();
        pts.add(&acx, a.clone());
        assert!(pts.add(&acx, b.clone()));
        let merged = pts.merged().unwrap();
        assert_eq!(merged.ty, a.ty);
        assert_eq!(merged.type_set(), vec![a.ty.unwrap(), b.ty.unwrap()]);
    }

    #[test]
    fn controllable_replaces_bottom() {
        let acx = small_model();
        let mut pts = PointsTo::new();
        pts.add(&acx, Contr::new(None, None, ContrValue::NotPolluted));
        assert!(pts.add(&acx, Contr::new(None, None, ContrValue::this())));
        assert!(pts.merged().unwrap().is_controllable());
    }
}
