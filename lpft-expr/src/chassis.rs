//! `is_chassis_resident` evaluation (§4.3 step 5). A logical port is
//! resident on this chassis either directly (a plain port bound here) or
//! indirectly through a `chassisredirect` port's HA group (the group's
//! currently-active chassis is this one).

use compact_str::CompactString;
use fxhash::FxHashMap;
use lpft_core::{PortBinding, PortKind};

use crate::ast::Expr;

/// The HA-group membership view needed to resolve `ChassisRedirect`
/// ports: for a given HA-group name, the chassis currently elected
/// active.
pub trait HaGroupResolver {
    fn active_chassis(&self, ha_group: &str) -> Option<&str>;
}

pub struct ChassisContext<'a> {
    pub this_chassis: &'a str,
    pub ports: &'a FxHashMap<CompactString, PortBinding>,
    pub ha_groups: &'a dyn HaGroupResolver,
}

impl<'a> ChassisContext<'a> {
    /// `None` means the port name isn't known yet (unbound); treated as
    /// not resident, but the caller must still record the reference so
    /// reprocessing happens once the port appears (§8 scenario 4).
    pub fn is_resident(&self, port_name: &str) -> Option<bool> {
        let port = self.ports.get(port_name)?;
        Some(match &port.kind {
            PortKind::Plain { chassis } => {
                chassis.as_deref() == Some(self.this_chassis)
            }
            PortKind::ChassisRedirect { ha_group } => {
                self.ha_groups.active_chassis(ha_group) == Some(self.this_chassis)
            }
        })
    }
}

/// Replaces every `ChassisResident`/`Not(ChassisResident)` leaf with
/// `True`/`False`, collecting the referenced port names so the caller can
/// push them into the Ref-Tracker regardless of outcome.
pub fn eval_chassis_resident(e: Expr, ctx: &ChassisContext, refs: &mut Vec<CompactString>) -> Expr {
    match e {
        Expr::ChassisResident(name) => {
            let resident = ctx.is_resident(&name).unwrap_or(false);
            refs.push(name);
            if resident {
                Expr::True
            } else {
                Expr::False
            }
        }
        Expr::Not(inner) => match eval_chassis_resident(*inner, ctx, refs) {
            Expr::True => Expr::False,
            Expr::False => Expr::True,
            other => Expr::Not(Box::new(other)),
        },
        Expr::And(a, b) => eval_chassis_resident(*a, ctx, refs)
            .and(eval_chassis_resident(*b, ctx, refs)),
        Expr::Or(a, b) => {
            eval_chassis_resident(*a, ctx, refs).or(eval_chassis_resident(*b, ctx, refs))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpft_core::PortKind;
    use uuid::Uuid;

    struct NoHaGroups;
    impl HaGroupResolver for NoHaGroups {
        fn active_chassis(&self, _ha_group: &str) -> Option<&str> {
            None
        }
    }

    #[test]
    fn unbound_port_is_not_resident_but_is_referenced() {
        let ports = FxHashMap::default();
        let ha = NoHaGroups;
        let ctx = ChassisContext { this_chassis: "c1", ports: &ports, ha_groups: &ha };
        let mut refs = Vec::new();
        let e = eval_chassis_resident(Expr::ChassisResident("p1".into()), &ctx, &mut refs);
        assert_eq!(e, Expr::False);
        assert_eq!(refs, vec![CompactString::from("p1")]);
    }

    #[test]
    fn bound_local_port_is_resident() {
        let mut ports = FxHashMap::default();
        ports.insert(
            CompactString::from("p1"),
            PortBinding {
                id: Uuid::new_v4(),
                name: "p1".into(),
                datapath: Uuid::new_v4(),
                tag: 1,
                kind: PortKind::Plain { chassis: Some("c1".into()) },
            },
        );
        let ha = NoHaGroups;
        let ctx = ChassisContext { this_chassis: "c1", ports: &ports, ha_groups: &ha };
        let mut refs = Vec::new();
        let e = eval_chassis_resident(Expr::ChassisResident("p1".into()), &ctx, &mut refs);
        assert_eq!(e, Expr::True);
    }
}
