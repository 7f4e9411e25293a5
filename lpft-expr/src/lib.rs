//! Expression compilation pipeline (§4.3): parses a logical-flow match
//! string into an AST, conjoins the action encoder's prerequisites,
//! resolves `is_chassis_resident`, and normalizes to the conjunctive
//! clauses the rest of the crate turns into `OfMatch`es.

pub mod ast;
pub mod chassis;
pub mod normalize;
mod parser;
pub mod simplify;
pub mod symtab;

pub use ast::{CmpOp, Expr, Value};
pub use chassis::{ChassisContext, HaGroupResolver};
pub use normalize::{
    AddressSetMap, Atom, ConjDescriptor, ConjGroupInfo, NormResult, NormTerm, PortGroupMap, RefSet,
};
pub use parser::parse_match;
pub use symtab::{AnnotationError, FieldKind, FieldSpec, Symtab};

use compact_str::CompactString;

/// The full pipeline for one `(LogicalFlow, LocalDatapath)` pair (§4.3
/// steps 1-7). `prereqs`, when present, is `AND`-combined into the parsed
/// match before chassis resolution and normalization (step 2).
pub fn compile(
    match_str: &str,
    prereqs: Option<Expr>,
    symtab: &Symtab,
    ctx: &ChassisContext,
    asets: &AddressSetMap,
    pgroups: &PortGroupMap,
) -> anyhow::Result<(NormResult, RefSet, Vec<CompactString>)> {
    let mut expr = parse_match(match_str)?;
    if let Some(p) = prereqs {
        expr = expr.and(p);
    }
    expr = simplify::simplify(expr);
    let mut chassis_refs = Vec::new();
    expr = chassis::eval_chassis_resident(expr, ctx, &mut chassis_refs);
    expr = simplify::simplify(expr);
    let (norm, refs) = normalize::normalize(&expr, symtab, asets, pgroups)?;
    Ok((norm, refs, chassis_refs))
}

/// Names referenced via `$name` in a raw match string, before the
/// address sets/port groups maps that `compile` needs are known.
/// Callers use this to decide what to fetch from the south-bound view
/// ahead of the real compile pass (§4.3 step 1/3).
pub fn referenced_set_names(match_str: &str) -> anyhow::Result<Vec<CompactString>> {
    let expr = parse_match(match_str)?;
    let mut names = Vec::new();
    expr.set_ref_names(&mut names);
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxhash::FxHashMap;

    struct NoHaGroups;
    impl HaGroupResolver for NoHaGroups {
        fn active_chassis(&self, _ha_group: &str) -> Option<&str> {
            None
        }
    }

    #[test]
    fn scenario4_chassis_resident_disabling() {
        let symtab = Symtab::default();
        let ports = FxHashMap::default();
        let ha = NoHaGroups;
        let ctx = ChassisContext { this_chassis: "c1", ports: &ports, ha_groups: &ha };
        let (norm, _refs, chassis_refs) = compile(
            "is_chassis_resident(\"p1\")",
            None,
            &symtab,
            &ctx,
            &AddressSetMap::default(),
            &PortGroupMap::default(),
        )
        .unwrap();
        assert!(norm.terms.is_empty());
        assert_eq!(chassis_refs, vec![CompactString::from("p1")]);
    }
}
