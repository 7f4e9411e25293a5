//! Normalization to conjunctive clauses and expression-to-matches
//! conversion (§4.3 steps 6-7). `normalize()` expects its input already
//! simplified (`simplify::simplify`) and chassis-resolved
//! (`chassis::eval_chassis_resident`), so the only nodes it ever sees are
//! `And`/`Or`/`Cmp`/`True`/`False`.
//!
//! OVN match strings are, in practice, a `||`-of-`&&`-chains shape: an
//! optional top-level disjunction of conjunctions, each conjunction a
//! flat list of comparisons. That is the shape this module handles;
//! anything nested more deeply (an `Or` underneath an `And`) is rejected
//! rather than silently mishandled, since the match grammar the action
//! library actually emits never produces it.

use fxhash::FxHashMap;
use lpft_core::{AsTag, IpNet, MatchField, MatchValue};

use crate::ast::{CmpOp, Expr, Value};
use crate::symtab::{AnnotationError, FieldKind, Symtab};

pub type AddressSetMap = FxHashMap<compact_str::CompactString, Vec<IpNet>>;
pub type PortGroupMap = FxHashMap<compact_str::CompactString, Vec<u32>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub field: MatchField,
    pub value: MatchValue,
    pub as_tag: Option<AsTag>,
}

/// §4.2/§4.3: which clause of which conjunction group this term belongs
/// to. `group` is a normalize-local index; the caller (the engine) binds
/// it to a real `ConjId` range sized `n_clauses` from the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConjDescriptor {
    pub group: usize,
    pub clause: u8,
    pub n_clauses: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormTerm {
    /// A complete rule: carries the logical flow's real actions directly.
    Plain(Vec<Atom>),
    /// One dimension-member clause of a conjunction group: carries only
    /// the `conjunction(id, clause/n_clauses)` action.
    Conj { atoms: Vec<Atom>, desc: ConjDescriptor },
}

#[derive(Debug, Clone, Copy)]
pub struct ConjGroupInfo {
    pub n_clauses: u8,
}

#[derive(Debug, Clone)]
pub struct NormResult {
    pub terms: Vec<NormTerm>,
    pub groups: Vec<ConjGroupInfo>,
    /// Per group, the shared non-dimension atoms for the terminal
    /// `conj_id=id` rule that carries the real actions (§4.8's "distinct
    /// rule... matching conj_id=id" pattern, reused here for ordinary
    /// logical flows).
    pub action_terms: Vec<(usize, Vec<Atom>)>,
}

#[derive(Debug, Default, Clone)]
pub struct RefSet {
    pub addr_sets: FxHashMap<compact_str::CompactString, u32>,
    pub port_groups: std::collections::HashSet<compact_str::CompactString>,
}

fn ipnet_match_value(field: MatchField, net: IpNet) -> anyhow::Result<MatchValue> {
    match (field, net) {
        (MatchField::Ip4Src | MatchField::Ip4Dst | MatchField::ArpSpa | MatchField::ArpTpa, IpNet::V4(addr, 32)) => {
            Ok(MatchValue::Ipv4(addr))
        }
        (MatchField::Ip4Src | MatchField::Ip4Dst, IpNet::V4(addr, prefix)) => {
            Ok(MatchValue::Ipv4Masked(addr, prefix_to_v4_mask(prefix)))
        }
        (MatchField::Ip6Src | MatchField::Ip6Dst | MatchField::NdTarget, IpNet::V6(addr, 128)) => {
            Ok(MatchValue::Ipv6(addr))
        }
        (MatchField::Ip6Src | MatchField::Ip6Dst, IpNet::V6(addr, prefix)) => {
            Ok(MatchValue::Ipv6Masked(addr, prefix_to_v6_mask(prefix)))
        }
        _ => anyhow::bail!("address-set member shape doesn't match field {field:?}"),
    }
}

fn prefix_to_v4_mask(prefix: u8) -> std::net::Ipv4Addr {
    let bits = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    std::net::Ipv4Addr::from(bits)
}

fn prefix_to_v6_mask(prefix: u8) -> std::net::Ipv6Addr {
    let bits: u128 = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
    std::net::Ipv6Addr::from(bits)
}

fn concrete_match_value(kind: FieldKind, op: CmpOp, value: &Value) -> anyhow::Result<MatchValue> {
    if op != CmpOp::Eq {
        anyhow::bail!("only == comparisons are supported against concrete literals");
    }
    match (kind, value) {
        (FieldKind::Ipv4, Value::Ipv4(a)) => Ok(MatchValue::Ipv4(*a)),
        (FieldKind::Ipv6, Value::Ipv6(a)) => Ok(MatchValue::Ipv6(*a)),
        (FieldKind::Mac, Value::Mac(m)) => Ok(MatchValue::Mac(*m)),
        (FieldKind::Int, Value::Int(n)) => Ok(MatchValue::U32(*n as u32)),
        _ => anyhow::bail!("comparison value shape doesn't match field kind"),
    }
}

enum Literal {
    Plain(Atom),
    Dim(usize, Atom),
}

fn leaf_to_literal(
    field: &str,
    op: CmpOp,
    value: &Value,
    symtab: &Symtab,
    asets: &AddressSetMap,
    pgroups: &PortGroupMap,
    refs: &mut RefSet,
    next_dim: &mut usize,
) -> anyhow::Result<Vec<Literal>> {
    let spec = symtab
        .get(field)
        .ok_or_else(|| anyhow::anyhow!(AnnotationError(format!("unknown field {field}"))))?;
    match value {
        Value::SetRef(name) => {
            if op != CmpOp::Eq {
                anyhow::bail!("only == is supported against an address set or port group");
            }
            if let Some(members) = asets.get(name) {
                *refs.addr_sets.entry(name.clone()).or_insert(0) += 1;
                let dim = *next_dim;
                *next_dim += 1;
                members
                    .iter()
                    .map(|net| {
                        let mv = ipnet_match_value(spec.match_field, *net)?;
                        let as_tag = Some(AsTag { name: name.clone(), ip: *net });
                        Ok(Literal::Dim(dim, Atom { field: spec.match_field, value: mv, as_tag }))
                    })
                    .collect()
            } else if let Some(members) = pgroups.get(name) {
                refs.port_groups.insert(name.clone());
                let dim = *next_dim;
                *next_dim += 1;
                Ok(members
                    .iter()
                    .map(|tag| {
                        Literal::Dim(
                            dim,
                            Atom { field: spec.match_field, value: MatchValue::U32(*tag), as_tag: None },
                        )
                    })
                    .collect())
            } else {
                anyhow::bail!(AnnotationError(format!("unknown address set or port group: {name}")))
            }
        }
        other => {
            let mv = concrete_match_value(spec.kind, op, other)?;
            Ok(vec![Literal::Plain(Atom { field: spec.match_field, value: mv, as_tag: None })])
        }
    }
}

/// Flattens a flat `&&`-chain into its leaves (`Cmp` only; `True` drops
/// out, anything else is a grammar violation at this stage).
fn and_chain(e: &Expr, out: &mut Vec<Expr>) -> anyhow::Result<()> {
    match e {
        Expr::And(a, b) => {
            and_chain(a, out)?;
            and_chain(b, out)?;
            Ok(())
        }
        Expr::True => Ok(()),
        Expr::Cmp { .. } => {
            out.push(e.clone());
            Ok(())
        }
        Expr::False => anyhow::bail!("unsatisfiable conjunct"),
        Expr::Or(..) => anyhow::bail!("nested `||` beneath `&&` is not supported"),
        Expr::Not(..) | Expr::ChassisResident(..) => {
            anyhow::bail!("normalize() requires a simplified, chassis-resolved expression")
        }
    }
}

fn or_chain(e: &Expr, out: &mut Vec<Expr>) {
    match e {
        Expr::Or(a, b) => {
            or_chain(a, out);
            or_chain(b, out);
        }
        other => out.push(other.clone()),
    }
}

/// §4.3 steps 6-7: normalize `e` to conjunctive clauses and directly to
/// `Atom` lists (the `OfMatch`-ready representation), compressing
/// multi-dimension cartesian products into OpenFlow conjunctions.
pub fn normalize(
    e: &Expr,
    symtab: &Symtab,
    asets: &AddressSetMap,
    pgroups: &PortGroupMap,
) -> anyhow::Result<(NormResult, RefSet)> {
    let mut refs = RefSet::default();
    let mut result = NormResult { terms: Vec::new(), groups: Vec::new(), action_terms: Vec::new() };

    let mut top = Vec::new();
    or_chain(e, &mut top);

    for chain_expr in &top {
        if matches!(chain_expr, Expr::False) {
            continue;
        }
        let mut leaves = Vec::new();
        and_chain(chain_expr, &mut leaves)?;
        if leaves.is_empty() {
            // A bare `True` disjunct: matches everything. Emit as a
            // single unconditional term.
            result.terms.push(NormTerm::Plain(Vec::new()));
            continue;
        }

        let mut next_dim = 0usize;
        let mut plain_atoms = Vec::new();
        let mut dims: Vec<Vec<Atom>> = Vec::new();
        for leaf in &leaves {
            let (field, op, value) = match leaf {
                Expr::Cmp { field, op, value } => (field.as_str(), *op, value),
                _ => unreachable!("and_chain only emits Cmp leaves"),
            };
            let lits = leaf_to_literal(field, op, value, symtab, asets, pgroups, &mut refs, &mut next_dim)?;
            for lit in lits {
                match lit {
                    Literal::Plain(atom) => plain_atoms.push(atom),
                    Literal::Dim(dim, atom) => {
                        if dims.len() <= dim {
                            dims.resize_with(dim + 1, Vec::new);
                        }
                        dims[dim].push(atom);
                    }
                }
            }
        }

        match dims.len() {
            0 => result.terms.push(NormTerm::Plain(plain_atoms)),
            1 => {
                for atom in dims.into_iter().next().unwrap() {
                    let mut atoms = plain_atoms.clone();
                    atoms.push(atom);
                    result.terms.push(NormTerm::Plain(atoms));
                }
            }
            k => {
                if k > u8::MAX as usize {
                    anyhow::bail!("too many conjunction dimensions in one match: {k}");
                }
                let group = result.groups.len();
                result.groups.push(ConjGroupInfo { n_clauses: k as u8 });
                result.action_terms.push((group, plain_atoms.clone()));
                for (i, members) in dims.into_iter().enumerate() {
                    let desc = ConjDescriptor { group, clause: i as u8 + 1, n_clauses: k as u8 };
                    for atom in members {
                        let mut atoms = plain_atoms.clone();
                        atoms.push(atom);
                        result.terms.push(NormTerm::Conj { atoms, desc });
                    }
                }
            }
        }
    }

    Ok((result, refs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Value;
    use std::net::Ipv4Addr;

    fn asets_with(name: &str, addrs: &[&str]) -> AddressSetMap {
        let mut m = AddressSetMap::default();
        m.insert(
            name.into(),
            addrs.iter().map(|a| IpNet::host_v4(a.parse().unwrap())).collect(),
        );
        m
    }

    #[test]
    fn scenario1_single_exact_match() {
        let symtab = Symtab::default();
        let e = Expr::Cmp { field: "ip4.dst".into(), op: CmpOp::Eq, value: Value::Ipv4(Ipv4Addr::new(10, 0, 0, 1)) };
        let (res, refs) = normalize(&e, &symtab, &AddressSetMap::default(), &PortGroupMap::default()).unwrap();
        assert_eq!(res.terms.len(), 1);
        assert!(matches!(&res.terms[0], NormTerm::Plain(atoms) if atoms.len() == 1));
        assert!(refs.addr_sets.is_empty());
    }

    #[test]
    fn scenario2_address_set_disjunction_no_conjunction() {
        let symtab = Symtab::default();
        let asets = asets_with("s", &["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
        let e = Expr::Cmp { field: "ip4.src".into(), op: CmpOp::Eq, value: Value::SetRef("s".into()) };
        let (res, refs) = normalize(&e, &symtab, &asets, &PortGroupMap::default()).unwrap();
        assert_eq!(res.terms.len(), 3);
        assert!(res.terms.iter().all(|t| matches!(t, NormTerm::Plain(_))));
        assert_eq!(res.groups.len(), 0);
        assert_eq!(refs.addr_sets.get("s"), Some(&1));
    }

    #[test]
    fn scenario3_cross_set_cartesian_uses_one_conjunction_group() {
        let symtab = Symtab::default();
        let mut asets = asets_with("a", &["1.1.1.1", "1.1.1.2"]);
        asets.extend(asets_with("b", &["2.2.2.1", "2.2.2.2"]));
        let e = Expr::Cmp { field: "ip4.src".into(), op: CmpOp::Eq, value: Value::SetRef("a".into()) }
            .and(Expr::Cmp { field: "ip4.dst".into(), op: CmpOp::Eq, value: Value::SetRef("b".into()) });
        let (res, _refs) = normalize(&e, &symtab, &asets, &PortGroupMap::default()).unwrap();
        assert_eq!(res.groups.len(), 1);
        assert_eq!(res.groups[0].n_clauses, 2);
        assert_eq!(res.terms.len(), 4);
        assert!(res.terms.iter().all(|t| matches!(t, NormTerm::Conj { .. })));
        assert_eq!(res.action_terms.len(), 1);
    }

    use proptest::prelude::*;

    fn gen_set(name: &'static str, max: usize) -> impl Strategy<Value = (AddressSetMap, usize)> {
        (1..=max).prop_map(move |n| {
            let addrs: Vec<String> = (0..n).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
            let refs: Vec<&str> = addrs.iter().map(|s| s.as_str()).collect();
            (asets_with(name, &refs), n)
        })
    }

    proptest! {
        /// Two `==`-to-set comparisons ANDed together always collapse to
        /// exactly one conjunction group sized to the dimension count,
        /// never a full `m*n` cartesian enumeration (§8 scenario 3).
        #[test]
        fn cartesian_pairs_always_use_one_conjunction_group(
            (a_set, a_n) in gen_set("a", 6),
            (b_set, b_n) in gen_set("b", 6),
        ) {
            let symtab = Symtab::default();
            let mut asets = a_set;
            asets.extend(b_set);
            let e = Expr::Cmp { field: "ip4.src".into(), op: CmpOp::Eq, value: Value::SetRef("a".into()) }
                .and(Expr::Cmp { field: "ip4.dst".into(), op: CmpOp::Eq, value: Value::SetRef("b".into()) });
            let (res, _refs) = normalize(&e, &symtab, &asets, &PortGroupMap::default()).unwrap();
            prop_assert_eq!(res.groups.len(), 1);
            prop_assert_eq!(res.groups[0].n_clauses, 2);
            prop_assert_eq!(res.terms.len(), a_n + b_n);
            prop_assert_eq!(res.action_terms.len(), 1);
        }
    }
}
