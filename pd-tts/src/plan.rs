//! Fast-path planning.
//!
//! A [`Plan`] is the ordered list of cheap checks a stub performs before it
//! gives up and tail-jumps to the general routine. Plans are sound, not
//! complete: an `Accept` or `Reject` decision is always correct, anything
//! the planner cannot prove is left to the slow path.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{StubError, StubResult};
use crate::hierarchy::{CidRange, ClassId, ClassInfo, HierarchyOracle};
use crate::object::Instance;
use crate::types::{Type, TypeKind};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Accept,
    Reject,
    FallThroughToSlowPath,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Accept => f.write_str("accept"),
            Outcome::Reject => f.write_str("reject"),
            Outcome::FallThroughToSlowPath => f.write_str("slow-path"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Branch {
    Continue,
    Decide(Outcome),
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Branch::Continue => f.write_str("continue"),
            Branch::Decide(outcome) => write!(f, "{outcome}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Check {
    /// On null decide `on_null`, otherwise continue. In type-argument plans
    /// "null" means the descriptor is nullable.
    IsNull { on_null: Outcome },
    /// Subject's runtime type (or the descriptor itself) is exactly `ty`:
    /// accept.
    IdentityEquals { ty: Type },
    ClassIdEquals {
        id: ClassId,
        on_match: Branch,
        on_miss: Branch,
    },
    ClassIdInRange {
        range: CidRange,
        on_match: Branch,
        on_miss: Branch,
    },
    /// Runs `plan` against type argument `index` of the subject; anything but
    /// `Accept` transfers to the slow path.
    RecurseTypeArgument { index: usize, plan: Box<Plan> },
}

impl Check {
    fn class_id_test(range: CidRange, on_match: Branch, on_miss: Branch) -> Self {
        if range.is_single() {
            Check::ClassIdEquals {
                id: range.lo,
                on_match,
                on_miss,
            }
        } else {
            Check::ClassIdInRange {
                range,
                on_match,
                on_miss,
            }
        }
    }

    fn derefs_subject(&self) -> bool {
        !matches!(self, Check::IsNull { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub checks: Vec<Check>,
    pub terminal: Outcome,
}

impl Plan {
    pub fn new(checks: Vec<Check>, terminal: Outcome) -> Self {
        Self { checks, terminal }
    }

    pub fn decide(terminal: Outcome) -> Self {
        Self::new(Vec::new(), terminal)
    }

    /// The plan the shared slow-path stub is lowered from.
    pub fn slow_path() -> Self {
        Self::decide(Outcome::FallThroughToSlowPath)
    }

    /// True when some path through the plan (nested plans included) ends in a
    /// slow-path transfer.
    pub fn reaches_slow_path(&self) -> bool {
        if self.terminal == Outcome::FallThroughToSlowPath {
            return true;
        }
        let slow = Branch::Decide(Outcome::FallThroughToSlowPath);
        self.checks.iter().any(|check| match check {
            Check::IsNull { on_null } => *on_null == Outcome::FallThroughToSlowPath,
            Check::IdentityEquals { .. } => false,
            Check::ClassIdEquals {
                on_match, on_miss, ..
            }
            | Check::ClassIdInRange {
                on_match, on_miss, ..
            } => *on_match == slow || *on_miss == slow,
            Check::RecurseTypeArgument { .. } => true,
        })
    }

    pub fn depth(&self) -> usize {
        self.checks
            .iter()
            .map(|check| match check {
                Check::RecurseTypeArgument { plan, .. } => 1 + plan.depth(),
                _ => 0,
            })
            .max()
            .unwrap_or(0)
    }

    /// Structural invariants every planner output satisfies.
    pub fn validate(&self, max_depth: usize) -> StubResult<()> {
        if self.depth() > max_depth {
            return Err(StubError::InvalidPlan(format!(
                "type argument nesting {} exceeds {max_depth}",
                self.depth()
            )));
        }
        self.validate_level(true)
    }

    fn validate_level(&self, top_level: bool) -> StubResult<()> {
        let mut null_checked = !top_level;
        let mut exact_class: Option<ClassId> = None;
        for (position, check) in self.checks.iter().enumerate() {
            if check.derefs_subject() && !null_checked {
                return Err(StubError::InvalidPlan(format!(
                    "check {position} dereferences the subject before a null check"
                )));
            }
            match check {
                Check::IsNull { on_null } => {
                    if !top_level && *on_null == Outcome::Reject {
                        return Err(StubError::InvalidPlan(
                            "type argument plan rejects on nullable descriptor".to_string(),
                        ));
                    }
                    null_checked = true;
                }
                Check::IdentityEquals { .. } => {}
                Check::ClassIdEquals {
                    id,
                    on_match,
                    on_miss,
                } => {
                    validate_branches(top_level, *on_match, *on_miss)?;
                    if *on_match == Branch::Continue {
                        exact_class = Some(*id);
                    }
                }
                Check::ClassIdInRange {
                    on_match, on_miss, ..
                } => validate_branches(top_level, *on_match, *on_miss)?,
                Check::RecurseTypeArgument { index, plan } => {
                    if exact_class.is_none() {
                        return Err(StubError::InvalidPlan(format!(
                            "type argument {index} checked without an exact class guard"
                        )));
                    }
                    plan.validate_level(false)?;
                }
            }
        }
        if !top_level && self.terminal == Outcome::Reject {
            return Err(StubError::InvalidPlan(
                "type argument plan rejects".to_string(),
            ));
        }
        Ok(())
    }

    /// Interprets the plan against an instance (`None` is null).
    pub fn evaluate(&self, instance: Option<&Instance>) -> Outcome {
        self.evaluate_subject(Subject::Instance(instance))
    }

    /// Interprets a type-argument plan against a descriptor.
    pub fn evaluate_descriptor(&self, descriptor: &Type) -> Outcome {
        self.evaluate_subject(Subject::Descriptor(descriptor))
    }

    fn evaluate_subject(&self, subject: Subject<'_>) -> Outcome {
        for check in &self.checks {
            if check.derefs_subject() && subject.is_null_pointer() {
                return Outcome::FallThroughToSlowPath;
            }
            let branch = match check {
                Check::IsNull { on_null } => {
                    if subject.is_null() {
                        Branch::Decide(*on_null)
                    } else {
                        Branch::Continue
                    }
                }
                Check::IdentityEquals { ty } => {
                    if subject.runtime_type().is_some_and(|rt| rt == ty) {
                        Branch::Decide(Outcome::Accept)
                    } else {
                        Branch::Continue
                    }
                }
                Check::ClassIdEquals {
                    id,
                    on_match,
                    on_miss,
                } => {
                    if subject.class_id() == *id {
                        *on_match
                    } else {
                        *on_miss
                    }
                }
                Check::ClassIdInRange {
                    range,
                    on_match,
                    on_miss,
                } => {
                    if range.contains(subject.class_id()) {
                        *on_match
                    } else {
                        *on_miss
                    }
                }
                Check::RecurseTypeArgument { index, plan } => {
                    let arg = subject
                        .runtime_type()
                        .and_then(|rt| rt.type_args().get(*index));
                    match arg.map(|arg| plan.evaluate_descriptor(arg)) {
                        Some(Outcome::Accept) => Branch::Continue,
                        _ => Branch::Decide(Outcome::FallThroughToSlowPath),
                    }
                }
            };
            if let Branch::Decide(outcome) = branch {
                return outcome;
            }
        }
        self.terminal
    }

    fn fmt_indented(&self, f: &mut std::fmt::Formatter<'_>, indent: usize) -> std::fmt::Result {
        let pad = "  ".repeat(indent);
        for check in &self.checks {
            match check {
                Check::IsNull { on_null } => writeln!(f, "{pad}is-null -> {on_null}")?,
                Check::IdentityEquals { ty } => writeln!(f, "{pad}identical {ty} -> accept")?,
                Check::ClassIdEquals {
                    id,
                    on_match,
                    on_miss,
                } => writeln!(f, "{pad}cid == {} -> {on_match} else {on_miss}", id.0)?,
                Check::ClassIdInRange {
                    range,
                    on_match,
                    on_miss,
                } => writeln!(f, "{pad}cid in {range} -> {on_match} else {on_miss}")?,
                Check::RecurseTypeArgument { index, plan } => {
                    writeln!(f, "{pad}arg[{index}]:")?;
                    plan.fmt_indented(f, indent + 1)?;
                }
            }
        }
        writeln!(f, "{pad}=> {}", self.terminal)
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_indented(f, 0)
    }
}

fn validate_branches(top_level: bool, on_match: Branch, on_miss: Branch) -> StubResult<()> {
    if on_match == Branch::Continue && on_miss == Branch::Continue {
        return Err(StubError::InvalidPlan(
            "class id check continues on both edges".to_string(),
        ));
    }
    let reject = Branch::Decide(Outcome::Reject);
    if !top_level && (on_match == reject || on_miss == reject) {
        return Err(StubError::InvalidPlan(
            "type argument plan rejects on class id".to_string(),
        ));
    }
    Ok(())
}

#[derive(Copy, Clone)]
enum Subject<'a> {
    Instance(Option<&'a Instance>),
    Descriptor(&'a Type),
}

impl Subject<'_> {
    fn is_null_pointer(&self) -> bool {
        matches!(self, Subject::Instance(None))
    }

    fn is_null(&self) -> bool {
        match self {
            Subject::Instance(instance) => instance.is_none(),
            Subject::Descriptor(ty) => ty.is_nullable(),
        }
    }

    fn class_id(&self) -> ClassId {
        match self {
            Subject::Instance(instance) => instance.map_or(ClassId::NULL, Instance::class_id),
            Subject::Descriptor(ty) => ty.class_id(),
        }
    }

    fn runtime_type(&self) -> Option<&Type> {
        match self {
            Subject::Instance(instance) => instance.map(Instance::runtime_type),
            Subject::Descriptor(ty) => Some(*ty),
        }
    }
}

/// Chooses the cheapest sound check sequence for a target type.
pub struct Planner {
    oracle: Arc<dyn HierarchyOracle>,
    max_depth: usize,
}

impl Planner {
    pub fn new(oracle: Arc<dyn HierarchyOracle>, max_depth: usize) -> Self {
        Self { oracle, max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Plans a stub for `ty`. `class_info` may carry precomputed facts about
    /// the target class; when absent the oracle is consulted.
    pub fn plan(&self, ty: &Type, class_info: Option<&ClassInfo>) -> Plan {
        let plan = self.plan_target(ty, class_info);
        debug!(
            ty = %ty,
            checks = plan.checks.len(),
            terminal = %plan.terminal,
            "planned type test"
        );
        plan
    }

    fn plan_target(&self, ty: &Type, class_info: Option<&ClassInfo>) -> Plan {
        if ty.is_top() {
            return Plan::decide(Outcome::Accept);
        }
        let (class, args) = match ty.kind() {
            TypeKind::Dynamic | TypeKind::Void => return Plan::decide(Outcome::Accept),
            TypeKind::Never => return Plan::decide(Outcome::Reject),
            TypeKind::Null => {
                return Plan::new(
                    vec![Check::IsNull {
                        on_null: Outcome::Accept,
                    }],
                    Outcome::Reject,
                );
            }
            TypeKind::Function { .. } | TypeKind::Parameter(_) => return open_plan(ty),
            TypeKind::Class { class, args } => (*class, args),
        };
        if class == ClassId::OBJECT {
            return Plan::new(
                vec![Check::IsNull {
                    on_null: Outcome::Reject,
                }],
                Outcome::Accept,
            );
        }

        let looked_up;
        let info = match class_info {
            Some(info) if info.id == class => Some(info),
            _ => {
                looked_up = self.oracle.class_info(class);
                looked_up.as_ref()
            }
        };
        match info {
            Some(info) if info.is_sealed => self.plan_sealed(ty, info, args),
            _ => open_plan(ty),
        }
    }

    fn plan_sealed(&self, ty: &Type, info: &ClassInfo, args: &[Type]) -> Plan {
        let on_null = if ty.is_nullable() {
            Outcome::Accept
        } else {
            Outcome::Reject
        };
        let mut checks = vec![Check::IsNull { on_null }];
        if info.ranges.is_empty() {
            return Plan::new(checks, Outcome::Reject);
        }

        if args.iter().all(Type::is_top) {
            checks.extend(info.ranges.iter().map(|range| {
                Check::class_id_test(
                    *range,
                    Branch::Decide(Outcome::Accept),
                    Branch::Continue,
                )
            }));
            return Plan::new(checks, Outcome::Reject);
        }

        if !ty.is_nullable() {
            checks.push(Check::IdentityEquals { ty: ty.clone() });
        }
        if let [range] = info.ranges.as_slice() {
            if info.is_leaf() {
                checks.push(Check::ClassIdEquals {
                    id: info.id,
                    on_match: Branch::Continue,
                    on_miss: Branch::Decide(Outcome::Reject),
                });
            } else {
                checks.push(Check::class_id_test(
                    *range,
                    Branch::Continue,
                    Branch::Decide(Outcome::Reject),
                ));
            }
        }
        if info.is_abstract {
            // Instances always carry a subclass id whose arguments live at
            // other positions.
            return Plan::new(checks, Outcome::FallThroughToSlowPath);
        }
        if !info.is_leaf() {
            checks.push(Check::ClassIdEquals {
                id: info.id,
                on_match: Branch::Continue,
                on_miss: Branch::Decide(Outcome::FallThroughToSlowPath),
            });
        }

        let mut arg_checks = Vec::new();
        for (index, arg) in args.iter().enumerate() {
            if arg.is_top() {
                continue;
            }
            match self.plan_argument(arg, 1) {
                Some(plan) => arg_checks.push(Check::RecurseTypeArgument {
                    index,
                    plan: Box::new(plan),
                }),
                None => {
                    warn!(ty = %ty, arg = %arg, "type argument not decidable inline, using slow path");
                    return Plan::new(checks, Outcome::FallThroughToSlowPath);
                }
            }
        }
        checks.extend(arg_checks);
        Plan::new(checks, Outcome::Accept)
    }

    /// Plan run against the descriptor of a type argument. `None` when the
    /// argument cannot be decided without the general algorithm.
    fn plan_argument(&self, arg: &Type, depth: usize) -> Option<Plan> {
        if depth > self.max_depth {
            return None;
        }
        if arg.is_top() {
            return Some(Plan::decide(Outcome::Accept));
        }
        let TypeKind::Class { class, args } = arg.kind() else {
            return None;
        };
        let mut checks = Vec::new();
        if !arg.is_nullable() {
            checks.push(Check::IsNull {
                on_null: Outcome::FallThroughToSlowPath,
            });
        }
        if *class == ClassId::OBJECT {
            return Some(Plan::new(checks, Outcome::Accept));
        }
        let info = self.oracle.class_info(*class)?;
        if !info.is_sealed || info.ranges.is_empty() {
            return None;
        }

        if args.iter().all(Type::is_top) {
            checks.extend(info.ranges.iter().map(|range| {
                Check::class_id_test(
                    *range,
                    Branch::Decide(Outcome::Accept),
                    Branch::Continue,
                )
            }));
            return Some(Plan::new(checks, Outcome::FallThroughToSlowPath));
        }

        checks.push(Check::IdentityEquals { ty: arg.clone() });
        checks.push(Check::ClassIdEquals {
            id: info.id,
            on_match: Branch::Continue,
            on_miss: Branch::Decide(Outcome::FallThroughToSlowPath),
        });
        for (index, nested) in args.iter().enumerate() {
            if nested.is_top() {
                continue;
            }
            let plan = self.plan_argument(nested, depth + 1)?;
            checks.push(Check::RecurseTypeArgument {
                index,
                plan: Box::new(plan),
            });
        }
        Some(Plan::new(checks, Outcome::Accept))
    }
}

fn open_plan(ty: &Type) -> Plan {
    if ty.is_nullable() {
        Plan::new(
            vec![Check::IsNull {
                on_null: Outcome::Accept,
            }],
            Outcome::FallThroughToSlowPath,
        )
    } else {
        Plan::slow_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{ClassDecl, ClassTable};
    use crate::types::TypeTable;

    struct Fixture {
        classes: Arc<ClassTable>,
        types: TypeTable,
        planner: Planner,
    }

    fn fixture() -> Fixture {
        let classes = Arc::new(ClassTable::new());
        let types = TypeTable::new(classes.clone());
        let planner = Planner::new(classes.clone(), 3);
        Fixture {
            classes,
            types,
            planner,
        }
    }

    #[test]
    fn top_types_accept_without_checks() {
        let fx = fixture();
        for ty in [fx.types.dynamic(), fx.types.void(), fx.types.object_nullable()] {
            assert_eq!(fx.planner.plan(&ty, None), Plan::decide(Outcome::Accept));
        }
        assert_eq!(
            fx.planner.plan(&fx.types.never(), None),
            Plan::decide(Outcome::Reject)
        );
    }

    #[test]
    fn object_rejects_only_null() {
        let fx = fixture();
        let plan = fx.planner.plan(&fx.types.object(), None);
        assert_eq!(
            plan,
            Plan::new(
                vec![Check::IsNull {
                    on_null: Outcome::Reject
                }],
                Outcome::Accept
            )
        );
        assert_eq!(plan.evaluate(None), Outcome::Reject);
    }

    #[test]
    fn class_with_multiple_ranges_checks_each() {
        let fx = fixture();
        let shape = fx
            .classes
            .load_class(ClassDecl::new("Shape").sealed())
            .expect("load");
        fx.classes.load_class(ClassDecl::new("Gap")).expect("load");
        let late = fx
            .classes
            .load_class(ClassDecl::new("Late").extends(shape))
            .expect("load");
        let ty = fx.types.class(shape, Vec::new()).expect("type");
        let plan = fx.planner.plan(&ty, None);
        assert_eq!(plan.checks.len(), 3);
        assert_eq!(plan.terminal, Outcome::Reject);
        let late_instance = Instance::new(&fx.types.class(late, Vec::new()).expect("type"));
        assert_eq!(plan.evaluate(Some(&late_instance)), Outcome::Accept);
        plan.validate(3).expect("valid");
    }

    #[test]
    fn open_type_argument_degrades_generic_plan() {
        let fx = fixture();
        let list = fx
            .classes
            .load_class(ClassDecl::new("List").sealed().type_params(1))
            .expect("load");
        let plugin = fx.classes.load_class(ClassDecl::new("Plugin")).expect("load");
        let plugin_ty = fx.types.class(plugin, Vec::new()).expect("type");
        let ty = fx.types.class(list, vec![plugin_ty]).expect("type");
        let plan = fx.planner.plan(&ty, None);
        assert_eq!(plan.terminal, Outcome::FallThroughToSlowPath);
        assert!(
            !plan
                .checks
                .iter()
                .any(|check| matches!(check, Check::RecurseTypeArgument { .. }))
        );
        assert!(plan.checks.contains(&Check::ClassIdEquals {
            id: list,
            on_match: Branch::Continue,
            on_miss: Branch::Decide(Outcome::Reject),
        }));
    }

    #[test]
    fn nesting_beyond_max_depth_is_inconclusive() {
        let fx = fixture();
        let boxed = fx
            .classes
            .load_class(ClassDecl::new("Box").sealed().type_params(1))
            .expect("load");
        let leaf = fx
            .classes
            .load_class(ClassDecl::new("Leaf").sealed())
            .expect("load");
        let mut ty = fx.types.class(leaf, Vec::new()).expect("type");
        for _ in 0..5 {
            ty = fx.types.class(boxed, vec![ty]).expect("type");
        }
        let plan = fx.planner.plan(&ty, None);
        assert_eq!(plan.terminal, Outcome::FallThroughToSlowPath);
        assert_eq!(plan.depth(), 0);

        let shallow = Planner::new(fx.classes.clone(), 8).plan(&ty, None);
        assert_eq!(shallow.terminal, Outcome::Accept);
        assert_eq!(shallow.depth(), 5);
        shallow.validate(8).expect("valid");
        assert!(shallow.validate(2).is_err());
    }

    #[test]
    fn validate_rejects_malformed_plans() {
        let fx = fixture();
        let unguarded = Plan::new(
            vec![Check::ClassIdEquals {
                id: ClassId(9),
                on_match: Branch::Decide(Outcome::Accept),
                on_miss: Branch::Continue,
            }],
            Outcome::Reject,
        );
        assert!(unguarded.validate(3).is_err());

        let both_continue = Plan::new(
            vec![
                Check::IsNull {
                    on_null: Outcome::Reject,
                },
                Check::ClassIdEquals {
                    id: ClassId(9),
                    on_match: Branch::Continue,
                    on_miss: Branch::Continue,
                },
            ],
            Outcome::Reject,
        );
        assert!(both_continue.validate(3).is_err());

        let rejecting_arg = Plan::new(
            vec![
                Check::IsNull {
                    on_null: Outcome::Reject,
                },
                Check::ClassIdEquals {
                    id: ClassId(9),
                    on_match: Branch::Continue,
                    on_miss: Branch::Decide(Outcome::Reject),
                },
                Check::RecurseTypeArgument {
                    index: 0,
                    plan: Box::new(Plan::decide(Outcome::Reject)),
                },
            ],
            Outcome::Accept,
        );
        assert!(rejecting_arg.validate(3).is_err());

        assert!(fx.planner.plan(&fx.types.object(), None).validate(3).is_ok());
    }

    #[test]
    fn display_lists_checks_in_order() {
        let fx = fixture();
        let animal = fx
            .classes
            .load_class(ClassDecl::new("Animal").sealed())
            .expect("load");
        let ty = fx.types.class(animal, Vec::new()).expect("type");
        let rendered = fx.planner.plan(&ty, None).to_string();
        assert_eq!(
            rendered,
            format!(
                "is-null -> reject\ncid == {} -> accept else continue\n=> reject\n",
                animal.0
            )
        );
    }
}
