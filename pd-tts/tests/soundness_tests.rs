mod common;

use std::sync::Arc;

use common::*;
use proptest::prelude::*;
use proptest::sample::Index;
use tts::{GeneralSubtypeTest, SuperArg};

#[derive(Clone, Debug)]
struct ClassSpec {
    parent: Option<usize>,
    sealed: bool,
    is_abstract: bool,
    generic: bool,
}

#[derive(Clone, Debug)]
enum TypeSpec {
    Dynamic,
    Null,
    Object,
    Class {
        class: usize,
        nullable: bool,
        arg: Option<Box<TypeSpec>>,
    },
}

fn arb_classes() -> impl Strategy<Value = Vec<ClassSpec>> {
    prop::collection::vec(
        (
            any::<Index>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
        ),
        1..8,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(
                |(position, (parent, has_parent, sealed, is_abstract, generic))| ClassSpec {
                    parent: (has_parent && position > 0).then(|| parent.index(position)),
                    sealed,
                    is_abstract,
                    generic,
                },
            )
            .collect()
    })
}

fn arb_type() -> impl Strategy<Value = TypeSpec> {
    let leaf = prop_oneof![
        Just(TypeSpec::Dynamic),
        Just(TypeSpec::Null),
        Just(TypeSpec::Object),
        (0usize..8, any::<bool>()).prop_map(|(class, nullable)| TypeSpec::Class {
            class,
            nullable,
            arg: None,
        }),
    ];
    leaf.prop_recursive(3, 12, 1, |inner| {
        (0usize..8, any::<bool>(), inner).prop_map(|(class, nullable, arg)| TypeSpec::Class {
            class,
            nullable,
            arg: Some(Box::new(arg)),
        })
    })
}

struct World {
    classes: Arc<ClassTable>,
    types: Arc<TypeTable>,
    ids: Vec<ClassId>,
    specs: Vec<ClassSpec>,
}

impl World {
    fn build(specs: &[ClassSpec]) -> Self {
        let classes = Arc::new(ClassTable::new());
        let mut ids: Vec<ClassId> = Vec::new();
        for (position, spec) in specs.iter().enumerate() {
            let mut decl = ClassDecl::new(format!("C{position}"));
            if spec.sealed {
                decl = decl.sealed();
            }
            if spec.is_abstract {
                decl = decl.abstract_class();
            }
            if spec.generic {
                decl = decl.type_params(1);
            }
            if let Some(parent) = spec.parent {
                decl = if spec.generic && specs[parent].generic {
                    decl.extends_with(ids[parent], vec![SuperArg::Param(0)])
                } else {
                    decl.extends(ids[parent])
                };
            }
            ids.push(classes.load_class(decl).expect("load"));
        }
        let types = Arc::new(TypeTable::new(classes.clone()));
        Self {
            classes,
            types,
            ids,
            specs: specs.to_vec(),
        }
    }

    fn ty(&self, spec: &TypeSpec) -> Type {
        match spec {
            TypeSpec::Dynamic => self.types.dynamic(),
            TypeSpec::Null => self.types.null(),
            TypeSpec::Object => self.types.object(),
            TypeSpec::Class {
                class,
                nullable,
                arg,
            } => {
                let position = class % self.ids.len();
                let args = match arg {
                    Some(arg) if self.specs[position].generic => vec![self.ty(arg)],
                    _ => Vec::new(),
                };
                let ty = self
                    .types
                    .class(self.ids[position], args)
                    .expect("class type");
                if *nullable {
                    self.types.nullable(&ty)
                } else {
                    ty
                }
            }
        }
    }

    /// A value whose runtime type is the non-nullable form of `spec`, or null
    /// when no such value exists.
    fn instance(&self, spec: &TypeSpec) -> Option<Box<Instance>> {
        match spec {
            TypeSpec::Dynamic | TypeSpec::Null => None,
            TypeSpec::Object => Some(Instance::new(&self.types.object())),
            TypeSpec::Class { class, .. } => {
                if self.specs[class % self.ids.len()].is_abstract {
                    return None;
                }
                let ty = self.types.non_nullable(&self.ty(spec));
                Some(Instance::new(&ty))
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fast_checks_never_contradict_the_general_test(
        classes in arb_classes(),
        targets in prop::collection::vec(arb_type(), 1..6),
        values in prop::collection::vec(arb_type(), 1..6),
    ) {
        let world = World::build(&classes);
        let tester = Arc::new(SubtypeTester::new(world.classes.clone(), world.types.clone()));
        let planner = Planner::new(world.classes.clone(), 3);
        let registry = StubRegistry::new(
            StubCompiler::new(host_config(SlowPathLinkage::ThreadSlot), world.classes.clone()),
            tester.clone(),
        );

        for target in &targets {
            let target = world.ty(target);
            let plan = planner.plan(&target, None);
            prop_assert!(plan.validate(3).is_ok(), "invalid plan for {}:\n{}", target, plan);
            for value in &values {
                let instance = world.instance(value);
                let instance = instance.as_deref();
                let expected = tester.is_instance_of(instance.map(Instance::runtime_type), &target);
                match plan.evaluate(instance) {
                    Outcome::Accept => prop_assert!(expected, "false accept for {}:\n{}", target, plan),
                    Outcome::Reject => prop_assert!(!expected, "false reject for {}:\n{}", target, plan),
                    Outcome::FallThroughToSlowPath => {}
                }
                let actual = registry.test(instance, &target).expect("stub call");
                prop_assert_eq!(actual, expected, "stub disagrees for {}:\n{}", target, plan);
            }
        }
    }
}
