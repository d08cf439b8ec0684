#![allow(dead_code, unused_imports)]

use std::sync::Arc;

pub use tts::{
    Arch, Check, ClassDecl, ClassId, ClassTable, HierarchyOracle, Instance, Outcome, Plan,
    Planner, SlowPathLinkage, StubCompiler, StubConfig, StubRegistry, SubtypeTester, Type,
    TypeTable, native_stubs_supported,
};

/// Demo hierarchy with fixed class ids:
///
/// - 9 `Shape` (sealed, abstract), 10..=14 its concrete subclasses
/// - 15 `String` (sealed), 16 `List<E>` (sealed), 17 `Plugin` (open)
/// - 18 `PluginImpl`, 20 `Unrelated` (sealed), 42 `Animal` (sealed)
pub struct Zoo {
    pub classes: Arc<ClassTable>,
    pub types: Arc<TypeTable>,
    pub shape: ClassId,
    pub circle: ClassId,
    pub square: ClassId,
    pub triangle: ClassId,
    pub string: ClassId,
    pub list: ClassId,
    pub plugin: ClassId,
    pub plugin_impl: ClassId,
    pub unrelated: ClassId,
    pub animal: ClassId,
}

impl Zoo {
    pub fn new() -> Self {
        let classes = Arc::new(ClassTable::new());
        let load = |decl: ClassDecl| classes.load_class(decl).expect("load class");

        load(ClassDecl::new("Padding8").sealed());
        let shape = load(ClassDecl::new("Shape").sealed().abstract_class());
        let circle = load(ClassDecl::new("Circle").sealed().extends(shape));
        let square = load(ClassDecl::new("Square").sealed().extends(shape));
        let triangle = load(ClassDecl::new("Triangle").sealed().extends(shape));
        load(ClassDecl::new("Rhombus").sealed().extends(shape));
        load(ClassDecl::new("Hexagon").sealed().extends(shape));
        let string = load(ClassDecl::new("String").sealed());
        let list = load(ClassDecl::new("List").sealed().type_params(1));
        let plugin = load(ClassDecl::new("Plugin"));
        let plugin_impl = load(ClassDecl::new("PluginImpl").extends(plugin));
        load(ClassDecl::new("Padding19").sealed());
        let unrelated = load(ClassDecl::new("Unrelated").sealed());
        for index in 21..42 {
            load(ClassDecl::new(format!("Padding{index}")).sealed());
        }
        let animal = load(ClassDecl::new("Animal").sealed());

        assert_eq!(shape, ClassId(9));
        assert_eq!(triangle, ClassId(12));
        assert_eq!(list, ClassId(16));
        assert_eq!(unrelated, ClassId(20));
        assert_eq!(animal, ClassId(42));

        let types = Arc::new(TypeTable::new(classes.clone()));
        Self {
            classes,
            types,
            shape,
            circle,
            square,
            triangle,
            string,
            list,
            plugin,
            plugin_impl,
            unrelated,
            animal,
        }
    }

    pub fn ty(&self, class: ClassId) -> Type {
        self.types.class(class, Vec::new()).expect("class type")
    }

    pub fn list_of(&self, element: &Type) -> Type {
        self.types
            .class(self.list, vec![element.clone()])
            .expect("list type")
    }

    pub fn instance(&self, class: ClassId) -> Box<Instance> {
        Instance::new(&self.ty(class))
    }

    pub fn planner(&self) -> Planner {
        Planner::new(self.classes.clone(), 3)
    }

    pub fn tester(&self) -> Arc<SubtypeTester> {
        Arc::new(SubtypeTester::new(self.classes.clone(), self.types.clone()))
    }

    pub fn compiler(&self, config: StubConfig) -> StubCompiler {
        StubCompiler::new(config, self.classes.clone())
    }

    pub fn registry(&self, config: StubConfig) -> StubRegistry {
        StubRegistry::new(self.compiler(config), self.tester())
    }
}

/// Host config that produces executable stubs where the host supports them.
pub fn host_config(linkage: SlowPathLinkage) -> StubConfig {
    StubConfig {
        enabled: native_stubs_supported(),
        arch: Arch::host(),
        slow_path_linkage: linkage,
        max_type_arg_depth: 3,
    }
}

pub fn foreign_arch() -> Arch {
    match Arch::host() {
        Arch::X86_64 => Arch::AArch64,
        Arch::AArch64 => Arch::X86_64,
    }
}
