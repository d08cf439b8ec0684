mod common;

use common::*;
use tts::{GeneralSubtypeTest, StubError, ThreadSlots};

fn demo_targets(zoo: &Zoo) -> Vec<Type> {
    let shape = zoo.ty(zoo.shape);
    let circle = zoo.ty(zoo.circle);
    vec![
        zoo.ty(zoo.animal),
        shape.clone(),
        zoo.types.nullable(&zoo.ty(zoo.string)),
        zoo.list_of(&shape),
        zoo.list_of(&zoo.types.nullable(&circle)),
        zoo.list_of(&zoo.list_of(&shape)),
        zoo.ty(zoo.plugin),
        zoo.types.nullable(&zoo.ty(zoo.plugin)),
        zoo.types.object(),
        zoo.types.null(),
        zoo.types.never(),
        zoo.types.dynamic(),
    ]
}

fn demo_instances(zoo: &Zoo) -> Vec<Option<Box<Instance>>> {
    let shape = zoo.ty(zoo.shape);
    let circle = zoo.ty(zoo.circle);
    vec![
        None,
        Some(zoo.instance(zoo.animal)),
        Some(zoo.instance(zoo.circle)),
        Some(zoo.instance(zoo.triangle)),
        Some(zoo.instance(zoo.string)),
        Some(zoo.instance(zoo.unrelated)),
        Some(zoo.instance(zoo.plugin_impl)),
        Some(Instance::new(&zoo.list_of(&shape))),
        Some(Instance::new(&zoo.list_of(&circle))),
        Some(Instance::new(&zoo.list_of(&zoo.ty(zoo.string)))),
        Some(Instance::new(&zoo.list_of(&zoo.list_of(&circle)))),
        Some(Instance::closure(&zoo.types.function(Vec::new(), circle))),
    ]
}

fn assert_agrees_with_slow_path(linkage: SlowPathLinkage) {
    let zoo = Zoo::new();
    let tester = zoo.tester();
    let registry = zoo.registry(host_config(linkage));
    for target in demo_targets(&zoo) {
        for instance in demo_instances(&zoo) {
            let instance = instance.as_deref();
            let expected = tester.is_instance_of(instance.map(Instance::runtime_type), &target);
            let actual = registry.test(instance, &target).expect("stub call");
            assert_eq!(
                actual,
                expected,
                "{target} vs {:?} ({linkage})",
                instance.map(|i| i.runtime_type().to_string())
            );
        }
    }
}

#[test]
fn thread_slot_stubs_agree_with_slow_path() {
    assert_agrees_with_slow_path(SlowPathLinkage::ThreadSlot);
}

#[test]
fn pc_relative_stubs_agree_with_slow_path() {
    assert_agrees_with_slow_path(SlowPathLinkage::PcRelative);
}

#[test]
fn decided_checks_never_reach_the_slow_path() {
    if !native_stubs_supported() {
        return;
    }
    let zoo = Zoo::new();
    let registry = zoo.registry(host_config(SlowPathLinkage::ThreadSlot));
    let animal = zoo.ty(zoo.animal);
    let code = registry.lookup(&animal).expect("lookup");
    assert!(code.is_executable());
    assert_ne!(registry.ensure_stub(&animal).expect("ensure"), 0);

    let before = ThreadSlots::slow_path_calls();
    assert!(registry.test(Some(&zoo.instance(zoo.animal)), &animal).expect("test"));
    assert!(!registry.test(Some(&zoo.instance(zoo.unrelated)), &animal).expect("test"));
    assert!(!registry.test(None, &animal).expect("test"));
    assert_eq!(ThreadSlots::slow_path_calls(), before);

    let list_of_shape = zoo.list_of(&zoo.ty(zoo.shape));
    let list_of_string = Instance::new(&zoo.list_of(&zoo.ty(zoo.string)));
    assert!(!registry.test(Some(&list_of_string), &list_of_shape).expect("test"));
    assert_eq!(ThreadSlots::slow_path_calls(), before + 1);
}

#[test]
fn pc_relative_stub_carries_an_island() {
    if !native_stubs_supported() {
        return;
    }
    let zoo = Zoo::new();
    let compiler = zoo.compiler(host_config(SlowPathLinkage::PcRelative));
    let thread_compiler = zoo.compiler(host_config(SlowPathLinkage::ThreadSlot));
    let target = zoo.list_of(&zoo.ty(zoo.shape));
    let pcrel = compiler.compile(&target).expect("compile");
    let thread = thread_compiler.compile(&target).expect("compile");
    assert!(pcrel.code().len() > thread.code().len());
    assert!(pcrel.is_executable());
    let slow = compiler.slow_path_stub().expect("slow path stub");
    assert!(slow.is_slow_path_stub());
    assert!(slow.is_executable());
}

#[test]
fn foreign_arch_code_is_not_callable() {
    let zoo = Zoo::new();
    let mut config = host_config(SlowPathLinkage::ThreadSlot);
    config.enabled = true;
    config.arch = foreign_arch();
    let compiler = zoo.compiler(config);
    let animal = zoo.ty(zoo.animal);
    let code = compiler.compile(&animal).expect("compile");
    assert!(!code.is_executable());
    assert!(!code.code().is_empty());
    assert_eq!(
        code.call(None, &animal).expect_err("foreign"),
        StubError::UnsupportedArch(foreign_arch())
    );
}

#[test]
fn stubs_run_on_other_threads() {
    if !native_stubs_supported() {
        return;
    }
    let zoo = Zoo::new();
    let registry = zoo.registry(host_config(SlowPathLinkage::ThreadSlot));
    let target = zoo.list_of(&zoo.ty(zoo.shape));
    let hit = Instance::new(&zoo.list_of(&zoo.ty(zoo.circle)));
    let miss = Instance::new(&zoo.list_of(&zoo.ty(zoo.string)));
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    assert!(registry.test(Some(&hit), &target).expect("test"));
                    assert!(!registry.test(Some(&miss), &target).expect("test"));
                }
                assert_eq!(ThreadSlots::slow_path_calls(), 100);
            });
        }
    });
    assert_eq!(registry.compilations(), 1);
}
