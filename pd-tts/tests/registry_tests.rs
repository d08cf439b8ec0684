mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use common::*;
use tts::ClassInfo;

/// Oracle that parks the first `class_info` caller after it has read the
/// hierarchy, until the test releases it.
struct GatedOracle {
    inner: Arc<ClassTable>,
    armed: AtomicBool,
    read: Barrier,
    release: Barrier,
}

impl GatedOracle {
    fn new(inner: Arc<ClassTable>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            read: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl HierarchyOracle for GatedOracle {
    fn class_info(&self, class: ClassId) -> Option<ClassInfo> {
        let info = self.inner.class_info(class);
        if self.armed.swap(false, Ordering::AcqRel) {
            self.read.wait();
            self.release.wait();
        }
        info
    }
}

#[test]
fn concurrent_requests_generate_one_stub() {
    let zoo = Zoo::new();
    let registry = zoo.registry(host_config(SlowPathLinkage::ThreadSlot));
    let target = zoo.list_of(&zoo.ty(zoo.shape));
    let entries: Vec<usize> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| registry.ensure_stub(&target).expect("ensure")))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect()
    });
    assert!(entries.iter().all(|entry| *entry == entries[0]));
    assert_ne!(entries[0], 0);
    assert_eq!(registry.compilations(), 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn invalidation_picks_up_newly_loaded_subclasses() {
    let zoo = Zoo::new();
    let registry = zoo.registry(host_config(SlowPathLinkage::ThreadSlot));
    let shape = zoo.ty(zoo.shape);
    let first = registry.lookup(&shape).expect("lookup");

    let pentagon = zoo
        .classes
        .load_class(ClassDecl::new("Pentagon").sealed().extends(zoo.shape))
        .expect("load");
    let instance = zoo.instance(pentagon);

    // The installed stub still reflects the old hierarchy until invalidated.
    assert!(Arc::ptr_eq(&registry.lookup(&shape).expect("lookup"), &first));
    assert!(!registry.test(Some(&instance), &shape).expect("stale test"));

    registry.invalidate(&shape);
    assert!(registry.test(Some(&instance), &shape).expect("fresh test"));
    assert!(registry.test(Some(&zoo.instance(zoo.circle)), &shape).expect("test"));
    assert!(!registry.test(Some(&zoo.instance(zoo.unrelated)), &shape).expect("test"));
    assert_eq!(registry.compilations(), 2);

    let retired = registry.drain_retired();
    assert_eq!(retired.len(), 1);
    assert!(Arc::ptr_eq(&retired[0], &first));
    // Retired code stays callable for in-flight users.
    if first.is_executable() {
        assert!(first.call(Some(&zoo.instance(zoo.circle)), &shape).expect("call"));
    }
}

#[test]
fn invalidation_during_generation_is_not_lost() {
    let zoo = Zoo::new();
    let oracle = Arc::new(GatedOracle::new(zoo.classes.clone()));
    let registry = StubRegistry::new(
        StubCompiler::new(host_config(SlowPathLinkage::ThreadSlot), oracle.clone()),
        zoo.tester(),
    );
    let shape = zoo.ty(zoo.shape);

    let pentagon = std::thread::scope(|scope| {
        let generating = scope.spawn(|| registry.lookup(&shape).expect("lookup"));
        oracle.read.wait();
        let pentagon = zoo
            .classes
            .load_class(ClassDecl::new("Pentagon").sealed().extends(zoo.shape))
            .expect("load");
        registry.invalidate(&shape);
        oracle.release.wait();

        let code = generating.join().expect("join");
        let instance = zoo.instance(pentagon);
        assert_ne!(code.plan().evaluate(Some(&instance)), Outcome::Reject);
        pentagon
    });

    let instance = zoo.instance(pentagon);
    assert!(registry.test(Some(&instance), &shape).expect("test"));
    assert!(registry.ensure_stub(&shape).expect("ensure") != 0);
    assert_eq!(registry.compilations(), 2);
    assert_eq!(registry.drain_retired().len(), 1);
}

#[test]
fn install_replaces_the_current_stub() {
    let zoo = Zoo::new();
    let registry = zoo.registry(host_config(SlowPathLinkage::ThreadSlot));
    let other = zoo.compiler(host_config(SlowPathLinkage::PcRelative));
    let animal = zoo.ty(zoo.animal);

    let original = registry.lookup(&animal).expect("lookup");
    let replacement = other.compile(&animal).expect("compile");
    registry.install(&animal, replacement.clone());

    let installed = registry.installed(&animal).expect("installed");
    assert!(Arc::ptr_eq(&installed, &replacement));
    assert!(Arc::ptr_eq(&registry.lookup(&animal).expect("lookup"), &replacement));
    assert!(registry.test(Some(&zoo.instance(zoo.animal)), &animal).expect("test"));

    let retired = registry.drain_retired();
    assert_eq!(retired.len(), 1);
    assert!(Arc::ptr_eq(&retired[0], &original));
}

#[test]
fn reinstalling_the_same_code_retires_nothing() {
    let zoo = Zoo::new();
    let registry = zoo.registry(host_config(SlowPathLinkage::ThreadSlot));
    let animal = zoo.ty(zoo.animal);
    let code = registry.lookup(&animal).expect("lookup");
    registry.install(&animal, code.clone());
    assert!(registry.drain_retired().is_empty());
    assert!(!registry.is_fallback(&animal));
}

#[test]
fn open_types_share_the_slow_path_stub() {
    let zoo = Zoo::new();
    let registry = zoo.registry(host_config(SlowPathLinkage::ThreadSlot));
    let plugin = zoo.ty(zoo.plugin);
    let plugin_q = zoo.types.nullable(&zoo.ty(zoo.plugin_impl));
    let a = registry.lookup(&plugin).expect("lookup");
    let b = registry.lookup(&zoo.ty(zoo.plugin_impl)).expect("lookup");
    assert!(a.is_slow_path_stub());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!registry.lookup(&plugin_q).expect("lookup").is_slow_path_stub());

    assert!(registry.test(Some(&zoo.instance(zoo.plugin_impl)), &plugin).expect("test"));
    assert!(!registry.test(Some(&zoo.instance(zoo.animal)), &plugin).expect("test"));
    assert!(registry.test(None, &plugin_q).expect("test"));
}

#[test]
fn unrelated_types_generate_concurrently() {
    let zoo = Zoo::new();
    let registry = zoo.registry(host_config(SlowPathLinkage::PcRelative));
    let targets = [
        zoo.ty(zoo.animal),
        zoo.ty(zoo.shape),
        zoo.ty(zoo.string),
        zoo.list_of(&zoo.ty(zoo.circle)),
    ];
    std::thread::scope(|scope| {
        for target in &targets {
            let registry = &registry;
            scope.spawn(move || {
                for _ in 0..10 {
                    registry.ensure_stub(target).expect("ensure");
                }
            });
        }
    });
    assert_eq!(registry.len(), targets.len());
    assert_eq!(registry.compilations(), targets.len() as u64);
}
