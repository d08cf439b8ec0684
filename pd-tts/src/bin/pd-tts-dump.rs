use std::io;
use std::sync::Arc;

use regex::Regex;
use tts::logging::{self, Category, category, outcome_label, verdict_label};
use tts::{
    Arch, ClassDecl, ClassId, ClassTable, GeneralSubtypeTest, Instance, SlowPathLinkage,
    StubCompiler, StubConfig, StubRegistry, SubtypeTester, Type, TypeTable,
    native_stubs_supported,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    arch: Arch,
    linkage: SlowPathLinkage,
    max_depth: usize,
    filter: Option<String>,
    run: bool,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            arch: Arch::host(),
            linkage: SlowPathLinkage::ThreadSlot,
            max_depth: 3,
            filter: None,
            run: false,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    let filter = cli.filter.as_deref().map(Regex::new).transpose()?;

    let demo = Demo::new()?;
    let config = StubConfig {
        enabled: true,
        arch: cli.arch,
        slow_path_linkage: cli.linkage,
        max_type_arg_depth: cli.max_depth,
    };
    let compiler = StubCompiler::new(config, demo.classes.clone());
    let targets: Vec<Type> = demo
        .targets()?
        .into_iter()
        .filter(|ty| filter.as_ref().is_none_or(|re| re.is_match(ty.name())))
        .collect();
    if targets.is_empty() {
        println!("no demo type matches the filter");
        return Ok(());
    }

    let compiled = compiler.compile_batch(&targets)?;
    for (ty, code) in targets.iter().zip(&compiled) {
        println!("{} {ty}", category(Category::Plan));
        for line in code.plan().to_string().lines() {
            println!("    {line}");
        }
        println!(
            "{} {code} @ {:#x}{}",
            category(Category::Code),
            code.base(),
            if code.is_slow_path_stub() { " (shared)" } else { "" }
        );
        for chunk in code.code().chunks(16) {
            println!("    {}", hex_line(chunk));
        }
    }

    if cli.run {
        if cli.arch != Arch::host() || !native_stubs_supported() {
            return Err(io::Error::other(format!(
                "--run needs native stubs for the host, got --arch {}",
                cli.arch
            ))
            .into());
        }
        run_demo(&demo, compiler, &targets)?;
    }
    Ok(())
}

fn run_demo(
    demo: &Demo,
    compiler: StubCompiler,
    targets: &[Type],
) -> Result<(), Box<dyn std::error::Error>> {
    let tester = Arc::new(SubtypeTester::new(demo.classes.clone(), demo.types.clone()));
    let registry = StubRegistry::new(compiler, tester.clone());
    let values = demo.values()?;
    let mut mismatches = 0usize;
    for ty in targets {
        for (label, value) in &values {
            let value = value.as_deref();
            let stub = registry.test(value, ty)?;
            let expected = tester.is_instance_of(value.map(Instance::runtime_type), ty);
            let plan = registry
                .installed(ty)
                .map(|code| code.plan().evaluate(value));
            if stub != expected {
                mismatches += 1;
            }
            println!(
                "{} {label} is {ty}: {} (plan {}) {}",
                category(Category::Run),
                stub,
                plan.map(outcome_label).unwrap_or_default(),
                verdict_label(stub == expected)
            );
        }
    }
    if mismatches > 0 {
        return Err(io::Error::other(format!("{mismatches} stub results disagree")).into());
    }
    Ok(())
}

struct Demo {
    classes: Arc<ClassTable>,
    types: Arc<TypeTable>,
    shape: ClassId,
    circle: ClassId,
    string: ClassId,
    list: ClassId,
    plugin: ClassId,
    plugin_impl: ClassId,
    animal: ClassId,
}

impl Demo {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let classes = Arc::new(ClassTable::new());
        let shape = classes.load_class(ClassDecl::new("Shape").sealed().abstract_class())?;
        let circle = classes.load_class(ClassDecl::new("Circle").sealed().extends(shape))?;
        classes.load_class(ClassDecl::new("Square").sealed().extends(shape))?;
        classes.load_class(ClassDecl::new("Triangle").sealed().extends(shape))?;
        let string = classes.load_class(ClassDecl::new("String").sealed())?;
        let list = classes.load_class(ClassDecl::new("List").sealed().type_params(1))?;
        let plugin = classes.load_class(ClassDecl::new("Plugin"))?;
        let plugin_impl = classes.load_class(ClassDecl::new("PluginImpl").extends(plugin))?;
        let animal = classes.load_class(ClassDecl::new("Animal").sealed())?;
        let types = Arc::new(TypeTable::new(classes.clone()));
        Ok(Self {
            classes,
            types,
            shape,
            circle,
            string,
            list,
            plugin,
            plugin_impl,
            animal,
        })
    }

    fn class(&self, class: ClassId) -> Result<Type, Box<dyn std::error::Error>> {
        Ok(self.types.class(class, Vec::new())?)
    }

    fn list_of(&self, element: Type) -> Result<Type, Box<dyn std::error::Error>> {
        Ok(self.types.class(self.list, vec![element])?)
    }

    fn targets(&self) -> Result<Vec<Type>, Box<dyn std::error::Error>> {
        let shape = self.class(self.shape)?;
        Ok(vec![
            self.class(self.animal)?,
            shape.clone(),
            self.types.nullable(&self.class(self.string)?),
            self.list_of(shape.clone())?,
            self.list_of(self.list_of(shape)?)?,
            self.class(self.plugin)?,
            self.types.nullable(&self.class(self.plugin)?),
            self.types.object(),
        ])
    }

    fn values(&self) -> Result<Vec<(String, Option<Box<Instance>>)>, Box<dyn std::error::Error>> {
        let circle = self.class(self.circle)?;
        let runtime_types = [
            self.class(self.animal)?,
            circle.clone(),
            self.class(self.string)?,
            self.class(self.plugin_impl)?,
            self.list_of(circle.clone())?,
            self.list_of(self.class(self.string)?)?,
            self.list_of(self.list_of(circle)?)?,
        ];
        let mut values = vec![("null".to_string(), None)];
        values.extend(
            runtime_types
                .iter()
                .map(|ty| (format!("a {ty}"), Some(Instance::new(ty)))),
        );
        Ok(values)
    }
}

fn hex_line(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--run" => {
                cfg.run = true;
                index += 1;
            }
            "--arch" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --arch".to_string())?;
                cfg.arch = Arch::parse(raw).ok_or_else(|| format!("invalid --arch value '{raw}'"))?;
                index += 2;
            }
            "--linkage" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --linkage".to_string())?;
                cfg.linkage = SlowPathLinkage::parse(raw)
                    .ok_or_else(|| format!("invalid --linkage value '{raw}'"))?;
                index += 2;
            }
            "--max-depth" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --max-depth".to_string())?;
                cfg.max_depth = raw
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --max-depth value '{raw}'"))?;
                index += 2;
            }
            "--filter" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --filter".to_string())?;
                cfg.filter = Some(raw.clone());
                index += 2;
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  pd-tts-dump [--arch <x86_64|aarch64>] [--linkage <thread|pcrel>]");
    println!("              [--max-depth <n>] [--filter <regex>] [--run]");
    println!();
    println!("Plans and emits type test stubs for a demo hierarchy and prints each");
    println!("plan with the linked code bytes. --run executes the stubs on this host");
    println!("and compares every result with the general subtype test.");
}
