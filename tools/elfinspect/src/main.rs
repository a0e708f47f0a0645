//! Load a compiled kernel image the way the runtime would and describe what it contains.

use std::path::PathBuf;

use clap::Parser;
use elf::{
    abi::{DT_JMPREL, DT_PLTRELSZ, DT_REL, DT_RELA, DT_RELASZ, DT_RELSZ},
    endian::AnyEndian,
    ElfBytes,
};
use elfload::{Arch, ElfModule, LoadFlags};
use hal_local::{dispatch_inline, Bindings, DispatchState, ElfExecutable, LocalExecutable, Vec3};
use miette::IntoDiagnostic;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(clap::Parser, Clone, Debug)]
#[command(version, about = "Load a compiled kernel image and describe it")]
struct Cli {
    /// The image to load.
    path: PathBuf,
    /// Don't run the image's initializers.
    #[arg(long)]
    skip_init: bool,
    /// Run this entry point over the --workgroups grid. No bindings or push constants are
    /// passed, so only entry points that need neither can be run.
    #[arg(long, value_name = "ORDINAL")]
    dispatch: Option<usize>,
    #[arg(long, value_name = "X,Y,Z", default_value = "1,1,1", value_parser = parse_grid)]
    workgroups: Vec3,
    /// Log more. Repeat for even more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_grid(s: &str) -> Result<Vec3, String> {
    let dims = s
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<u32>()
                .map_err(|e| format!("bad dimension '{}': {}", d, e))
        })
        .collect::<Result<Vec<_>, _>>()?;
    match dims[..] {
        [x] => Ok(Vec3::new(x, 1, 1)),
        [x, y] => Ok(Vec3::new(x, y, 1)),
        [x, y, z] => Ok(Vec3::new(x, y, z)),
        _ => Err(format!("expected X, X,Y or X,Y,Z, got '{}'", s)),
    }
}

fn print_relocations(module: &ElfModule) {
    let value = |tag| module.dynamic().iter().find(|d| d.tag == tag).map(|d| d.value);
    for (name, table, size) in [
        ("RELA", DT_RELA, DT_RELASZ),
        ("REL", DT_REL, DT_RELSZ),
        ("JMPREL", DT_JMPREL, DT_PLTRELSZ),
    ] {
        if let Some(at) = value(table) {
            println!(
                "  {:<6} {:#010x}, {} bytes",
                name,
                at,
                value(size).unwrap_or(0)
            );
        }
    }
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).into_diagnostic()?;
    miette::set_hook(Box::new(|_| {
        Box::new(miette::NarratableReportHandler::new().with_cause_chain())
    }))
    .into_diagnostic()?;

    let bytes = std::fs::read(&cli.path).into_diagnostic()?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(&bytes).into_diagnostic()?;
    let machine = file.ehdr.e_machine;
    match Arch::from_machine(machine) {
        Some(arch) => println!("{}: {} image", cli.path.display(), arch),
        None => println!("{}: unknown machine {}", cli.path.display(), machine),
    }
    info!("host is {}", Arch::host());

    let mut flags = LoadFlags::empty();
    if cli.skip_init {
        flags |= LoadFlags::SKIP_INITIALIZERS;
    }
    let exec = ElfExecutable::load_for_inspection(&bytes, flags)?;

    let module = exec.module();
    println!(
        "mapped {} bytes at {:p}, load bias {:#x}",
        module.len(),
        module.base(),
        module.load_bias()
    );
    println!("segments:");
    for (i, seg) in module.segments().iter().enumerate() {
        println!("  {:>2} {}", i, seg);
    }
    println!("relocation tables:");
    print_relocations(module);

    println!(
        "library '{}' version {}, {} entry points:",
        exec.name(),
        exec.version(),
        exec.entry_point_count()
    );
    for ordinal in 0..exec.entry_point_count() {
        println!(
            "  {:>3} {}",
            ordinal,
            exec.entry_point_name(ordinal).unwrap_or("<unnamed>")
        );
    }

    if let Some(ordinal) = cli.dispatch {
        let bindings = Bindings::new();
        let state = DispatchState::new(cli.workgroups, Vec3::splat(1), &[], &bindings, None);
        info!("dispatching {} over {}", ordinal, cli.workgroups);
        dispatch_inline(&exec, ordinal, &state)?;
        println!(
            "entry point {} ran for {} workgroups",
            ordinal,
            cli.workgroups.volume()
        );
    }

    Ok(())
}
