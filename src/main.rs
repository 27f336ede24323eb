use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::debug;
use memmap2::Mmap;
use once_cell::sync::OnceCell;
use structopt::StructOpt;

use unscatter::imports::ImportCsvRow;
use unscatter::{
    dump_new_image_buffer_to_disk, recover_imports_merge, recover_instruction_dispatchers,
    recover_recursive_in_full, rebuild_output, HeaderlessLayout, MutationRuleSet, ProtectedInput,
    ProtectionMode,
};

pub(crate) static ARGS: OnceCell<Opt> = OnceCell::new();

fn parse_num(s: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn parse_num32(s: &str) -> std::result::Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "unscatter",
    about = "Static deobfuscator for ScatterBrain-protected x86-64 PE images"
)]
pub(crate) struct Opt {
    /// Protected input file (PE or headerless blob)
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Output path for the rebuilt image
    #[structopt(parse(from_os_str))]
    output: PathBuf,

    /// Protection mode: full, headerless, or selective
    #[structopt(long, default_value = "full")]
    mode: ProtectionMode,

    /// Per-sample 32-bit import decryption constant (e.g. 0x6817FD83)
    #[structopt(long = "imp-const", parse(try_from_str = parse_num32))]
    imp_const: u32,

    /// Mutation rule set to step with
    #[structopt(long = "rule-set", default_value = "rule_set_1")]
    rule_set: MutationRuleSet,

    /// Recovery root RVA; defaults to the entry point (0 for headerless)
    #[structopt(long, parse(try_from_str = parse_num))]
    root: Option<u64>,

    /// Data section RVA for headerless inputs
    #[structopt(long = "data-rva", parse(try_from_str = parse_num))]
    data_rva: Option<u64>,

    /// Data section size for headerless inputs
    #[structopt(long = "data-size", parse(try_from_str = parse_num))]
    data_size: Option<u64>,

    /// Protected function RVA for selective mode
    #[structopt(long = "selective-rva", parse(try_from_str = parse_num))]
    selective_rva: Option<u64>,

    /// Route legitimate original imports through the rebuilt table
    #[structopt(long = "preserve-imports")]
    preserve_imports: bool,

    /// Increase logging (-v debug, -vv trace)
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,

    /// Disable all logging
    #[structopt(short = "q")]
    quiet: bool,

    /// Run recovery but do not write any files
    #[structopt(long = "dry")]
    dry: bool,

    #[structopt(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Clone, StructOpt)]
enum Command {
    /// Only recover the protected imports and dump them as CSV
    ImportsOnly {
        /// CSV output path
        #[structopt(parse(from_os_str), default_value = "imports.csv")]
        csv: PathBuf,
    },
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    ARGS.set(opt.clone()).unwrap();

    if !opt.quiet {
        let level = match opt.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        simple_logger::SimpleLogger::new()
            .with_level(level)
            .init()
            .unwrap();
    }

    let file = File::open(&opt.input)
        .with_context(|| format!("failed to open {}", opt.input.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    debug!("input: {} ({:#x} bytes)", opt.input.display(), mmap.len());

    let mut input = match opt.mode {
        ProtectionMode::Headerless => {
            let layout = match (opt.data_rva, opt.data_size) {
                (Some(data_rva), Some(data_size)) => Some(HeaderlessLayout {
                    text_rva: 0x1000,
                    data_rva,
                    data_size,
                }),
                (None, None) => None,
                _ => bail!("--data-rva and --data-size must be given together"),
            };
            ProtectedInput::from_headerless_bytes(&mmap, layout, opt.imp_const, opt.rule_set)?
        }
        mode => ProtectedInput::from_bytes(&mmap, mode, opt.imp_const, opt.rule_set)?,
    };

    input.rebuild_opts.selective_func_rva = opt.selective_rva;
    input.rebuild_opts.preserve_original_imports =
        opt.preserve_imports || opt.mode == ProtectionMode::Selective;

    if let Some(Command::ImportsOnly { csv }) = &opt.cmd {
        recover_imports_merge(&mut input)?;
        let mut writer = csv::Writer::from_path(csv)
            .with_context(|| format!("failed to create {}", csv.display()))?;
        for imp in input.imports.by_site.values() {
            writer.serialize(ImportCsvRow::from(imp))?;
        }
        writer.flush()?;
        println!(
            "Recovered {} import sites ({} unique) into {}",
            input.imports.len(),
            input.imports.unique_pairs(),
            csv.display()
        );
        return Ok(());
    }

    let root = opt.root.unwrap_or_else(|| match opt.mode {
        ProtectionMode::Headerless => 0,
        _ => input.image.entry_point(),
    });

    recover_instruction_dispatchers(&mut input)?;
    recover_imports_merge(&mut input)?;
    input.cfg = recover_recursive_in_full(&mut input, root)?;
    rebuild_output(&mut input)?;

    println!(
        "dispatchers: {} (+{} unresolved)  imports: {}  functions: {}",
        input.dispatcher_locs.len(),
        input.dispatcher_locs.unresolved.len(),
        input.imports.len(),
        input.cfg.len()
    );

    if opt.dry {
        println!("dry run; not writing {}", opt.output.display());
    } else {
        dump_new_image_buffer_to_disk(&input, &opt.output)?;
        println!("wrote {}", opt.output.display());
    }

    Ok(())
}
