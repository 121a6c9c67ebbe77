//! Lutforge CLI - apply, inspect and convert 3D LUTs.

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use lutforge::color::FilmGrainConfig;
use lutforge::lut::detect_info;
use lutforge::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("lutforge");

    if args.len() < 2 {
        print_usage(program);
        return;
    }

    let result = match args[1].as_str() {
        "apply" => apply(&args[2..]),
        "info" => backend_info(&args[2..]),
        "inspect" => inspect(&args[2..]),
        "convert" => convert(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage(program);
            Ok(())
        }
        "--version" | "-V" => {
            println!("{} {}", lutforge::NAME, lutforge::VERSION);
            Ok(())
        }
        other => Err(anyhow!("Unknown command: {}", other)),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        if let Some(fix) = e.downcast_ref::<EngineError>().and_then(|e| e.suggested_fix()) {
            eprintln!("Hint: {}", fix);
        }
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("Lutforge v{} - 3D LUT color grading", lutforge::VERSION);
    println!();
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  apply <lut> <input>... -o <output>   Apply a LUT to one or more images");
    println!("  info [--config <file>]               Show backend information as JSON");
    println!("  inspect <lut>                        Show LUT size, title and value range");
    println!("  convert <lut> <output.cube>          Re-export a LUT at 33x33x33");
    println!("  help                                 Show this help message");
    println!();
    println!("Apply options:");
    println!("  -o, --output <path>         Output file, or directory for several inputs");
    println!("  --secondary <lut>           Second LUT applied on top");
    println!("  --strength <0..1>           Primary strength (default: 1.0)");
    println!("  --secondary-strength <0..1> Secondary strength (default: 0.0)");
    println!("  --dither <none|fs|random>   Quantization dither (default: none)");
    println!("  --grain <preset>            Film grain: default, classic_film, subtle, heavy");
    println!("  --quality <1..100>          JPEG quality (default: 90)");
    println!("  --processor <auto|cpu|gpu>  Backend preference (default: auto)");
    println!("  --memory-mb <n>             Memory limit in megabytes");
    println!("  --config <file>             TOML engine configuration");
    println!();
    println!("Set RUST_LOG=debug for detailed logs.");
}

/// Pull the value following a flag.
fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} expects a value", flag))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::load(p).with_context(|| format!("loading config {}", p.display())),
        None => Ok(EngineConfig::default()),
    }
}

struct ApplyOptions {
    lut: PathBuf,
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
    secondary: Option<PathBuf>,
    params: ProcessingParams,
    processor: Option<ProcessorPreference>,
    memory_mb: Option<usize>,
    config: Option<PathBuf>,
}

fn parse_apply(args: &[String]) -> Result<ApplyOptions> {
    let mut positional = Vec::new();
    let mut options = ApplyOptions {
        lut: PathBuf::new(),
        inputs: Vec::new(),
        output: None,
        secondary: None,
        params: ProcessingParams::default(),
        processor: None,
        memory_mb: None,
        config: None,
    };

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-o" | "--output" => options.output = Some(PathBuf::from(flag_value(args, i, arg)?)),
            "--secondary" => options.secondary = Some(PathBuf::from(flag_value(args, i, arg)?)),
            "--strength" => options.params.strength = flag_value(args, i, arg)?.parse()?,
            "--secondary-strength" => {
                options.params.secondary_strength = flag_value(args, i, arg)?.parse()?
            }
            "--dither" => {
                options.params.dither = flag_value(args, i, arg)?.parse()?
            }
            "--grain" => {
                let name = flag_value(args, i, arg)?;
                let grain = FilmGrainConfig::preset(name)
                    .ok_or_else(|| anyhow!("unknown grain preset: {}", name))?;
                options.params.grain = Some(grain);
            }
            "--quality" => options.params.quality = flag_value(args, i, arg)?.parse()?,
            "--processor" => {
                options.processor = Some(flag_value(args, i, arg)?.parse()?)
            }
            "--memory-mb" => options.memory_mb = Some(flag_value(args, i, arg)?.parse()?),
            "--config" => options.config = Some(PathBuf::from(flag_value(args, i, arg)?)),
            flag if flag.starts_with("--") => bail!("unknown option: {}", flag),
            _ => {
                positional.push(PathBuf::from(arg));
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    if positional.len() < 2 {
        bail!("apply needs a LUT and at least one input image");
    }
    options.lut = positional.remove(0);
    options.inputs = positional;
    Ok(options)
}

fn output_path(options: &ApplyOptions, input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let file_name = format!("{}_graded.jpg", stem);
    match &options.output {
        Some(out) if options.inputs.len() == 1 && !out.is_dir() => out.clone(),
        Some(dir) => dir.join(file_name),
        None => input.with_file_name(file_name),
    }
}

fn apply(args: &[String]) -> Result<()> {
    let options = parse_apply(args)?;
    options.params.validate()?;

    let mut config = load_config(options.config.as_deref())?;
    if let Some(mb) = options.memory_mb {
        config.memory = config.memory.with_limit_mb(mb);
    }
    if let Some(processor) = options.processor {
        config.processor = processor;
    }
    if let Some(dir) = &options.output {
        if options.inputs.len() > 1 {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating output directory {}", dir.display()))?;
        }
    }

    let engine = Engine::start(config)?;
    let table = engine
        .load_primary_path(&options.lut)
        .with_context(|| format!("loading LUT {}", options.lut.display()))?;
    info!("Primary LUT {}^3 from {}", table.size(), options.lut.display());
    if let Some(secondary) = &options.secondary {
        engine
            .load_secondary_path(secondary)
            .with_context(|| format!("loading LUT {}", secondary.display()))?;
    }

    let mut pending = Vec::new();
    for input in &options.inputs {
        let image = image::open(input)
            .with_context(|| format!("reading {}", input.display()))?
            .to_rgba8();
        let request = TaskRequest::new(Arc::new(image), options.params.clone()).with_progress(
            |update| {
                if let ProgressUpdate::Started { task_id, message, .. }
                | ProgressUpdate::Fallback { task_id, message } = update
                {
                    info!("{}: {}", task_id, message);
                }
            },
        );
        pending.push((input.clone(), engine.submit_with(request)?));
    }

    let mut failures = 0;
    for (input, handle) in pending {
        match handle.wait() {
            Ok(output) => {
                let target = output_path(&options, &input);
                let resize = engine.save_output(output.image, &target, options.params.quality)?;
                if let Some(r) = resize {
                    info!("Downscaled {:?} -> {:?} to fit the output limit", r.from, r.to);
                }
                println!(
                    "{} -> {} [{}{}, {} ms]",
                    input.display(),
                    target.display(),
                    output.backend,
                    if output.fell_back { " after fallback" } else { "" },
                    output.duration.as_millis()
                );
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {}", input.display(), e);
            }
        }
    }

    engine.shutdown();
    if failures > 0 {
        bail!("{} of {} image(s) failed", failures, options.inputs.len());
    }
    Ok(())
}

fn backend_info(args: &[String]) -> Result<()> {
    let config_path = match args {
        [flag, path, ..] if flag == "--config" => Some(PathBuf::from(path)),
        [] => None,
        _ => bail!("usage: info [--config <file>]"),
    };
    let engine = Engine::start(load_config(config_path.as_deref())?.with_monitor(false))?;
    let info = engine.backend_info();
    println!("{}", serde_json::to_string_pretty(&info)?);
    println!("{}", serde_json::to_string_pretty(&engine.memory_stats())?);
    Ok(())
}

fn inspect(args: &[String]) -> Result<()> {
    let path = args.first().ok_or_else(|| anyhow!("inspect needs a LUT path"))?;
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path))?;
    let text = String::from_utf8_lossy(&bytes);
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);

    if let Some(header) = detect_info(&text, name) {
        println!("Format: {:?}", header.format);
        println!("Declared size: {}^3", header.size);
    }
    let table = parse_cube(&text).map_err(EngineError::from)?;
    let (min, max) = table.value_range();
    println!("Size: {}x{}x{}", table.size(), table.size(), table.size());
    println!("Title: {}", table.title().unwrap_or("(none)"));
    println!("Cells: {}", table.cell_count());
    println!("Value range: {:.4} .. {:.4}", min, max);
    if let Some(scale) = table.detected_full_scale() {
        println!("Integer scale detected: {} (normalized on export)", scale);
    }
    Ok(())
}

fn convert(args: &[String]) -> Result<()> {
    let (input, output) = match args {
        [input, output, ..] => (input, output),
        _ => bail!("convert needs an input LUT and an output path"),
    };
    let title = match args.get(2..) {
        Some([flag, title, ..]) if flag == "--title" => Some(title.as_str()),
        _ => None,
    };
    let table = LookupTable::open(input).map_err(EngineError::from)?;
    write_cube(&table, title.or(table.title()), output)
        .with_context(|| format!("writing {}", output))?;
    println!(
        "Converted {} ({}^3) -> {} (33^3)",
        input,
        table.size(),
        output
    );
    Ok(())
}
