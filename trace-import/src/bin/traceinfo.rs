use clap::Parser;
use eyre::{bail, Context, Result};

use trace_import::{can_import_str, distinct_warning_kinds, import_events_str, ImportConfig};

#[derive(Parser)]
#[command(name = "traceinfo")]
#[command(about = "import a chrome trace file and print a model summary")]
struct Args {
    #[arg(help = "trace file path (json array or container object)")]
    trace: String,

    #[arg(short, long, help = "import configuration file path (toml format)")]
    config: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match &args.config {
        Some(path) => ImportConfig::load(path)
            .with_context(|| format!("failed to load config path={path}"))?,
        None => ImportConfig::default(),
    };

    let input = std::fs::read_to_string(&args.trace)
        .with_context(|| format!("failed to read trace path={}", args.trace))?;
    if !can_import_str(&input) {
        bail!("{} does not look like a chrome trace", args.trace);
    }

    let result = import_events_str(&input, &config)
        .with_context(|| format!("failed to import trace path={}", args.trace))?;
    let model = &result.model;

    println!(
        "bounds: {:?}..{:?} ms",
        model.bounds.min, model.bounds.max
    );
    println!("categories: {}", model.categories.len());
    for (pid, process) in &model.processes {
        let slice_count: usize = process
            .threads
            .values()
            .map(|t| t.slice_group.len())
            .sum();
        let async_count: usize = process
            .threads
            .values()
            .map(|t| t.async_slice_group.len())
            .sum();
        println!(
            "process {pid} '{}': {} threads, {slice_count} slices, {async_count} async, {} counters, {} objects, {} memory dumps",
            process.name.as_deref().unwrap_or("?"),
            process.threads.len(),
            process.counters.len(),
            process.objects.instance_count(),
            process.memory_dump_refs.len(),
        );
    }
    println!(
        "flow events: {}, samples: {}, global dumps: {}",
        model.flow_events.len(),
        model.samples.len(),
        model.global_memory_dumps.len()
    );

    if !result.warnings.is_empty() {
        println!("warnings ({} total):", result.warnings.len());
        for kind in distinct_warning_kinds(&result.warnings) {
            let count = result
                .warnings
                .iter()
                .filter(|w| w.kind == kind)
                .count();
            println!("  {kind}: {count}");
        }
    }

    Ok(())
}
