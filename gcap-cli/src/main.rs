use std::collections::VecDeque;
use std::error::Error;
use std::fs;

use gcap::codec::{decode, encode, EncodeOptions};
use gcap::header::Header;
use gcap::{export_to_file, DiagnosticLevel, ExportOptions, Graph};

mod demo;
mod summary;

use demo::ConvNet;
use summary::ArtifactSummary;

enum Command {
    /// Print information about an artifact.
    Inspect {
        artifact: String,
        json: bool,
        verify: bool,
        mmap: bool,
    },

    /// Export the demo classifier.
    Demo {
        output: String,
        batch: usize,
        seed: Option<u64>,
        dynamic_batch: bool,
    },
}

struct Args {
    command: Command,

    /// Enable verbose diagnostics.
    verbose: bool,
}

fn print_help(bin_name: &str) {
    println!(
        "Inspect graph artifacts and export a demo model.

Usage:
  {bin_name} inspect [OPTIONS] <artifact>
  {bin_name} demo [OPTIONS] <output>

Inspect options:
  --json           Print a JSON summary
  --verify         Check that re-encoding the graph reproduces the artifact
  --mmap           Decode the artifact through a memory map

Demo options:
  --batch N        Batch size of the sample input (default 1)
  --seed S         Seed for random weights and inputs
  --dynamic-batch  Export the batch dimension as a symbol

  -v, --verbose    Print diagnostics for each recorded node
  -h, --help       Print help
",
        bin_name = bin_name
    );
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values = VecDeque::new();
    let mut verbose = false;
    let mut json = false;
    let mut verify = false;
    let mut mmap = false;
    let mut batch = 1;
    let mut seed = None;
    let mut dynamic_batch = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push_back(val.string()?),
            Short('v') | Long("verbose") => verbose = true,
            Long("json") => json = true,
            Long("verify") => verify = true,
            Long("mmap") => mmap = true,
            Long("batch") => batch = parser.value()?.parse()?,
            Long("seed") => seed = Some(parser.value()?.parse()?),
            Long("dynamic-batch") => dynamic_batch = true,
            Short('h') | Long("help") => {
                print_help(parser.bin_name().unwrap_or("gcap"));
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let command = match values.pop_front().as_deref() {
        Some("inspect") => Command::Inspect {
            artifact: values.pop_front().ok_or("missing `<artifact>` arg")?,
            json,
            verify,
            mmap,
        },
        Some("demo") => Command::Demo {
            output: values.pop_front().ok_or("missing `<output>` arg")?,
            batch,
            seed,
            dynamic_batch,
        },
        Some(cmd) => return Err(format!("unknown command `{}`", cmd).into()),
        None => return Err("missing command. Use `inspect` or `demo`".into()),
    };

    Ok(Args { command, verbose })
}

fn format_param_count(n: usize) -> String {
    if n > 1_000_000 {
        format!("{:.1} M", n as f32 / 1_000_000.)
    } else {
        format!("{:.1} K", n as f32 / 1000.)
    }
}

fn print_graph(header: &Header, size: usize, graph: &Graph) {
    println!(
        "Artifact: format {}.{}, {} bytes, checksum {}",
        header.format_major,
        header.format_minor,
        size,
        if header.has_checksum() { "yes" } else { "no" }
    );
    println!("Producer: {}", graph.metadata().producer);

    println!("Inputs:");
    for input in graph.inputs() {
        println!("  {}", input);
    }
    println!("Outputs:");
    for output in graph.outputs() {
        println!("  {}", output);
    }
    println!(
        "Initializers: {} ({} params)",
        graph.initializers().len(),
        format_param_count(graph.parameter_count())
    );

    println!("Nodes: {}", graph.nodes().len());
    for node in graph.nodes() {
        match &node.provenance {
            Some(scope) => println!("  {}: {}  [{}]", node.id, node, scope),
            None => println!("  {}: {}", node.id, node),
        }
    }

    let properties = &graph.metadata().properties;
    if !properties.is_empty() {
        println!("Properties:");
        for (key, value) in properties {
            println!("  {}: {}", key, value);
        }
    }
}

fn inspect(artifact: &str, json: bool, verify: bool, mmap: bool) -> Result<(), Box<dyn Error>> {
    let bytes = fs::read(artifact)?;
    let header = Header::from_buf(&bytes)?;
    let graph = if mmap {
        // Safety: The artifact is not modified while the CLI is running.
        unsafe { gcap::decode_mmap(artifact)? }
    } else {
        decode(&bytes)?
    };

    if json {
        let summary = ArtifactSummary::new(&header, bytes.len(), &graph);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_graph(&header, bytes.len(), &graph);
    }

    if verify {
        let reencoded = encode(
            &graph,
            &EncodeOptions {
                checksum: header.has_checksum(),
            },
        )?;
        if reencoded != bytes {
            return Err("re-encoding the decoded graph did not reproduce the artifact".into());
        }
        eprintln!("Verified: re-encoded artifact is identical");
    }

    Ok(())
}

fn demo(
    output: &str,
    batch: usize,
    seed: Option<u64>,
    dynamic_batch: bool,
    verbose: bool,
) -> Result<(), Box<dyn Error>> {
    let mut rng = match seed {
        Some(seed) => fastrand::Rng::with_seed(seed),
        None => fastrand::Rng::new(),
    };
    let model = ConvNet::new(&mut rng);
    let sample = ConvNet::sample_input(&mut rng, batch, 32);

    let mut options = ExportOptions::new();
    options
        .output_names(&["logits"])
        .property("model", "demo-convnet");
    if dynamic_batch {
        options.dynamic_dim("input", 0, "batch");
    }
    if verbose {
        options.diagnostics(DiagnosticLevel::Info);
    }

    let graph = export_to_file(&model, &[("input", sample)], output, &options)?;
    println!(
        "Exported {} nodes and {} params to {}",
        graph.nodes().len(),
        format_param_count(graph.parameter_count()),
        output
    );
    Ok(())
}

/// Tool for inspecting graph artifacts and exporting a demo model.
///
/// ```
/// cargo run -p gcap-cli -- demo model.gcap --dynamic-batch
/// cargo run -p gcap-cli -- inspect model.gcap --verify
/// ```
fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;
    match args.command {
        Command::Inspect {
            artifact,
            json,
            verify,
            mmap,
        } => inspect(&artifact, json, verify, mmap),
        Command::Demo {
            output,
            batch,
            seed,
            dynamic_batch,
        } => demo(&output, batch, seed, dynamic_batch, args.verbose),
    }
}
