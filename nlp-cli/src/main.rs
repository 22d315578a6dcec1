use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use nlp_export::{
    Device, GraphManifest, HeadKind, Module, OnnxExporter, build_head, check_model, export_intent_slot_model, fetch_config,
    load_model,
};

/// Define the export subcommand.
fn export_subcommand() -> Command {
    Command::new("export")
        .about("Export a standalone classifier head to ONNX")
        .arg(Arg::new("HEAD")
            .help("Head class: TokenClassifier, BertPretrainingTokenClassifier, SequenceClassifier, SequenceRegression, SequenceTokenClassifier")
            .required(true)
            .index(1))
        .arg(Arg::new("OUTPUT_PATH")
            .help("Output .onnx file")
            .required(true)
            .index(2))
        .arg(Arg::new("hidden-size")
            .long("hidden-size")
            .value_name("INT")
            .help("Hidden size of the head input")
            .default_value("256")
            .value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("num-layers")
            .long("num-layers")
            .short('l')
            .value_name("INT")
            .help("Number of linear layers")
            .default_value("2")
            .value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("classes")
            .long("classes")
            .short('c')
            .value_name("INT")
            .help("Number of classes (split between intents and slots for the joint head)")
            .default_value("16")
            .value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("device")
            .long("device")
            .short('d')
            .value_name("DEVICE")
            .help("Placement: cpu or accelerator[:N]")
            .default_value("accelerator:0"))
}

/// Define the export-model subcommand.
fn export_model_subcommand() -> Command {
    Command::new("export-model")
        .about("Export the intent/slot classification model described by a JSON or YAML config")
        .arg(Arg::new("CONFIG")
            .help("Path or http(s) URL of the model configuration")
            .required(true)
            .index(1))
        .arg(Arg::new("OUTPUT_PATH")
            .help("Output .onnx file")
            .required(true)
            .index(2))
        .arg(Arg::new("data-dir")
            .long("data-dir")
            .value_name("DIR")
            .help("Directory with dict.intents.csv and dict.slots.csv, overrides model.data_dir"))
}

/// Define the check subcommand.
fn check_subcommand() -> Command {
    Command::new("check")
        .about("Run the full graph check on an ONNX model, optionally against a golden manifest")
        .arg(Arg::new("MODEL")
            .help("ONNX model file")
            .required(true)
            .index(1))
        .arg(Arg::new("snapshot")
            .long("snapshot")
            .short('s')
            .value_name("FILE")
            .help("Golden manifest to verify against"))
}

/// Define the bless subcommand.
fn bless_subcommand() -> Command {
    Command::new("bless")
        .about("Write the golden manifest of an ONNX model")
        .arg(Arg::new("MODEL")
            .help("ONNX model file")
            .required(true)
            .index(1))
        .arg(Arg::new("SNAPSHOT")
            .help("Manifest file to write")
            .required(true)
            .index(2))
        .arg(Arg::new("pin")
            .long("pin")
            .short('p')
            .value_name("INDEX")
            .help("Node index whose name is pinned; repeatable. Defaults to the pins of an existing manifest")
            .action(ArgAction::Append)
            .value_parser(clap::value_parser!(usize)))
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow::anyhow!("Missing argument {name}"))
}

/// Run the export command with the provided arguments
fn run_export_command(matches: &ArgMatches) -> Result<()> {
    let kind: HeadKind = required(matches, "HEAD")?.parse()?;
    let output_path = PathBuf::from(required(matches, "OUTPUT_PATH")?);
    let hidden_size = matches.get_one::<usize>("hidden-size").copied().unwrap_or(256);
    let num_layers = matches.get_one::<usize>("num-layers").copied().unwrap_or(2);
    let num_classes = matches.get_one::<usize>("classes").copied().unwrap_or(16);
    let device: Device = required(matches, "device")?.parse()?;

    info!("");
    info!("🚀 {kind} export");
    info!("📐 Hidden size: {hidden_size}, layers: {num_layers}, classes: {num_classes}");
    info!("🖥️ Device: {device}");
    info!("💾 Output path: {}\n", output_path.display());

    let mut head = build_head(kind, hidden_size, num_layers, num_classes)?;
    head.to_device(device);
    OnnxExporter::new().with_device(device).export(&*head, &output_path)?;

    Ok(())
}

/// Run the export-model command with the provided arguments
fn run_export_model_command(matches: &ArgMatches) -> Result<()> {
    let config = required(matches, "CONFIG")?;
    let output_path = PathBuf::from(required(matches, "OUTPUT_PATH")?);
    let data_dir = matches.get_one::<String>("data-dir").map(PathBuf::from);

    let config_path = if config.starts_with("http://") || config.starts_with("https://") {
        let dir = output_path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
        fetch_config(config, dir)?
    } else {
        PathBuf::from(config)
    };

    let summary = export_intent_slot_model(&config_path, data_dir.as_deref(), &output_path)?;
    info!("📊 {} nodes, {} parameters", summary.node_count, summary.parameter_count);

    Ok(())
}

/// Run the check command with the provided arguments
fn run_check_command(matches: &ArgMatches) -> Result<()> {
    let model_path = PathBuf::from(required(matches, "MODEL")?);
    let model = load_model(&model_path)?;
    check_model(&model, true)?;
    info!("✅ {} passed the full check", model_path.display());

    if let Some(snapshot) = matches.get_one::<String>("snapshot") {
        GraphManifest::load(Path::new(snapshot))?.verify(&model)?;
        info!("✅ {} matches {snapshot}", model_path.display());
    }

    Ok(())
}

/// Run the bless command with the provided arguments
fn run_bless_command(matches: &ArgMatches) -> Result<()> {
    let model = load_model(Path::new(required(matches, "MODEL")?))?;
    let snapshot_path = PathBuf::from(required(matches, "SNAPSHOT")?);

    let pins: Vec<usize> = match matches.get_many::<usize>("pin") {
        Some(pins) => pins.copied().collect(),
        None if snapshot_path.exists() => GraphManifest::load(&snapshot_path)?.pins(),
        None => Vec::new(),
    };

    let manifest = GraphManifest::capture(&model, &pins)?;
    manifest.save(&snapshot_path)?;
    info!("✍️ Wrote {} ({} nodes, {} pins)", snapshot_path.display(), manifest.node_count, manifest.nodes.len());

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("nlp")
        .about("Export NLP classifier heads and intent/slot models to ONNX and verify them")
        .subcommand(export_subcommand())
        .subcommand(export_model_subcommand())
        .subcommand(check_subcommand())
        .subcommand(bless_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("export", matches)) => run_export_command(matches),
        Some(("export-model", matches)) => run_export_model_command(matches),
        Some(("check", matches)) => run_check_command(matches),
        Some(("bless", matches)) => run_bless_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
