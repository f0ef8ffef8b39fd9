//! ls3d CLI
//!
//! Command-line interface for inspecting, dumping and re-exporting LS3D 4DS
//! model files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ls3d_parsers::logging::{self, TracingConfig};
use ls3d_parsers::fds::payload_summary;
use ls3d_parsers::{FdsModel, FdsParser, Frame, HierarchicalParser, HumanReadable, Parser as _};
use ls3d_scene::{
    decode_batch, import_file_with_context, write_scene_file, ExportOptions, ImportOptions, ModelCache, NodeId,
    NodeKind, SceneGraph,
};

/// ls3d - LS3D engine 4DS model tool
#[derive(Parser)]
#[command(name = "ls3d")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output format for structured data
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// JSON file with import and export options
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            _ => Err(format!("Unknown format: {s}")),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show header, counts and truncation of a model
    Info(FileArgs),

    /// Print the frame hierarchy, or the imported scene with --scene
    Tree(TreeArgs),

    /// Dump the decoded model
    Dump(FileArgs),

    /// Import a model and write it back out
    Convert(ConvertArgs),

    /// Import every model in a directory in parallel
    Batch(BatchArgs),
}

#[derive(Args)]
struct FileArgs {
    /// Path to a .4ds file
    path: PathBuf,
}

#[derive(Args)]
struct TreeArgs {
    /// Path to a .4ds file
    path: PathBuf,

    /// Show the imported scene graph instead of the raw frames
    #[arg(long)]
    scene: bool,
}

#[derive(Args)]
struct ConvertArgs {
    /// Model to read
    input: PathBuf,

    /// Model to write
    output: PathBuf,
}

#[derive(Args)]
struct BatchArgs {
    /// Directory to scan for .4ds files
    dir: PathBuf,

    /// Descend into subdirectories
    #[arg(short, long)]
    recursive: bool,
}

/// Contents of the `--config` file
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    import: ImportOptions,
    export: ExportOptions,
}

impl Config {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_with_config(TracingConfig::from_verbosity(cli.verbose));
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Info(args) => cmd_info(&args, &config, cli.format),
        Commands::Tree(args) => cmd_tree(&args, &config, cli.format),
        Commands::Dump(args) => cmd_dump(&args, &config, cli.format),
        Commands::Convert(args) => cmd_convert(&args, &config),
        Commands::Batch(args) => cmd_batch(&args, &config, cli.format),
    }
}

fn decode(path: &Path, config: &Config) -> Result<FdsModel> {
    FdsParser::new()
        .parse_file_with_options(path, &config.import.parse, None)
        .with_context(|| format!("Failed to decode {}", path.display()))
}

fn cmd_info(args: &FileArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let model = decode(&args.path, config)?;
    let visuals = model.frames.iter().filter(|f| f.payload.object().is_some()).count();
    let joints = model.frames.iter().filter(|f| f.is_joint()).count();

    let json = serde_json::json!({
        "path": args.path,
        "version": model.version.as_u16(),
        "timestamp": model.timestamp,
        "materials": model.material_slots.len(),
        "unique_materials": model.materials.len(),
        "declared_frames": model.declared_frames,
        "frames": model.frames.len(),
        "visuals": visuals,
        "joints": joints,
        "truncated": model.truncated,
        "animated": model.animated,
    });

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&json)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&json)?),
        OutputFormat::Text => {
            println!("Model: {}", args.path.display());
            println!("============================================");
            println!("  Version:            {:>12}", model.version.as_u16());
            println!("  Materials:          {:>12}", model.material_slots.len());
            println!("  Unique materials:   {:>12}", model.materials.len());
            println!("  Frames:             {:>5} of {:>4}", model.frames.len(), model.declared_frames);
            println!("  Visuals:            {:>12}", visuals);
            println!("  Joints:             {:>12}", joints);
            println!("  Animated:           {:>12}", model.animated);
            if let Some(truncation) = &model.truncated {
                println!(
                    "\nTruncated at frame {} (offset {}): {}",
                    truncation.frame_index, truncation.offset, truncation.reason
                );
            }
        }
    }

    Ok(())
}

fn cmd_tree(args: &TreeArgs, config: &Config, format: OutputFormat) -> Result<()> {
    if !args.scene {
        return cmd_frame_tree(args, config, format);
    }
    let imported = import_file_with_context(&args.path, &config.import)?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({ "scene": imported.scene, "report": imported.report });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Yaml => {
            let json = serde_json::json!({ "scene": imported.scene, "report": imported.report });
            print!("{}", serde_yaml::to_string(&json)?);
        }
        OutputFormat::Text => {
            for root in imported.scene.roots() {
                print_node(&imported.scene, root, 0);
            }
            if !imported.report.warnings.is_empty() {
                println!("\n{} warnings:", imported.report.warnings.len());
                for warning in &imported.report.warnings {
                    println!("  {warning}");
                }
            }
        }
    }

    Ok(())
}

fn cmd_frame_tree(args: &TreeArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let parser = FdsParser::new();
    let model = decode(&args.path, config)?;

    if format != OutputFormat::Text {
        let json = serde_json::json!(parser
            .roots(&model)
            .into_iter()
            .map(|root| frame_json(&parser, &model, root, 0))
            .collect::<Vec<_>>());
        match format {
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&json)?),
            _ => println!("{}", serde_json::to_string_pretty(&json)?),
        }
        return Ok(());
    }

    for root in parser.roots(&model) {
        print_frame(&parser, &model, root, 0);
    }
    Ok(())
}

fn frame_json(parser: &FdsParser, model: &FdsModel, frame: &Frame, depth: usize) -> serde_json::Value {
    let children: Vec<_> = if depth > model.frames.len() {
        Vec::new()
    } else {
        parser
            .children(model, frame)
            .into_iter()
            .map(|child| frame_json(parser, model, child, depth + 1))
            .collect()
    };
    serde_json::json!({
        "index": frame.index,
        "name": frame.name(),
        "type": format!("{:?}", frame.header.frame_type),
        "children": children,
    })
}

fn print_frame(parser: &FdsParser, model: &FdsModel, frame: &Frame, depth: usize) {
    println!(
        "{}[{}] {} - {}",
        "  ".repeat(depth),
        frame.index,
        frame.name(),
        payload_summary(&frame.payload)
    );
    // A parent cycle would otherwise recurse forever
    if depth > model.frames.len() {
        return;
    }
    for child in parser.children(model, frame) {
        print_frame(parser, model, child, depth + 1);
    }
}

fn print_node(scene: &SceneGraph, id: NodeId, depth: usize) {
    let Some(node) = scene.node(id) else {
        return;
    };
    let kind = match &node.kind {
        NodeKind::Mesh(mesh) => format!(
            "mesh, {} vertices, {} polygons{}",
            mesh.vertex_count(),
            mesh.polygons.len(),
            if mesh.armature.is_some() { ", skinned" } else { "" }
        ),
        NodeKind::Empty(display) => format!("{display:?}"),
        NodeKind::Armature(armature) => format!("armature, {} bones", armature.bones.len()),
    };
    let hidden = if node.hidden { " (hidden)" } else { "" };
    println!("{}{} - {}{}", "  ".repeat(depth), node.name, kind, hidden);

    if depth > scene.len() {
        return;
    }
    for child in scene.children(id) {
        print_node(scene, child, depth + 1);
    }
}

fn cmd_dump(args: &FileArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let model = decode(&args.path, config)?;
    match format {
        OutputFormat::Text => print!("{}", model.to_readable_string()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&model.to_json())?),
        OutputFormat::Yaml => print!("{}", model.to_yaml()),
    }
    Ok(())
}

fn cmd_convert(args: &ConvertArgs, config: &Config) -> Result<()> {
    info!("Converting {:?} -> {:?}", args.input, args.output);

    let imported = import_file_with_context(&args.input, &config.import)?;
    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }
    let report = write_scene_file(&imported.scene, &config.export, &args.output)?;

    let warnings = imported.report.warnings.len() + report.warnings.len();
    println!(
        "Wrote {} ({} nodes, {} warnings)",
        args.output.display(),
        imported.scene.len(),
        warnings
    );
    Ok(())
}

fn collect_models(parser: &FdsParser, dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            if recursive {
                collect_models(parser, &path, recursive, out)?;
            }
        } else if parser.can_parse(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn cmd_batch(args: &BatchArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let mut paths = Vec::new();
    collect_models(&FdsParser::new(), &args.dir, args.recursive, &mut paths)?;
    paths.sort();
    info!("Found {} models in {:?}", paths.len(), args.dir);

    let cache = ModelCache::new();
    let results = decode_batch(&paths, &cache, &config.import);

    let rows: Vec<_> = results
        .iter()
        .map(|(path, result)| match result {
            Ok(scene) => serde_json::json!({
                "path": path,
                "nodes": scene.len(),
                "meshes": scene.mesh_count(),
            }),
            Err(err) => {
                warn!("{}: {err}", path.display());
                serde_json::json!({ "path": path, "error": err.to_string() })
            }
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&rows)?),
        OutputFormat::Text => {
            println!("{:<8} {:<8} Path", "Nodes", "Meshes");
            println!("{:-<8} {:-<8} {:-<50}", "", "", "");
            for (path, result) in &results {
                match result {
                    Ok(scene) => println!("{:<8} {:<8} {}", scene.len(), scene.mesh_count(), path.display()),
                    Err(err) => println!("{:<8} {:<8} {} ({err})", "error", "", path.display()),
                }
            }
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            println!("\nTotal: {} models, {} failed, {} cached", results.len(), failed, cache.len());
        }
    }

    Ok(())
}
