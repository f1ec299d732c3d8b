//! Command line front end: inspect and convert SafeTensors state files.
//!
//! ```bash
//! rusty-amp inspect model.safetensors
//! rusty-amp convert model.safetensors model_nhwc.safetensors --format nhwc
//! rusty-amp convert model.safetensors out.safetensors --config convert.json
//! rusty-amp demo --copy
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusty_amp::amp::convert_module_with;
use rusty_amp::config::ConvertConfig;
use rusty_amp::format::Format;
use rusty_amp::nn::{named_tensors, BatchNorm2d, Conv2d, Conv2dConfig};
use rusty_amp::serialization::{load_state_dict_file, save_state_dict, tensor_info};
use rusty_amp::tensor::{Parameter, Tensor};
use std::path::{Path, PathBuf};
use tracing::info;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "rusty-amp: tensor layout conversion", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the tensors of a SafeTensors file with their shape and format
    Inspect {
        file: PathBuf,
    },
    /// Convert every tensor of a SafeTensors file to another layout
    Convert {
        input: PathBuf,
        output: PathBuf,
        /// Target format (default, nchw, nhwc); overrides the config file
        #[arg(short, long)]
        format: Option<String>,
        /// JSON conversion config
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Build a small reference network and convert it
    Demo {
        /// Convert into a copy instead of in place
        #[arg(long)]
        copy: bool,
        #[arg(short, long, default_value = "nhwc")]
        format: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Inspect { file } => inspect(&file),
        Command::Convert {
            input,
            output,
            format,
            config,
        } => convert(&input, &output, format.as_deref(), config),
        Command::Demo { copy, format } => demo(copy, &format),
    }
}

fn inspect(file: &Path) -> Result<()> {
    let info = tensor_info(file).with_context(|| format!("reading {}", file.display()))?;
    for tensor in info {
        println!(
            "{:<40} {:<20} {:<6} {}",
            tensor.name,
            format!("{:?}", tensor.shape),
            tensor.dtype,
            tensor.format
        );
    }
    Ok(())
}

fn convert(
    input: &Path,
    output: &Path,
    format: Option<&str>,
    config: Option<PathBuf>,
) -> Result<()> {
    let mut settings = match config {
        Some(path) => ConvertConfig::from_json_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ConvertConfig::default(),
    };
    if let Some(format) = format {
        settings.target = format.parse::<Format>()?;
    }

    let mut dict =
        load_state_dict_file(input).with_context(|| format!("reading {}", input.display()))?;

    let (converted, report) = convert_module_with(&mut dict, &settings)?;

    save_state_dict(output, &converted)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(
        input = %input.display(),
        output = %output.display(),
        target_format = %settings.target,
        visited = report.visited,
        permuted = report.permuted,
        retagged = report.retagged,
        unchanged = report.unchanged,
        "converted state file"
    );
    Ok(())
}

#[derive(Debug, Clone)]
struct InnerBlock {
    bn: BatchNorm2d,
}

rusty_amp::module!(InnerBlock { bn });

#[derive(Debug, Clone)]
struct DemoNet {
    i: InnerBlock,
    conv: Conv2d,
    bn: BatchNorm2d,
    param: Parameter,
    buff: Tensor,
}

rusty_amp::module!(DemoNet { i, conv, bn, param, buff });

fn demo(copy: bool, format: &str) -> Result<()> {
    let target: Format = format.parse()?;
    let mut net = DemoNet {
        i: InnerBlock {
            bn: BatchNorm2d::new(4)?,
        },
        conv: Conv2d::from_config(Conv2dConfig::new(4, 4, (4, 4)).with_groups(2))?,
        bn: BatchNorm2d::new(4)?,
        param: Parameter::new(Tensor::ones(&[1, 3, 1, 1])),
        buff: Tensor::ones(&[1, 3, 1, 1]),
    };

    let config = ConvertConfig::new(target).with_in_place(!copy);
    let (converted, report) = convert_module_with(&mut net, &config)?;
    for (name, tensor) in named_tensors(&*converted)? {
        println!(
            "{:<20} {:<18} {}",
            name,
            format!("{:?}", tensor.shape()),
            tensor.format()
        );
    }
    println!(
        "{} tensors, {} permuted, {} retagged, {} unchanged",
        report.visited, report.permuted, report.retagged, report.unchanged
    );
    Ok(())
}
