use anyhow::Result;
use burn::backend::{autodiff::Autodiff, ndarray::NdArray};
use clap::{Parser, Subcommand};
use derm_ynet::{Evaluator, Trainer, TrainingConfig};
use std::path::PathBuf;

type Backend = NdArray<f32>;
type ADBackend = Autodiff<Backend>;

#[derive(Parser, Debug)]
#[command(name = "derm-ynet", about = "Joint lesion segmentation and classification")]
struct Cli {
    /// Path to a JSON training configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the network and checkpoint on validation improvements.
    Train,
    /// Score the saved checkpoint against the test split.
    Eval,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };

    match cli.command {
        Command::Train => {
            let device = Default::default();
            let history = Trainer::<ADBackend>::new(config, device).run()?;
            if let Some(best) = history.best_valid_loss() {
                println!("Best validation loss: {best:2.4}");
            }
        }
        Command::Eval => {
            let device = Default::default();
            Evaluator::<Backend>::new(config, device).run()?;
        }
    }

    Ok(())
}
