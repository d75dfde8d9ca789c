use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "trainer", about = "Run diffusion adapter training jobs from YAML files")]
struct Args {
    /// Job files, run one after another
    #[arg(required = true)]
    config_file_list: Vec<PathBuf>,

    /// Continue running the remaining jobs when one fails
    #[arg(short, long)]
    recover: bool,

    /// Start each job from its newest checkpoint
    #[arg(long)]
    resume: bool,
}

fn print_end_message(completed: usize, failed: usize) {
    info!("========================================");
    info!("Result:");
    info!(" - {} completed job{}", completed, if completed == 1 { "" } else { "s" });
    if failed > 0 {
        info!(" - {} failure{}", failed, if failed == 1 { "" } else { "s" });
    }
    info!("========================================");
}

fn main() -> Result<()> {
    eridiffusion_tuner::logging::init_logger();
    let args = Args::parse();

    let total = args.config_file_list.len();
    info!("Running {} job{}", total, if total == 1 { "" } else { "s" });

    let mut completed = 0;
    let mut failed = 0;
    for config_path in &args.config_file_list {
        info!("Starting trainer with config: {}", config_path.display());
        match eridiffusion_tuner::train_from_config(config_path, args.resume) {
            Ok(()) => completed += 1,
            Err(e) => {
                error!("Error running job {}: {:#}", config_path.display(), e);
                failed += 1;
                if !args.recover {
                    print_end_message(completed, failed);
                    return Err(e);
                }
            }
        }
    }

    print_end_message(completed, failed);
    Ok(())
}
