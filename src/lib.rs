pub mod trainers;
pub mod models;

// Re-export common types
pub use trainers::{Config, ProcessConfig, load_config, train_from_config};
pub use trainers::errors::TrainingError;

pub mod logging {
    use log::LevelFilter;
    use env_logger::Builder;
    use std::io::Write;

    /// Timestamped logger at `Info`, overridable through `RUST_LOG`.
    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .init();
    }
}
