use std::{
    fs::File,
    os::fd::{AsRawFd, RawFd},
};

use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::cli::Args;

/// Returns the raw fd of the log file, if logging went to one; the
/// server preserves it across fork-request children.
pub fn init_tracing(args: &Args) -> Option<RawFd> {
    let log_path: &str = match args {
        Args::Serve { log_path, .. } => {
            if let Some(path) = log_path {
                path
            } else {
                let pid = std::process::id();
                &format!("/tmp/zygoted-{pid}.log")
            }
        }
    };

    let file = File::create(log_path).expect("Could not initialize log");
    let log_fd = file.as_raw_fd();

    let env_filter = EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_target(false),
        )
        .init();

    Some(log_fd)
}
