#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::multiple_crate_versions)]

//! Binary entrypoint: resolve the settings path, run the daemon, map
//! failures onto the documented exit codes.

use std::path::PathBuf;
use std::process::ExitCode;

use cachelot_app::error::EXIT_OK;

const DEFAULT_SETTINGS_PATH: &str = "/config/settings.yaml";

#[tokio::main]
async fn main() -> ExitCode {
    let settings_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CACHELOT_SETTINGS").ok())
        .map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH), PathBuf::from);

    match cachelot_app::run_app(&settings_path).await {
        Ok(()) => ExitCode::from(u8::try_from(EXIT_OK).unwrap_or(0)),
        Err(err) => {
            eprintln!("cachelot failed: {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}
