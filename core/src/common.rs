//! Helpers shared by the `pointpdf` subcommands.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};

/// Install the process-wide logger for the CLI.
///
/// `log_level` is a `log::LevelFilter` name; anything unparsable falls back to
/// `info` with a note on stderr. With `log_file` the lines are appended to that
/// file (its directory is created first), otherwise they go to stderr. Fails if
/// the file cannot be opened or a logger is already installed.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Fail early with a readable message when an input file is missing.
pub fn validate_input_path(input: &Path) -> Result<()> {
    if !input.exists() {
        bail!("Input path '{}' does not exist.", input.display());
    }
    if !input.is_file() {
        bail!("Input path '{}' is not a file.", input.display());
    }
    Ok(())
}

/// Create the parent directory of an output file if it is missing.
pub fn prepare_output_path(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
