use std::path::Path;

/// Map `-v`/`-q` counts onto a level, starting from `Info`.
pub fn level_from_verbosity(verbose: u8, quiet: u8) -> log::LevelFilter {
    match i16::from(verbose) - i16::from(quiet) {
        i16::MIN..=-2 => log::LevelFilter::Error,
        -1 => log::LevelFilter::Warn,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn format_line(
    out: fern::FormatCallback,
    message: &std::fmt::Arguments,
    record: &log::Record,
) {
    out.finish(format_args!(
        "{} {:<5} [{}] {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        record.level(),
        std::thread::current().name().unwrap_or("main"),
        message
    ))
}

/// Install the global logger: stderr always, plus `log_file` if given.
pub fn init_logger(level: log::LevelFilter, log_file: Option<&Path>) -> anyhow::Result<()> {
    use anyhow::Context;

    let mut dispatch = fern::Dispatch::new()
        .level(level)
        .chain(fern::Dispatch::new().format(format_line).chain(std::io::stderr()));

    if let Some(log_file) = log_file {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(format_line)
                .chain(fern::log_file(log_file).with_context(|| {
                    format!("Failed to open log file {:?}", log_file)
                })?),
        );
    }

    dispatch.apply().context("Failed to set the logger")?;
    Ok(())
}
