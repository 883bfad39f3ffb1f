use std::path::Path;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use node_worker_config::{normalize_log_level, LogConfig};
use node_worker_types::TaskName;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";
const MAX_LOG_BYTES: u64 = 50 * 1024 * 1024;
const MAX_LOG_FILES: u32 = 5;

/// Log to `<dir>/<file_name>` (rotated at 50 MiB, 5 archives kept) and stderr.
pub fn setup_logging(config: &LogConfig, file_name: &str) -> anyhow::Result<()> {
    let dir = Path::new(&config.dir);
    std::fs::create_dir_all(dir)?;
    let log_path = dir.join(file_name);
    let archive_pattern = dir.join(format!("{file_name}.{{}}"));

    let roller = FixedWindowRoller::builder()
        .build(&archive_pattern.to_string_lossy(), MAX_LOG_FILES)?;
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(MAX_LOG_BYTES)),
        Box::new(roller),
    );
    let file_appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(log_path, Box::new(policy))?;
    let console_appender = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let log_config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("stderr", Box::new(console_appender)))
        .build(
            Root::builder()
                .appender("file")
                .appender("stderr")
                .build(level_filter(&config.level)),
        )?;

    log4rs::init_config(log_config)?;

    Ok(())
}

/// File name for a task process's log, next to the main log.
pub fn task_process_log_file(file_name: &str, kind: TaskName) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{kind}.{ext}"),
        _ => format!("{file_name}-{kind}"),
    }
}

fn level_filter(level: &str) -> LevelFilter {
    normalize_log_level(level)
        .and_then(|l| l.parse().ok())
        .unwrap_or(LevelFilter::Info)
}
