use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct StdoutLogger {
    max_level: LevelFilter,
}

impl StdoutLogger {
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Call this once before booting.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for StdoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message"
        println!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}
