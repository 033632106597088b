pub use log;
use std::{cell::RefCell, rc::Rc};

const LOG_MESSAGES_BYTES_LIMIT: usize = 10 * 1000;

/// Collects the program log of one transaction.
#[derive(Debug)]
pub struct LogCollector {
    messages: Vec<String>,
    bytes_written: usize,
    bytes_limit: Option<usize>,
    limit_warning: bool,
}

impl Default for LogCollector {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            bytes_written: 0,
            bytes_limit: Some(LOG_MESSAGES_BYTES_LIMIT),
            limit_warning: false,
        }
    }
}

impl LogCollector {
    pub fn log(&mut self, message: &str) {
        let Some(limit) = self.bytes_limit else {
            self.messages.push(message.to_string());
            return;
        };

        let bytes_written = self.bytes_written.saturating_add(message.len());
        if bytes_written >= limit {
            if !self.limit_warning {
                self.limit_warning = true;
                self.messages.push(String::from("Log truncated"));
            }
        } else {
            self.bytes_written = bytes_written;
            self.messages.push(message.to_string());
        }
    }

    pub fn get_recorded_content(&self) -> &[String] {
        self.messages.as_slice()
    }

    pub fn new_ref() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    /// A collector with the given byte limit, `None` meaning unlimited
    pub fn new_ref_with_limit(bytes_limit: Option<usize>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            bytes_limit,
            ..Self::default()
        }))
    }

    pub fn into_messages(self) -> Vec<String> {
        self.messages
    }
}

/// Convenience macro to log a message with an `Option<Rc<RefCell<LogCollector>>>`
///
/// Every message is also emitted through the `log` crate at debug level.
#[macro_export]
macro_rules! ic_logger_msg {
    ($log_collector:expr, $message:expr) => {{
        $crate::log_collector::log::debug!(
            target: "solana_loader_program_runtime::stable_log",
            "{}",
            $message
        );
        if let Some(log_collector) = $log_collector.as_ref() {
            if let Ok(mut log_collector) = log_collector.try_borrow_mut() {
                log_collector.log($message);
            }
        }
    }};
    ($log_collector:expr, $fmt:expr, $($arg:tt)*) => {{
        let message = format!($fmt, $($arg)*);
        $crate::log_collector::log::debug!(
            target: "solana_loader_program_runtime::stable_log",
            "{}",
            message
        );
        if let Some(log_collector) = $log_collector.as_ref() {
            if let Ok(mut log_collector) = log_collector.try_borrow_mut() {
                log_collector.log(&message);
            }
        }
    }};
}

/// Convenience macro to log a message with an `InvokeContext`
#[macro_export]
macro_rules! ic_msg {
    ($invoke_context:expr, $message:expr) => {
        $crate::ic_logger_msg!($invoke_context.get_log_collector(), $message)
    };
    ($invoke_context:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::ic_logger_msg!($invoke_context.get_log_collector(), $fmt, $($arg)*)
    };
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_log_messages_bytes_limit() {
        let mut lc = LogCollector::default();

        for _i in 0..LOG_MESSAGES_BYTES_LIMIT * 2 {
            lc.log("x");
        }

        let logs: Vec<_> = lc.into_messages();
        assert_eq!(logs.len(), LOG_MESSAGES_BYTES_LIMIT);
        for log in logs.iter().take(LOG_MESSAGES_BYTES_LIMIT - 1) {
            assert_eq!(*log, "x".to_string());
        }
        assert_eq!(logs.last(), Some(&"Log truncated".to_string()));
    }

    #[test]
    fn test_log_messages_unlimited() {
        let log_collector = LogCollector::new_ref_with_limit(None);
        for _i in 0..LOG_MESSAGES_BYTES_LIMIT * 2 {
            log_collector.borrow_mut().log("x");
        }
        assert_eq!(
            log_collector.borrow().get_recorded_content().len(),
            LOG_MESSAGES_BYTES_LIMIT * 2
        );
    }

    #[test]
    fn test_ic_logger_msg() {
        let log_collector = Some(LogCollector::new_ref());
        ic_logger_msg!(log_collector, "plain");
        ic_logger_msg!(log_collector, "formatted {} {:?}", 1, "two");
        let none: Option<Rc<RefCell<LogCollector>>> = None;
        ic_logger_msg!(none, "dropped");
        assert_eq!(
            log_collector.unwrap().borrow().get_recorded_content(),
            &["plain".to_string(), "formatted 1 \"two\"".to_string()]
        );
    }
}
