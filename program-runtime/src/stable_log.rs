//! Stable program log messages
//!
//! The format of these log messages should not be modified to avoid breaking downstream consumers
//! of program logging
use {
    crate::{ic_logger_msg, log_collector::LogCollector},
    itertools::Itertools,
    solana_loader_sdk::pubkey::Pubkey,
    std::{cell::RefCell, fmt::Display, rc::Rc},
};

/// Log a program invoke.
///
/// The general form is:
///
/// ```notrust
/// "Program <address> invoke [<depth>]"
/// ```
pub fn program_invoke(
    log_collector: &Option<Rc<RefCell<LogCollector>>>,
    program_id: &Pubkey,
    invoke_depth: usize,
) {
    ic_logger_msg!(
        log_collector,
        "Program {} invoke [{}]",
        program_id,
        invoke_depth
    );
}

/// Log a message from the program itself.
///
/// The general form is:
///
/// ```notrust
/// "Program log: <program-generated output>"
/// ```
///
/// That is, any program-generated output is guaranteed to be prefixed by "Program log: "
pub fn program_log(log_collector: &Option<Rc<RefCell<LogCollector>>>, message: &str) {
    ic_logger_msg!(log_collector, "Program log: {}", message);
}

/// Emit a program data.
///
/// The general form is:
///
/// ```notrust
/// "Program data: <binary-data-in-base64>*"
/// ```
///
/// That is, any program-generated output is guaranteed to be prefixed by "Program data: "
pub fn program_data(log_collector: &Option<Rc<RefCell<LogCollector>>>, data: &[&[u8]]) {
    ic_logger_msg!(
        log_collector,
        "Program data: {}",
        data.iter().map(base64::encode).join(" ")
    );
}

/// Log return data as from the program itself. This line will not be present if no return
/// data was set, or if the return data was set to zero length.
///
/// The general form is:
///
/// ```notrust
/// "Program return: <program-id> <program-generated-data-in-base64>"
/// ```
///
/// That is, any program-generated output is guaranteed to be prefixed by "Program return: "
pub fn program_return(
    log_collector: &Option<Rc<RefCell<LogCollector>>>,
    program_id: &Pubkey,
    data: &[u8],
) {
    ic_logger_msg!(
        log_collector,
        "Program return: {} {}",
        program_id,
        base64::encode(data)
    );
}

/// Log the compute units a program consumed out of those it was given.
///
/// The general form is:
///
/// ```notrust
/// "Program <address> consumed <consumed> of <limit> compute units"
/// ```
pub fn program_consumed(
    log_collector: &Option<Rc<RefCell<LogCollector>>>,
    program_id: &Pubkey,
    consumed: u64,
    limit: u64,
) {
    ic_logger_msg!(
        log_collector,
        "Program {} consumed {} of {} compute units",
        program_id,
        consumed,
        limit
    );
}

/// Log successful program execution.
///
/// The general form is:
///
/// ```notrust
/// "Program <address> success"
/// ```
pub fn program_success(log_collector: &Option<Rc<RefCell<LogCollector>>>, program_id: &Pubkey) {
    ic_logger_msg!(log_collector, "Program {} success", program_id);
}

/// Log program execution failure
///
/// The general form is:
///
/// ```notrust
/// "Program <address> failed: <program error details>"
/// ```
pub fn program_failure<E: Display>(
    log_collector: &Option<Rc<RefCell<LogCollector>>>,
    program_id: &Pubkey,
    err: &E,
) {
    ic_logger_msg!(log_collector, "Program {} failed: {}", program_id, err);
}

#[cfg(test)]
mod tests {
    use {super::*, solana_loader_sdk::instruction::InstructionError};

    #[test]
    fn test_stable_log_formats() {
        let log_collector = Some(LogCollector::new_ref());
        let program_id = Pubkey::new_unique();
        program_invoke(&log_collector, &program_id, 1);
        program_log(&log_collector, "hello");
        program_data(&log_collector, &[b"ab", b"c"]);
        program_return(&log_collector, &program_id, &[1, 2, 3]);
        program_consumed(&log_collector, &program_id, 10, 200_000);
        program_success(&log_collector, &program_id);
        program_failure(
            &log_collector,
            &program_id,
            &InstructionError::InvalidAccountData,
        );

        let logs = log_collector.unwrap().borrow().get_recorded_content().to_vec();
        assert_eq!(
            logs,
            vec![
                format!("Program {program_id} invoke [1]"),
                "Program log: hello".to_string(),
                "Program data: YWI= Yw==".to_string(),
                format!("Program return: {program_id} AQID"),
                format!("Program {program_id} consumed 10 of 200000 compute units"),
                format!("Program {program_id} success"),
                format!(
                    "Program {program_id} failed: invalid account data for instruction"
                ),
            ]
        );
    }
}
