use std::{io, sync::Once, thread};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use log::LevelFilter;
use stream_replication::types::basic::NodeAddress;

static LOGGER_INIT: Once = Once::new();

// Set up a logger that logs all log messages with level `level` and above.
pub(crate) fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}

// Log a test step, prefixed with the node it concerns (if any).
pub(crate) fn log_with_context(node: Option<NodeAddress>, message: &str) {
    match node {
        Some(node) => log::info!("[{}] {}", first_seven_base64_chars(&node.bytes()), message),
        None => log::info!("[test] {}", message),
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}
