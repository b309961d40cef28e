// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::env;

use env_logger::LogBuilder;
use log::LogLevelFilter;

/// Install the process-wide logger.
///
/// `MESHBUS_LOGLEVEL` selects the verbosity (0 errors only .. 4 everything);
/// a `RUST_LOG` spec, when present, is applied on top. Calling this more than
/// once is harmless: only the first call installs a logger.
pub fn init_logging() {
    let mut builder = LogBuilder::new();

    let level = match env::var("MESHBUS_LOGLEVEL").ok().and_then(|v| v.parse::<u8>().ok()) {
        Some(0) => LogLevelFilter::Error,
        Some(1) => LogLevelFilter::Warn,
        Some(2) => LogLevelFilter::Info,
        Some(3) => LogLevelFilter::Debug,
        Some(_) => LogLevelFilter::Trace,
        None => LogLevelFilter::Warn,
    };

    builder.filter(None, level);

    if let Ok(spec) = env::var("RUST_LOG") {
        builder.parse(&spec);
    }

    let _ = builder.init();
}
