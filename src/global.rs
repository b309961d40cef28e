// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, ONCE_INIT};

use uuid::Uuid;

/// Length of every node, publisher and subscriber identifier on the wire.
pub const UUID_LEN: usize = 36;

pub fn new_uuid() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

/// The first uuid block, enough to tell actors apart in log output.
pub fn short_uuid(uuid: &str) -> &str {
    if uuid.len() >= 8 {
        &uuid[..8]
    } else {
        uuid
    }
}

static PROCESS_UUID_INIT: Once = ONCE_INIT;
static mut PROCESS_UUID: Option<String> = None;

/// Identifier of this process, stable for the process lifetime.
/// Lazily initialized on first use and never torn down.
pub fn process_uuid() -> &'static str {
    unsafe {
        PROCESS_UUID_INIT.call_once(|| {
            PROCESS_UUID = Some(new_uuid());
        });
        PROCESS_UUID.as_ref().unwrap()
    }
}

/// Monotonically increasing ids for poll tokens.
/// Cheap to clone so several owners can draw from the same sequence.
#[derive(Clone)]
pub struct IdSequence {
    value: Arc<AtomicUsize>,
}

impl IdSequence {
    pub fn new(start: usize) -> IdSequence {
        IdSequence { value: Arc::new(AtomicUsize::new(start)) }
    }

    pub fn next(&self) -> usize {
        self.value.fetch_add(1, Ordering::SeqCst)
    }
}

pub fn other_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::Other, msg)
}

pub fn invalid_data_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

pub fn invalid_input_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidInput, msg)
}

pub fn timed_out_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::TimedOut, msg)
}
