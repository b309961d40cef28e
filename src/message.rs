// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::io;
use std::str;

use global::invalid_data_io_error;

/// An opaque payload plus string metadata, traveling on a named channel.
///
/// On the wire a message is multi-part: the channel name first, one part of
/// `key\0value` per meta entry, the payload last. Routers forward the parts
/// verbatim and never look beyond the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    channel: String,
    meta: HashMap<String, String>,
    data: Vec<u8>,
}

impl Message {
    pub fn new() -> Message {
        Message::with_data(Vec::new())
    }

    pub fn with_data(data: Vec<u8>) -> Message {
        Message {
            channel: String::new(),
            meta: HashMap::new(),
            data: data,
        }
    }

    /// The channel this message was published or received on.
    /// Empty until a publisher stamps it.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn put_meta(&mut self, key: &str, value: &str) {
        self.meta.insert(key.to_string(), value.to_string());
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|v| v.as_str())
    }

    pub fn meta(&self) -> &HashMap<String, String> {
        &self.meta
    }

    /// Wire form: `[channel, k\0v .., payload]`.
    pub fn into_parts(mut self, channel: &str) -> Vec<Vec<u8>> {
        let mut parts = Vec::with_capacity(2 + self.meta.len());

        parts.push(channel.as_bytes().to_vec());
        for (key, value) in &self.meta {
            let mut entry = Vec::with_capacity(key.len() + 1 + value.len());
            entry.extend_from_slice(key.as_bytes());
            entry.push(0);
            entry.extend_from_slice(value.as_bytes());
            parts.push(entry);
        }
        parts.push(::std::mem::replace(&mut self.data, Vec::new()));

        parts
    }

    pub fn from_parts(parts: Vec<Vec<u8>>) -> io::Result<Message> {
        if parts.len() < 2 {
            return Err(invalid_data_io_error("message needs channel and payload parts"));
        }

        let mut iter = parts.into_iter();
        let channel = utf8(iter.next().unwrap())?;
        let mut meta = HashMap::new();
        let mut data = iter.next().unwrap();

        for part in iter {
            // the previous part was not the payload after all, it was a meta entry
            let entry = ::std::mem::replace(&mut data, part);
            let nul = entry.iter().position(|&b| b == 0)
                .ok_or_else(|| invalid_data_io_error("meta entry misses separator"))?;
            let value = utf8(entry[nul + 1..].to_vec())?;
            let mut key_bytes = entry;
            key_bytes.truncate(nul);
            meta.insert(utf8(key_bytes)?, value);
        }

        Ok(Message {
            channel: channel,
            meta: meta,
            data: data,
        })
    }
}

fn utf8(bytes: Vec<u8>) -> io::Result<String> {
    String::from_utf8(bytes).map_err(|_| invalid_data_io_error("message part is not utf-8"))
}
