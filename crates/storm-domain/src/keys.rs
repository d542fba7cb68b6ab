//! Escaping of user-supplied map keys.
//!
//! The backing document store rejects `\0`, `$` and `.` in keys, and the
//! query engine gives `.` a path meaning. Free-form maps (resource snapshots,
//! job params, group queries) may legitimately contain those characters, so
//! keys are escaped before storage and unescaped on read.

use serde_json::Value;

const ESC: char = '\x1b';

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '\0' | '$' | '.' | ESC => {
                // 0x2f is the character before '0'; everything at or after it
                // is accepted by the store, so shifting by 0x2f maps each
                // forbidden character onto a plain one.
                out.push(ESC);
                out.push(char::from_u32(0x2f + c as u32).expect("shifted escape is valid"));
            }
            _ => out.push(c),
        }
    }
    out
}

fn unescape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars();
    while let Some(c) = chars.next() {
        if c == ESC {
            match chars.next() {
                Some(e) => match (e as u32).checked_sub(0x2f).and_then(char::from_u32) {
                    Some(original) => out.push(original),
                    None => out.push(e),
                },
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn replace_keys(value: Value, f: &impl Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (f(&k), replace_keys(v, f)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| replace_keys(v, f)).collect())
        }
        scalar => scalar,
    }
}

/// Replace `\0`, `$` and `.` in map keys, recursively through nested maps and
/// lists, with sequences the backing store accepts. Scalars pass through
/// unchanged.
pub fn escape_keys(value: Value) -> Value {
    replace_keys(value, &escape_key)
}

/// Restore map keys escaped by [`escape_keys`].
pub fn unescape_keys(value: Value) -> Value {
    replace_keys(value, &unescape_key)
}
