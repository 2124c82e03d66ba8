// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::atomic;

use parking_lot::Mutex;

use crate::values::{Key, Value};

///
/// A struct that encapsulates interning of `Value`s as comparable `Key`s.
///
/// Comparing two `Value`s is a structural (and potentially expensive) operation, while `Key`s
/// compare by id. Params are built from Keys so that the Nodes which contain them are cheap to
/// hash and compare.
///
/// `Value`s are interned indefinitely as `Key`s, meaning that they can never be collected.
///
#[derive(Default)]
pub struct Interns {
    keys: Mutex<HashMap<Value, u64>>,
    id_generator: atomic::AtomicU64,
}

impl Interns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_insert(&self, v: Value) -> Key {
        let id = {
            let mut keys = self.keys.lock();
            *keys.entry(v.clone()).or_insert_with(|| {
                self.id_generator
                    .fetch_add(1, atomic::Ordering::Relaxed)
            })
        };
        Key::new(id, v.type_id(), v)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }
}
