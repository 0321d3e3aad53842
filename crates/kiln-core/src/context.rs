//! Layered key/value maps for render context and globals.
//!
//! A layer owns its local values and optionally chains to a parent layer.
//! Reads walk up the chain, writes always land locally. A fork's layers chain
//! to the parent engine's layers, so later parent writes stay visible to the
//! fork while fork writes never reach the parent.

use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;

pub type SharedLayer = Rc<RefCell<Layer>>;

#[derive(Debug, Default)]
pub struct Layer {
    values: Map<String, Value>,
    parent: Option<SharedLayer>,
}

impl Layer {
    pub fn root() -> SharedLayer {
        Rc::new(RefCell::new(Layer::default()))
    }

    pub fn child(parent: &SharedLayer) -> SharedLayer {
        Rc::new(RefCell::new(Layer {
            values: Map::new(),
            parent: Some(parent.clone()),
        }))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match self.values.get(key) {
            Some(v) => Some(v.clone()),
            None => self.parent.as_ref().and_then(|p| p.borrow().get(key)),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
            || self.parent.as_ref().is_some_and(|p| p.borrow().contains(key))
    }

    /// Flattened view, nearer layers overriding ancestors.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut out = match &self.parent {
            Some(parent) => parent.borrow().snapshot(),
            None => Map::new(),
        };
        for (k, v) in &self.values {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}
