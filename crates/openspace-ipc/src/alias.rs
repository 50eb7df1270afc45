//! Alias resolution data: which wire names and payload shapes to try, in
//! which order, for each backend operation.

use std::collections::HashMap;
use std::fmt;

use serde_json::{json, Value};

/// A backend operation, independent of what the backend currently calls it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Write,
    Resize,
    Kill,
    List,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Create,
        Operation::Write,
        Operation::Resize,
        Operation::Kill,
        Operation::List,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Write => "write",
            Operation::Resize => "resize",
            Operation::Kill => "kill",
            Operation::List => "list",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the payload is laid out in the invoke arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadShape {
    /// `{ "request": payload }`, for commands taking a single `request` argument.
    Wrapped,
    /// The payload's fields are the arguments themselves.
    Flat,
}

impl PayloadShape {
    /// Lay out `payload` as invoke arguments.
    pub fn apply(self, payload: &Value) -> Value {
        match self {
            PayloadShape::Wrapped => json!({ "request": payload }),
            PayloadShape::Flat => payload.clone(),
        }
    }
}

/// One `(name, shape)` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStrategy {
    pub command: String,
    pub shape: PayloadShape,
}

#[derive(Debug, Clone)]
struct Entry {
    names: Vec<String>,
    shapes: Vec<PayloadShape>,
}

/// Ordered wire names and payload shapes per operation.
///
/// The first name and first shape are canonical. Strategies are produced
/// name-major: every shape of the canonical name is tried before the first
/// alias.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: HashMap<Operation, Entry>,
}

impl AliasTable {
    /// An empty table. Every operation fails with `NoStrategies` until filled.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Replace the wire names for `operation`, keeping its shapes.
    pub fn with_names<I, S>(mut self, operation: Operation, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.entries.entry(operation).or_insert_with(|| Entry {
            names: Vec::new(),
            shapes: vec![PayloadShape::Wrapped, PayloadShape::Flat],
        });
        entry.names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the payload shapes for `operation`, keeping its names.
    pub fn with_shapes(mut self, operation: Operation, shapes: &[PayloadShape]) -> Self {
        let entry = self.entries.entry(operation).or_insert_with(|| Entry {
            names: Vec::new(),
            shapes: Vec::new(),
        });
        entry.shapes = shapes.to_vec();
        self
    }

    /// Every `(name, shape)` combination for `operation`, in priority order.
    pub fn strategies(&self, operation: Operation) -> Vec<CallStrategy> {
        let Some(entry) = self.entries.get(&operation) else {
            return Vec::new();
        };
        entry
            .names
            .iter()
            .flat_map(|name| {
                entry.shapes.iter().map(move |&shape| CallStrategy {
                    command: name.clone(),
                    shape,
                })
            })
            .collect()
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        use PayloadShape::{Flat, Wrapped};

        Self::empty()
            .with_names(
                Operation::Create,
                ["terminal_create", "create_terminal", "pty_create", "terminal:create"],
            )
            .with_shapes(Operation::Create, &[Wrapped, Flat])
            .with_names(
                Operation::Write,
                ["terminal_write", "write_input", "pty_write", "terminal:write"],
            )
            .with_shapes(Operation::Write, &[Wrapped, Flat])
            .with_names(
                Operation::Resize,
                ["terminal_resize", "resize_terminal", "pty_resize", "terminal:resize"],
            )
            .with_shapes(Operation::Resize, &[Wrapped, Flat])
            .with_names(
                Operation::Kill,
                ["terminal_kill", "close_terminal", "pty_kill", "terminal:kill"],
            )
            .with_shapes(Operation::Kill, &[Wrapped, Flat])
            .with_names(
                Operation::List,
                ["terminal_list", "list_terminals", "pty_list", "terminal:list"],
            )
            .with_shapes(Operation::List, &[Flat])
    }
}
