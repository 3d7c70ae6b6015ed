//! Device parameter enumeration and the name-indexed catalog.
//!
//! The modem describes its own variables: each `GetParameters <idx>` reply
//! carries one element whose `nextidx` field points at the next index to
//! query, forming a singly linked enumeration. The walk is strictly
//! sequential: the wire has no reply correlation, so only one request may
//! be outstanding at a time.

use std::collections::HashMap;

use serde::Deserialize;

/// Value format of a device parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterFormat {
    Int,
    Float,
}

/// One entry in the device's self-describing parameter enumeration.
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterElement {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Format")]
    pub format: ParameterFormat,
    #[serde(rename = "Channel")]
    pub channel: i64,
    pub description: String,
    /// Index of the next element to query; ≤ 0 marks the terminal element.
    pub nextidx: i64,
}

impl ParameterElement {
    /// Whether this element terminates the enumeration.
    pub fn is_terminal(&self) -> bool {
        self.nextidx <= 0
    }
}

/// Outcome of absorbing one enumeration reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnumStep {
    /// Element committed; continue the walk at this index.
    Continue(i64),
    /// Terminal element observed (not stored); the walk is complete.
    Done,
}

/// Name-indexed tables of the device's parameters, split by value format.
///
/// Built once by [`crate::Modem::load_parameters`] and read-only
/// thereafter; there is no live invalidation.
#[derive(Debug, Clone, Default)]
pub struct ParameterCatalog {
    int_params: HashMap<String, ParameterElement>,
    float_params: HashMap<String, ParameterElement>,
}

impl ParameterCatalog {
    /// Look up an integer-valued parameter by name.
    pub fn get_int(&self, name: &str) -> Option<&ParameterElement> {
        self.int_params.get(name)
    }

    /// Look up a float-valued parameter by name.
    pub fn get_float(&self, name: &str) -> Option<&ParameterElement> {
        self.float_params.get(name)
    }

    pub fn int_params(&self) -> impl Iterator<Item = &ParameterElement> {
        self.int_params.values()
    }

    pub fn float_params(&self) -> impl Iterator<Item = &ParameterElement> {
        self.float_params.values()
    }

    /// Total number of committed parameters across both tables.
    pub fn len(&self) -> usize {
        self.int_params.len() + self.float_params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.int_params.is_empty() && self.float_params.is_empty()
    }

    /// Absorb one enumeration element.
    ///
    /// Invariant: an element is committed only when its own `nextidx` is
    /// positive; the terminal element is observed but never stored.
    pub(crate) fn absorb(&mut self, element: ParameterElement) -> EnumStep {
        if element.is_terminal() {
            return EnumStep::Done;
        }
        let next = element.nextidx;
        let table = match element.format {
            ParameterFormat::Int => &mut self.int_params,
            ParameterFormat::Float => &mut self.float_params,
        };
        table.insert(element.name.clone(), element);
        EnumStep::Continue(next)
    }
}
