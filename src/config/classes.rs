// file: src/config/classes.rs
// version: 1.0.0
// guid: 9b3e7f21-c4d5-4a68-8e90-1f2a3b4c5d6e

//! Ordered set of FAI install classes

use std::collections::HashSet;

/// Install classes in append order, without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classes {
    order: Vec<String>,
    index: HashSet<String>,
}

impl Classes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a class unless it is already present
    pub fn add(&mut self, class: impl Into<String>) -> bool {
        let class = class.into();
        if self.index.contains(&class) {
            return false;
        }
        self.index.insert(class.clone());
        self.order.push(class);
        true
    }

    /// Append every class of `other` in its order
    pub fn extend<I, S>(&mut self, classes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for class in classes {
            self.add(class);
        }
    }

    pub fn contains(&self, class: &str) -> bool {
        self.index.contains(class)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Comma separated form passed to `fai-diskimage --class`
    pub fn to_arg(&self) -> String {
        self.order.join(",")
    }
}

impl<S: Into<String>> FromIterator<S> for Classes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut classes = Classes::new();
        classes.extend(iter);
        classes
    }
}
