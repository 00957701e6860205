use std::collections::BTreeMap;

use crate::ops::graph::trace::FeedSignature;
use crate::tensor::Tensor;

/// Runtime value bound to a named graph input.
#[derive(Debug, Clone, PartialEq)]
pub enum Feed {
    Tensor(Tensor),
    /// Marks an optional input as absent for this run.
    Absent,
}

/// Named feeds for one session run. Inputs that are not mentioned count as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feeds {
    entries: BTreeMap<String, Feed>,
}

impl Feeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, Feed::Tensor(tensor));
        self
    }

    pub fn absent(mut self, name: impl Into<String>) -> Self {
        self.insert(name, Feed::Absent);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, feed: Feed) {
        self.entries.insert(name.into(), feed);
    }

    pub fn get(&self, name: &str) -> Option<&Feed> {
        self.entries.get(name)
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        match self.entries.get(name) {
            Some(Feed::Tensor(tensor)) => Some(tensor),
            _ => None,
        }
    }

    /// Types the tracer specializes on.
    pub fn signature(&self) -> FeedSignature {
        self.entries
            .iter()
            .map(|(name, feed)| {
                let spec = match feed {
                    Feed::Tensor(tensor) => Some(tensor.spec()),
                    Feed::Absent => None,
                };
                (name.clone(), spec)
            })
            .collect()
    }
}
