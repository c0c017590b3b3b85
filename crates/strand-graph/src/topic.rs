use std::collections::HashMap;

/// Registry metadata for one named channel: which nodes produce on it and
/// which consume from it. Topics have no lifecycle of their own beyond the
/// graph's.
#[derive(Debug, Clone, Default)]
pub struct Topic {
    pub name: String,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
    /// Fan-in topics accept events from multiple producers (explicit
    /// aggregator modeling).
    pub fan_in: bool,
}

/// Maps topic names to their producing and consuming nodes. Pure lookup
/// structure, immutable after graph build.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, Topic>,
}

impl TopicRegistry {
    pub(crate) fn declare(&mut self, name: &str) -> &mut Topic {
        self.topics.entry(name.to_string()).or_insert_with(|| Topic {
            name: name.to_string(),
            ..Default::default()
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    /// Consumer node ids for a topic, in declaration order; empty if the
    /// topic is unknown or has no consumers.
    pub fn consumers_of(&self, name: &str) -> &[String] {
        self.topics
            .get(name)
            .map(|t| t.consumers.as_slice())
            .unwrap_or(&[])
    }

    /// Producer node ids for a topic.
    pub fn producers_of(&self, name: &str) -> &[String] {
        self.topics
            .get(name)
            .map(|t| t.producers.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.topics.values()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
