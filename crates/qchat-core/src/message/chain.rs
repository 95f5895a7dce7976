//! Ordered message chains
//!
//! A chain is an ordered sequence of message elements; insertion order is
//! significant for re-encoding and display. The single-instance constraint
//! (at most one source, at most one quote) is enforced here by the builder,
//! not by the codec: inserting a second instance replaces the prior one
//! (last-write-wins).

use crate::message::element::MessageElement;
use crate::message::source::MessageSource;

// ----------------------------------------------------------------------------
// Message Chain
// ----------------------------------------------------------------------------

/// Ordered sequence of message elements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageChain {
    elements: Vec<MessageElement>,
}

impl MessageChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a chain
    pub fn builder() -> MessageChainBuilder {
        MessageChainBuilder::new()
    }

    /// Build a chain from elements, applying the single-instance policy
    pub fn from_elements(elements: impl IntoIterator<Item = MessageElement>) -> Self {
        let mut builder = Self::builder();
        for element in elements {
            builder.push(element);
        }
        builder.build()
    }

    pub fn elements(&self) -> &[MessageElement] {
        &self.elements
    }

    pub fn iter(&self) -> core::slice::Iter<'_, MessageElement> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The chain's provenance record, when present
    pub fn source(&self) -> Option<&MessageSource> {
        self.elements.iter().find_map(|element| match element {
            MessageElement::Source(source) => Some(source),
            _ => None,
        })
    }

    /// The quoted source, when present
    pub fn quote(&self) -> Option<&MessageSource> {
        self.elements.iter().find_map(|element| match element {
            MessageElement::Quote(source) => Some(source),
            _ => None,
        })
    }

    /// Whether any element satisfies the predicate
    pub fn any(&self, predicate: impl Fn(&MessageElement) -> bool) -> bool {
        self.elements.iter().any(predicate)
    }

    /// Concatenated preview of the displayed content
    pub fn preview_text(&self) -> String {
        self.elements
            .iter()
            .map(MessageElement::preview_text)
            .collect()
    }

    /// The displayed content without metadata elements
    pub fn content_elements(&self) -> impl Iterator<Item = &MessageElement> {
        self.elements.iter().filter(|e| !e.is_metadata())
    }
}

impl FromIterator<MessageElement> for MessageChain {
    fn from_iter<T: IntoIterator<Item = MessageElement>>(iter: T) -> Self {
        Self::from_elements(iter)
    }
}

impl IntoIterator for MessageChain {
    type Item = MessageElement;
    type IntoIter = std::vec::IntoIter<MessageElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageChain {
    type Item = &'a MessageElement;
    type IntoIter = core::slice::Iter<'a, MessageElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}

// ----------------------------------------------------------------------------
// Chain Builder
// ----------------------------------------------------------------------------

/// Builds a chain while enforcing the single-instance constraint.
///
/// Pushing a second source or quote removes the prior instance and appends
/// the new one; the policy is deterministic and stable under repeated
/// construction.
#[derive(Debug, Default)]
pub struct MessageChainBuilder {
    elements: Vec<MessageElement>,
}

impl MessageChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element, replacing any prior single-instance sibling
    pub fn push(&mut self, element: MessageElement) -> &mut Self {
        if element.is_single_instance() {
            let discriminant = core::mem::discriminant(&element);
            self.elements
                .retain(|existing| core::mem::discriminant(existing) != discriminant);
        }
        self.elements.push(element);
        self
    }

    /// Append plain text
    pub fn text(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(MessageElement::Text(content.into()))
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Remove and return the most recently pushed element
    pub fn pop(&mut self) -> Option<MessageElement> {
        self.elements.pop()
    }

    /// Most recently pushed element
    pub fn last(&self) -> Option<&MessageElement> {
        self.elements.last()
    }

    pub fn build(self) -> MessageChain {
        MessageChain {
            elements: self.elements,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Timestamp, UserId};

    fn offline_source(sender: u64) -> MessageSource {
        MessageSource::offline(UserId(sender), UserId(0), Timestamp(0))
    }

    #[test]
    fn test_order_is_preserved() {
        let chain = MessageChain::from_elements([
            MessageElement::Text("a".into()),
            MessageElement::Face(1),
            MessageElement::Text("b".into()),
        ]);
        assert_eq!(chain.len(), 3);
        assert!(matches!(chain.elements()[1], MessageElement::Face(1)));
    }

    #[test]
    fn test_second_source_replaces_first() {
        let chain = MessageChain::from_elements([
            MessageElement::Source(offline_source(1)),
            MessageElement::Text("hi".into()),
            MessageElement::Source(offline_source(2)),
        ]);

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.source().unwrap().sender(), UserId(2));
    }

    #[test]
    fn test_single_instance_policy_is_stable() {
        let build = || {
            MessageChain::from_elements([
                MessageElement::Source(offline_source(1)),
                MessageElement::Source(offline_source(2)),
                MessageElement::Text("x".into()),
            ])
        };
        assert_eq!(build(), build());
        assert_eq!(build().source().unwrap().sender(), UserId(2));
    }

    #[test]
    fn test_quote_is_single_instance_but_independent_of_source() {
        let chain = MessageChain::from_elements([
            MessageElement::Source(offline_source(1)),
            MessageElement::Quote(offline_source(2)),
            MessageElement::Quote(offline_source(3)),
        ]);

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.source().unwrap().sender(), UserId(1));
        assert_eq!(chain.quote().unwrap().sender(), UserId(3));
    }

    #[test]
    fn test_unconstrained_variants_repeat() {
        let chain = MessageChain::from_elements([
            MessageElement::Face(1),
            MessageElement::Face(1),
            MessageElement::Face(1),
        ]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_preview_text() {
        let mut builder = MessageChain::builder();
        builder.text("hello ").push(MessageElement::AtAll);
        assert_eq!(builder.build().preview_text(), "hello @everyone");
    }
}
