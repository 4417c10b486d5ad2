//! Reads and writes the focused text field of a foreign application.
//!
//! The walk starts at the system-wide focused element and searches its
//! descendants breadth-first for the first element exposing both a text value
//! and a selection. Accessibility trees can be deep, huge or even cyclic, so
//! the walk is capped in depth and in visited nodes.

use crate::permissions::PermissionGate;
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_MAX_DEPTH: usize = 6;
pub const DEFAULT_MAX_NODES: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextContext {
    pub existing_content: String,
    pub selected_text: String,
    pub has_selection: bool,
    pub source_app_name: String,
}

impl TextContext {
    /// Sentinel for "could not determine".
    pub fn empty() -> Self {
        Self::default()
    }

    /// True for the sentinel and for a genuinely empty field alike.
    pub fn is_empty(&self) -> bool {
        self.existing_content.is_empty() && !self.has_selection
    }

    pub fn selection(&self) -> Option<&str> {
        if self.has_selection {
            Some(self.selected_text.as_str())
        } else {
            None
        }
    }
}

/// Text-bearing attributes of an accessibility element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextAttributes {
    pub value: String,
    pub selected_text: String,
}

/// Platform accessibility tree.
///
/// Elements only live for the duration of one probe call, so they need not be
/// `Send`.
pub trait AccessibilityTree: Send + Sync {
    type Element;

    fn focused_element(&self) -> Option<Self::Element>;
    /// At most `limit` children, in order. Backends must stop enumerating
    /// once the limit is reached.
    fn children(&self, element: &Self::Element, limit: usize) -> Vec<Self::Element>;
    /// `None` unless the element exposes both a value and a selection.
    fn text_attributes(&self, element: &Self::Element) -> Option<TextAttributes>;
    fn set_value(&self, element: &Self::Element, value: &str) -> bool;
    fn application_name(&self, element: &Self::Element) -> String;
}

/// What the orchestrator needs from the probe.
pub trait ContextProbe: Send + Sync {
    /// Never fails; returns [`TextContext::empty`] when nothing can be read.
    fn get_current_text_context(&self) -> TextContext;
    fn set_text_content(&self, text: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchBounds {
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl Default for SearchBounds {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

pub struct TextContextProbe<T: AccessibilityTree> {
    tree: T,
    permissions: Arc<PermissionGate>,
    bounds: SearchBounds,
}

impl<T: AccessibilityTree> TextContextProbe<T> {
    pub fn new(tree: T, permissions: Arc<PermissionGate>, bounds: SearchBounds) -> Self {
        Self {
            tree,
            permissions,
            bounds,
        }
    }

    fn resolve_text_element(&self) -> Option<(T::Element, TextAttributes)> {
        let focused = self.tree.focused_element()?;
        if let Some(attributes) = self.tree.text_attributes(&focused) {
            return Some((focused, attributes));
        }
        find_text_descendant(&self.tree, focused, self.bounds)
    }
}

impl<T: AccessibilityTree> ContextProbe for TextContextProbe<T> {
    fn get_current_text_context(&self) -> TextContext {
        if !self.permissions.state().can_automate_ui {
            debug!("UI automation not granted, skipping text context probe");
            return TextContext::empty();
        }

        let Some((element, attributes)) = self.resolve_text_element() else {
            debug!("No text element found under focus");
            return TextContext::empty();
        };

        TextContext {
            has_selection: !attributes.selected_text.is_empty(),
            existing_content: attributes.value,
            selected_text: attributes.selected_text,
            source_app_name: self.tree.application_name(&element),
        }
    }

    fn set_text_content(&self, text: &str) -> bool {
        if !self.permissions.state().can_automate_ui {
            debug!("UI automation not granted, skipping direct write");
            return false;
        }

        match self.resolve_text_element() {
            Some((element, _)) => self.tree.set_value(&element, text),
            None => false,
        }
    }
}

/// Breadth-first search below `root` honouring `bounds`.
fn find_text_descendant<T: AccessibilityTree>(
    tree: &T,
    root: T::Element,
    bounds: SearchBounds,
) -> Option<(T::Element, TextAttributes)> {
    let mut queue: VecDeque<(T::Element, usize)> = VecDeque::new();
    queue.push_back((root, 0));
    let mut visited = 0usize;

    while let Some((element, depth)) = queue.pop_front() {
        if depth >= bounds.max_depth {
            continue;
        }

        let remaining = bounds.max_nodes.saturating_sub(visited);
        if remaining == 0 {
            trace!("Text element search hit node cap ({})", bounds.max_nodes);
            return None;
        }

        for child in tree.children(&element, remaining) {
            visited += 1;
            if let Some(attributes) = tree.text_attributes(&child) {
                trace!("Found text element at depth {} after {} nodes", depth + 1, visited);
                return Some((child, attributes));
            }
            queue.push_back((child, depth + 1));
        }
    }

    None
}

/// Tree for platforms without an accessibility backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedTree;

impl AccessibilityTree for UnsupportedTree {
    type Element = ();

    fn focused_element(&self) -> Option<()> {
        None
    }

    fn children(&self, _element: &(), _limit: usize) -> Vec<()> {
        Vec::new()
    }

    fn text_attributes(&self, _element: &()) -> Option<TextAttributes> {
        None
    }

    fn set_value(&self, _element: &(), _value: &str) -> bool {
        false
    }

    fn application_name(&self, _element: &()) -> String {
        String::new()
    }
}
