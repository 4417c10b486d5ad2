//! Windows UI Automation backend.
//!
//! COM objects are created per probe call and never cross threads.

use crate::active_app::get_frontmost_app_name;
use crate::text_context::{AccessibilityTree, TextAttributes};
use log::debug;
use windows::core::BSTR;
use windows::Win32::System::Com::{CoCreateInstance, CoInitializeEx, CLSCTX_ALL, COINIT_MULTITHREADED};
use windows::Win32::UI::Accessibility::{
    CUIAutomation, IUIAutomation, IUIAutomationElement, IUIAutomationTextPattern,
    IUIAutomationTreeWalker, IUIAutomationValuePattern, UIA_TextPatternId, UIA_ValuePatternId,
};

/// Upper bound on selected text we read back, in UTF-16 units.
const MAX_SELECTION_CHARS: i32 = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct UiaTree;

#[derive(Clone)]
pub struct UiaElement {
    walker: IUIAutomationTreeWalker,
    element: IUIAutomationElement,
}

impl UiaTree {
    fn automation() -> Option<IUIAutomation> {
        unsafe {
            // Already-initialized apartments return S_FALSE; that is fine.
            let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
            match CoCreateInstance(&CUIAutomation, None, CLSCTX_ALL) {
                Ok(automation) => Some(automation),
                Err(e) => {
                    debug!("Failed to create IUIAutomation: {}", e);
                    None
                }
            }
        }
    }

    fn value_pattern(element: &IUIAutomationElement) -> Option<IUIAutomationValuePattern> {
        unsafe {
            element
                .GetCurrentPatternAs::<IUIAutomationValuePattern>(UIA_ValuePatternId)
                .ok()
        }
    }

    fn selected_text(element: &IUIAutomationElement) -> String {
        unsafe {
            let Ok(pattern) =
                element.GetCurrentPatternAs::<IUIAutomationTextPattern>(UIA_TextPatternId)
            else {
                return String::new();
            };
            let Ok(ranges) = pattern.GetSelection() else {
                return String::new();
            };
            let count = ranges.Length().unwrap_or(0);
            let mut selected = String::new();
            for index in 0..count {
                if let Ok(range) = ranges.GetElement(index) {
                    if let Ok(text) = range.GetText(MAX_SELECTION_CHARS) {
                        selected.push_str(&text.to_string());
                    }
                }
            }
            selected
        }
    }
}

impl AccessibilityTree for UiaTree {
    type Element = UiaElement;

    fn focused_element(&self) -> Option<UiaElement> {
        let automation = Self::automation()?;
        unsafe {
            let element = automation.GetFocusedElement().ok()?;
            let walker = automation.ControlViewWalker().ok()?;
            Some(UiaElement { walker, element })
        }
    }

    fn children(&self, parent: &UiaElement, limit: usize) -> Vec<UiaElement> {
        let mut children = Vec::new();
        if limit == 0 {
            return children;
        }
        unsafe {
            let mut next = parent.walker.GetFirstChildElement(&parent.element).ok();
            while let Some(element) = next {
                // Sibling lists can be huge or endless; never walk past the cap.
                next = if children.len() + 1 < limit {
                    parent.walker.GetNextSiblingElement(&element).ok()
                } else {
                    None
                };
                children.push(UiaElement {
                    walker: parent.walker.clone(),
                    element,
                });
            }
        }
        children
    }

    fn text_attributes(&self, element: &UiaElement) -> Option<TextAttributes> {
        let pattern = Self::value_pattern(&element.element)?;
        let value = unsafe { pattern.CurrentValue().ok()? };
        Some(TextAttributes {
            value: value.to_string(),
            selected_text: Self::selected_text(&element.element),
        })
    }

    fn set_value(&self, element: &UiaElement, value: &str) -> bool {
        let Some(pattern) = Self::value_pattern(&element.element) else {
            return false;
        };
        unsafe {
            if pattern
                .CurrentIsReadOnly()
                .map(|read_only| read_only.as_bool())
                .unwrap_or(true)
            {
                debug!("Focused element is read-only");
                return false;
            }
            match pattern.SetValue(&BSTR::from(value)) {
                Ok(()) => true,
                Err(e) => {
                    debug!("UIA SetValue failed: {}", e);
                    false
                }
            }
        }
    }

    fn application_name(&self, _element: &UiaElement) -> String {
        get_frontmost_app_name().unwrap_or_default()
    }
}
