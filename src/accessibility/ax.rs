//! macOS Accessibility (AX) backend.
//!
//! Elements are owned `CFType`s, so cloning retains and dropping releases.

use crate::active_app::get_frontmost_app_name;
use crate::text_context::{AccessibilityTree, TextAttributes};
use core_foundation::array::{CFArray, CFArrayRef};
use core_foundation::base::{CFIndex, CFType, CFTypeRef, TCFType};
use core_foundation::string::{CFString, CFStringRef};
use log::debug;
use std::os::raw::c_void;
use std::ptr;

type AXUIElementRef = *const c_void;
type AXError = i32;

const AX_ERROR_SUCCESS: AXError = 0;

const AX_FOCUSED_UI_ELEMENT: &str = "AXFocusedUIElement";
const AX_CHILDREN: &str = "AXChildren";
const AX_VALUE: &str = "AXValue";
const AX_SELECTED_TEXT: &str = "AXSelectedText";

#[link(name = "ApplicationServices", kind = "framework")]
extern "C" {
    fn AXUIElementCreateSystemWide() -> AXUIElementRef;
    fn AXUIElementCopyAttributeValue(
        element: AXUIElementRef,
        attribute: CFStringRef,
        value: *mut CFTypeRef,
    ) -> AXError;
    fn AXUIElementCopyAttributeValues(
        element: AXUIElementRef,
        attribute: CFStringRef,
        index: CFIndex,
        max_values: CFIndex,
        values: *mut CFArrayRef,
    ) -> AXError;
    fn AXUIElementIsAttributeSettable(
        element: AXUIElementRef,
        attribute: CFStringRef,
        settable: *mut u8,
    ) -> AXError;
    fn AXUIElementSetAttributeValue(
        element: AXUIElementRef,
        attribute: CFStringRef,
        value: CFTypeRef,
    ) -> AXError;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AxTree;

#[derive(Clone)]
pub struct AxElement(CFType);

impl AxElement {
    fn as_ptr(&self) -> AXUIElementRef {
        self.0.as_CFTypeRef()
    }

    /// Takes ownership of a +1 reference. `None` for null.
    fn from_owned(raw: CFTypeRef) -> Option<Self> {
        if raw.is_null() {
            return None;
        }
        Some(Self(unsafe { CFType::wrap_under_create_rule(raw) }))
    }

    fn copy_attribute(&self, attribute: &str) -> Option<CFType> {
        let name = CFString::new(attribute);
        let mut value: CFTypeRef = ptr::null();
        let err = unsafe {
            AXUIElementCopyAttributeValue(self.as_ptr(), name.as_concrete_TypeRef(), &mut value)
        };
        if err != AX_ERROR_SUCCESS || value.is_null() {
            return None;
        }
        Some(unsafe { CFType::wrap_under_create_rule(value) })
    }

    fn string_attribute(&self, attribute: &str) -> Option<String> {
        self.copy_attribute(attribute)?
            .downcast::<CFString>()
            .map(|value| value.to_string())
    }
}

impl AccessibilityTree for AxTree {
    type Element = AxElement;

    fn focused_element(&self) -> Option<AxElement> {
        let system_wide = AxElement::from_owned(unsafe { AXUIElementCreateSystemWide() })?;
        let focused = system_wide.copy_attribute(AX_FOCUSED_UI_ELEMENT);
        if focused.is_none() {
            debug!("No AXFocusedUIElement");
        }
        focused.map(AxElement)
    }

    fn children(&self, parent: &AxElement, limit: usize) -> Vec<AxElement> {
        if limit == 0 {
            return Vec::new();
        }
        let name = CFString::new(AX_CHILDREN);
        let max_values = CFIndex::try_from(limit).unwrap_or(CFIndex::MAX);
        let mut values: CFArrayRef = ptr::null();
        // Only the first `limit` children are copied out of the target process.
        let err = unsafe {
            AXUIElementCopyAttributeValues(
                parent.as_ptr(),
                name.as_concrete_TypeRef(),
                0,
                max_values,
                &mut values,
            )
        };
        if err != AX_ERROR_SUCCESS || values.is_null() {
            return Vec::new();
        }

        let array: CFArray<CFType> = unsafe { CFArray::wrap_under_create_rule(values) };
        array
            .iter()
            .take(limit)
            .map(|child| AxElement((*child).clone()))
            .collect()
    }

    fn text_attributes(&self, element: &AxElement) -> Option<TextAttributes> {
        let value = element.string_attribute(AX_VALUE)?;
        let selected_text = element.string_attribute(AX_SELECTED_TEXT)?;
        Some(TextAttributes {
            value,
            selected_text,
        })
    }

    fn set_value(&self, element: &AxElement, value: &str) -> bool {
        let name = CFString::new(AX_VALUE);
        let mut settable = 0u8;
        let err = unsafe {
            AXUIElementIsAttributeSettable(element.as_ptr(), name.as_concrete_TypeRef(), &mut settable)
        };
        if err != AX_ERROR_SUCCESS || settable == 0 {
            debug!("AXValue is not settable on the focused element");
            return false;
        }

        let new_value = CFString::new(value);
        let err = unsafe {
            AXUIElementSetAttributeValue(
                element.as_ptr(),
                name.as_concrete_TypeRef(),
                new_value.as_CFTypeRef(),
            )
        };
        if err != AX_ERROR_SUCCESS {
            debug!("AXUIElementSetAttributeValue failed: {}", err);
            return false;
        }
        true
    }

    fn application_name(&self, _element: &AxElement) -> String {
        get_frontmost_app_name().unwrap_or_default()
    }
}
