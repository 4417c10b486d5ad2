use crate::settings::ClipboardHandling;
use arboard::{Clipboard, ImageData};
use log::{debug, info, warn};
use std::sync::Mutex;

/// Windows-only: Advanced clipboard backup/restore that preserves all formats
#[cfg(target_os = "windows")]
mod win_clipboard {
    use log::{debug, warn};
    use std::ptr;
    use windows::Win32::Foundation::{HANDLE, HGLOBAL};
    use windows::Win32::System::DataExchange::{
        CloseClipboard, EmptyClipboard, EnumClipboardFormats, GetClipboardData, OpenClipboard,
        SetClipboardData,
    };
    use windows::Win32::System::Memory::{GlobalAlloc, GlobalLock, GlobalSize, GlobalUnlock, GHND};

    /// A single clipboard format and its data
    pub struct ClipboardEntry {
        pub format: u32,
        pub data: Vec<u8>,
    }

    pub fn backup_all_formats() -> Result<Vec<ClipboardEntry>, String> {
        let mut entries = Vec::new();

        unsafe {
            if OpenClipboard(None).is_err() {
                return Err("Failed to open clipboard for backup".into());
            }

            let mut format = EnumClipboardFormats(0);
            while format != 0 {
                if let Some(entry) = read_format(format) {
                    entries.push(entry);
                }
                format = EnumClipboardFormats(format);
            }

            let _ = CloseClipboard();
        }

        debug!("Backed up {} clipboard formats", entries.len());
        Ok(entries)
    }

    unsafe fn read_format(format: u32) -> Option<ClipboardEntry> {
        let handle = GetClipboardData(format).ok()?;
        if handle.0.is_null() {
            return None;
        }

        let hglobal = HGLOBAL(handle.0);
        let size = GlobalSize(hglobal);
        if size == 0 {
            return None;
        }

        let ptr = GlobalLock(hglobal);
        if ptr.is_null() {
            return None;
        }

        let data = std::slice::from_raw_parts(ptr as *const u8, size).to_vec();
        let _ = GlobalUnlock(hglobal);

        Some(ClipboardEntry { format, data })
    }

    pub fn restore_all_formats(entries: Vec<ClipboardEntry>) -> Result<(), String> {
        unsafe {
            if OpenClipboard(None).is_err() {
                return Err("Failed to open clipboard for restore".into());
            }

            if EmptyClipboard().is_err() {
                let _ = CloseClipboard();
                return Err("Failed to empty clipboard".into());
            }

            for entry in entries {
                if let Err(e) = write_format(entry.format, &entry.data) {
                    warn!("Failed to restore clipboard format {}: {}", entry.format, e);
                }
            }

            let _ = CloseClipboard();
        }

        Ok(())
    }

    unsafe fn write_format(format: u32, data: &[u8]) -> Result<(), String> {
        let hmem =
            GlobalAlloc(GHND, data.len()).map_err(|e| format!("GlobalAlloc failed: {}", e))?;

        let ptr = GlobalLock(hmem);
        if ptr.is_null() {
            return Err("GlobalLock failed".into());
        }

        ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
        let _ = GlobalUnlock(hmem);

        // The clipboard owns the memory from here on.
        let handle = HANDLE(hmem.0);
        SetClipboardData(format, Some(handle))
            .map_err(|e| format!("SetClipboardData failed: {}", e))?;

        Ok(())
    }
}

/// What was on the clipboard before we overwrote it.
pub enum ClipboardSnapshot {
    /// The clipboard reported no content at all.
    Empty,
    Text(String),
    Image(ImageData<'static>),
    #[cfg(target_os = "windows")]
    Formats(Vec<win_clipboard::ClipboardEntry>),
    /// Restoration is disabled, or the previous content could not be read.
    /// Either way our text stays in place.
    Keep,
}

impl std::fmt::Debug for ClipboardSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClipboardSnapshot::Empty => f.write_str("Empty"),
            ClipboardSnapshot::Text(text) => write!(f, "Text({} chars)", text.chars().count()),
            ClipboardSnapshot::Image(image) => write!(f, "Image({}x{})", image.width, image.height),
            #[cfg(target_os = "windows")]
            ClipboardSnapshot::Formats(entries) => write!(f, "Formats({})", entries.len()),
            ClipboardSnapshot::Keep => f.write_str("Keep"),
        }
    }
}

/// The shared OS clipboard. Only the orchestrator writes to it.
pub trait ClipboardAccess: Send + Sync {
    fn read_text(&self) -> Option<String>;
    fn write_text(&self, text: &str) -> Result<(), String>;
    fn clear(&self) -> Result<(), String>;

    fn write_image(&self, _image: ImageData<'static>) -> Result<(), String> {
        Err("Image clipboard content is not supported".to_string())
    }

    /// Current clipboard content, whatever it is.
    fn capture(&self) -> ClipboardSnapshot {
        match self.read_text() {
            Some(text) => ClipboardSnapshot::Text(text),
            None => ClipboardSnapshot::Empty,
        }
    }

    fn snapshot(&self, handling: ClipboardHandling) -> ClipboardSnapshot {
        if handling == ClipboardHandling::KeepInserted {
            return ClipboardSnapshot::Keep;
        }
        self.capture()
    }

    fn restore(&self, snapshot: ClipboardSnapshot) -> Result<(), String> {
        match snapshot {
            ClipboardSnapshot::Empty => self.clear(),
            ClipboardSnapshot::Text(text) => self.write_text(&text),
            ClipboardSnapshot::Image(image) => self.write_image(image),
            #[cfg(target_os = "windows")]
            ClipboardSnapshot::Formats(entries) => win_clipboard::restore_all_formats(entries),
            ClipboardSnapshot::Keep => Ok(()),
        }
    }
}

/// Converts LF to CRLF on Windows when enabled (some apps eat bare newlines).
pub fn prepare_clipboard_text(text: &str, convert_lf_to_crlf: bool) -> String {
    if cfg!(target_os = "windows") && convert_lf_to_crlf {
        // First normalize any existing CRLF to LF, then convert all LF to CRLF
        text.replace("\r\n", "\n").replace('\n', "\r\n")
    } else {
        text.to_string()
    }
}

/// Decides what a snapshot holds from the raw text read. The image is only
/// read when there is no text. Anything but "no content" is treated as
/// unreadable, which must never end in clearing the clipboard.
fn classify_snapshot(
    text: Result<String, arboard::Error>,
    read_image: impl FnOnce() -> Result<ImageData<'static>, arboard::Error>,
) -> ClipboardSnapshot {
    match text {
        Ok(text) => ClipboardSnapshot::Text(text),
        Err(arboard::Error::ContentNotAvailable) => match read_image() {
            Ok(image) => ClipboardSnapshot::Image(image),
            Err(arboard::Error::ContentNotAvailable) => ClipboardSnapshot::Empty,
            Err(e) => {
                warn!("Clipboard image could not be read, it will not be restored: {e}");
                ClipboardSnapshot::Keep
            }
        },
        Err(e) => {
            warn!("Clipboard could not be read, it will not be restored: {e}");
            ClipboardSnapshot::Keep
        }
    }
}

/// System clipboard through arboard. The handle is kept alive because on X11
/// the owning process has to keep serving the selection.
pub struct SystemClipboard {
    inner: Mutex<Option<Clipboard>>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn with_clipboard<T>(
        &self,
        op: impl FnOnce(&mut Clipboard) -> Result<T, arboard::Error>,
    ) -> Result<T, String> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| format!("Failed to lock clipboard: {}", e))?;
        if guard.is_none() {
            *guard = Some(Clipboard::new().map_err(|e| format!("Failed to open clipboard: {}", e))?);
        }
        match guard.as_mut() {
            Some(clipboard) => op(clipboard).map_err(|e| e.to_string()),
            None => Err("Clipboard unavailable".to_string()),
        }
    }
}

impl Default for SystemClipboard {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardAccess for SystemClipboard {
    fn read_text(&self) -> Option<String> {
        match self.with_clipboard(|clipboard| clipboard.get_text()) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!("Clipboard has no text: {}", e);
                None
            }
        }
    }

    fn write_text(&self, text: &str) -> Result<(), String> {
        self.with_clipboard(|clipboard| clipboard.set_text(text.to_string()))
            .map_err(|e| format!("Failed to write to clipboard: {}", e))
    }

    fn clear(&self) -> Result<(), String> {
        self.with_clipboard(|clipboard| clipboard.clear())
            .map_err(|e| format!("Failed to clear clipboard: {}", e))
    }

    fn write_image(&self, image: ImageData<'static>) -> Result<(), String> {
        self.with_clipboard(|clipboard| clipboard.set_image(image))
            .map_err(|e| format!("Failed to restore clipboard image: {}", e))
    }

    fn capture(&self) -> ClipboardSnapshot {
        let captured = self.with_clipboard(|clipboard| {
            let text = clipboard.get_text();
            Ok(classify_snapshot(text, || {
                clipboard.get_image().map(|image| image.to_owned_img())
            }))
        });
        captured.unwrap_or_else(|e| {
            warn!("Clipboard could not be opened, it will not be restored: {e}");
            ClipboardSnapshot::Keep
        })
    }

    fn snapshot(&self, handling: ClipboardHandling) -> ClipboardSnapshot {
        #[cfg(target_os = "windows")]
        if handling == ClipboardHandling::RestoreAdvanced {
            match win_clipboard::backup_all_formats() {
                Ok(entries) if entries.is_empty() => return ClipboardSnapshot::Empty,
                Ok(entries) => {
                    info!("Advanced clipboard backup: {} formats saved", entries.len());
                    return ClipboardSnapshot::Formats(entries);
                }
                Err(e) => {
                    log::warn!(
                        "Advanced clipboard backup failed: {}. Falling back to text-only.",
                        e
                    );
                }
            }
        }

        #[cfg(not(target_os = "windows"))]
        if handling == ClipboardHandling::RestoreAdvanced {
            info!("Advanced clipboard restore is Windows-only, using text-only backup");
        }

        if handling == ClipboardHandling::KeepInserted {
            return ClipboardSnapshot::Keep;
        }
        self.capture()
    }
}
