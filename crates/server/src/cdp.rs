//! chromiumoxide-backed implementation of the browser-control seam.
//!
//! One headless Chrome process per instance. The CDP event handler is drained
//! by a dedicated task for the lifetime of the page; input is replayed through
//! the `Input` domain, screenshots through `Page.captureScreenshot`, and
//! viewport changes through `Emulation.setDeviceMetricsOverride`.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, ReloadParams};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use periscope_protocol::{ImageFormat, InputAction, PointerButton};

use crate::driver::{BrowserDriver, DriverError, PageHandle, SnapshotOptions};

/// CDP modifier bitmask (Input.dispatchKeyEvent).
const MOD_ALT: i64 = 1;
const MOD_CTRL: i64 = 2;
const MOD_META: i64 = 4;
const MOD_SHIFT: i64 = 8;

/// Launches one headless Chrome per instance.
pub struct CdpDriver {
    navigation_timeout: Duration,
}

impl CdpDriver {
    pub fn new(navigation_timeout: Duration) -> Self {
        Self { navigation_timeout }
    }
}

impl Default for CdpDriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl BrowserDriver for CdpDriver {
    type Page = CdpPage;

    async fn open(&self, url: &str, width: u32, height: u32) -> Result<CdpPage, DriverError> {
        let config = BrowserConfig::builder()
            .viewport(Viewport {
                width,
                height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .request_timeout(self.navigation_timeout)
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-software-rasterizer")
            .build()
            .map_err(DriverError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        // Drain CDP events for the lifetime of the connection; the stream
        // ends when the browser process goes away.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler error: {e}");
                }
            }
        });

        let page = match browser.new_page(url).await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(DriverError::Launch(e.to_string()));
            }
        };

        Ok(CdpPage {
            browser: Mutex::new(browser),
            page,
            handler: handler_task,
            last_pointer: StdMutex::new((0.0, 0.0)),
        })
    }
}

/// A live Chrome page plus the process and event-drain task that keep it
/// alive.
pub struct CdpPage {
    browser: Mutex<Browser>,
    page: Page,
    handler: JoinHandle<()>,
    /// Last dispatched pointer position, used when mouseDown/mouseUp omit
    /// coordinates.
    last_pointer: StdMutex<(f64, f64)>,
}

impl CdpPage {
    fn pointer(&self) -> (f64, f64) {
        *self.last_pointer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_pointer(&self, x: f64, y: f64) {
        *self.last_pointer.lock().unwrap_or_else(|e| e.into_inner()) = (x, y);
    }

    async fn mouse_event(
        &self,
        kind: DispatchMouseEventType,
        x: f64,
        y: f64,
        button: Option<MouseButton>,
        click_count: Option<i64>,
    ) -> Result<(), DriverError> {
        let mut builder = DispatchMouseEventParams::builder().r#type(kind).x(x).y(y);
        if let Some(button) = button {
            builder = builder.button(button);
        }
        if let Some(count) = click_count {
            builder = builder.click_count(count);
        }
        let params = builder.build().map_err(DriverError::Input)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| DriverError::Input(e.to_string()))?;
        Ok(())
    }

    async fn key_event(
        &self,
        kind: DispatchKeyEventType,
        key: &str,
        modifiers: i64,
    ) -> Result<(), DriverError> {
        let params = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key(key)
            .modifiers(modifiers)
            .build()
            .map_err(DriverError::Input)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| DriverError::Input(e.to_string()))?;
        Ok(())
    }

    async fn click_at(&self, x: f64, y: f64, count: i64) -> Result<(), DriverError> {
        self.set_pointer(x, y);
        self.mouse_event(
            DispatchMouseEventType::MousePressed,
            x,
            y,
            Some(MouseButton::Left),
            Some(count),
        )
        .await?;
        self.mouse_event(
            DispatchMouseEventType::MouseReleased,
            x,
            y,
            Some(MouseButton::Left),
            Some(count),
        )
        .await
    }

    async fn eval(&self, js: String) -> Result<(), DriverError> {
        self.page
            .evaluate(js)
            .await
            .map_err(|e| DriverError::Input(e.to_string()))?;
        Ok(())
    }
}

impl PageHandle for CdpPage {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|e| DriverError::Navigation(e.to_string()))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;
        Ok(url.unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn screenshot(&self, opts: SnapshotOptions) -> Result<Vec<u8>, DriverError> {
        let format = match opts.format {
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
            ImageFormat::Png => CaptureScreenshotFormat::Png,
        };
        let mut builder = ScreenshotParams::builder()
            .format(format)
            .full_page(opts.full_page);
        if opts.format == ImageFormat::Jpeg {
            builder = builder.quality(i64::from(opts.quality));
        }
        self.page
            .screenshot(builder.build())
            .await
            .map_err(|e| DriverError::Capture(e.to_string()))
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), DriverError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(width))
            .height(i64::from(height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(DriverError::Input)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| DriverError::Input(e.to_string()))?;
        Ok(())
    }

    async fn input(&self, action: &InputAction) -> Result<(), DriverError> {
        match action {
            InputAction::Click { x, y } => self.click_at(*x, *y, 1).await,
            InputAction::DoubleClick { x, y } => self.click_at(*x, *y, 2).await,
            InputAction::MouseDown { button, x, y } => {
                let (px, py) = match (x, y) {
                    (Some(x), Some(y)) => (*x, *y),
                    _ => self.pointer(),
                };
                self.set_pointer(px, py);
                self.mouse_event(
                    DispatchMouseEventType::MousePressed,
                    px,
                    py,
                    Some(cdp_button(*button)),
                    Some(1),
                )
                .await
            }
            InputAction::MouseUp { button } => {
                let (px, py) = self.pointer();
                self.mouse_event(
                    DispatchMouseEventType::MouseReleased,
                    px,
                    py,
                    Some(cdp_button(*button)),
                    Some(1),
                )
                .await
            }
            InputAction::MouseMove { x, y } => {
                self.set_pointer(*x, *y);
                self.mouse_event(DispatchMouseEventType::MouseMoved, *x, *y, None, None)
                    .await
            }
            InputAction::Type { text } => {
                self.page
                    .execute(InsertTextParams::new(text.clone()))
                    .await
                    .map_err(|e| DriverError::Input(e.to_string()))?;
                Ok(())
            }
            InputAction::Key { key } => {
                let (modifiers, key) = parse_key_chord(key);
                self.key_event(DispatchKeyEventType::KeyDown, &key, modifiers)
                    .await?;
                self.key_event(DispatchKeyEventType::KeyUp, &key, modifiers)
                    .await
            }
            InputAction::KeyDown { key } => {
                let (modifiers, key) = parse_key_chord(key);
                self.key_event(DispatchKeyEventType::KeyDown, &key, modifiers)
                    .await
            }
            InputAction::KeyUp { key } => {
                let (modifiers, key) = parse_key_chord(key);
                self.key_event(DispatchKeyEventType::KeyUp, &key, modifiers)
                    .await
            }
            // Scroll coordinates are CSS pixels in the page viewport, the
            // native space of window.scrollTo/scrollBy.
            InputAction::Scroll { x, y } => {
                self.eval(format!("window.scrollTo({x}, {y})")).await
            }
            InputAction::ScrollBy { x, y } => {
                self.eval(format!("window.scrollBy({x}, {y})")).await
            }
            InputAction::Hover { text } => {
                let found: bool = self
                    .page
                    .evaluate(hover_script(text))
                    .await
                    .map_err(|e| DriverError::Input(e.to_string()))?
                    .into_value()
                    .map_err(|e| DriverError::Input(e.to_string()))?;
                if found {
                    Ok(())
                } else {
                    Err(DriverError::Input(format!(
                        "no element with text matching {text:?}"
                    )))
                }
            }
            InputAction::Reload => {
                self.page
                    .execute(ReloadParams::default())
                    .await
                    .map_err(|e| DriverError::Navigation(e.to_string()))?;
                Ok(())
            }
            InputAction::GoBack => self.eval("history.back()".to_string()).await,
            InputAction::GoForward => self.eval("history.forward()".to_string()).await,
        }
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!("browser close: {e}");
        }
        let _ = browser.wait().await;
        self.handler.abort();
    }
}

impl Drop for CdpPage {
    fn drop(&mut self) {
        // Last resort when close() was never awaited; the Browser's own Drop
        // kills the child process.
        self.handler.abort();
    }
}

fn cdp_button(button: PointerButton) -> MouseButton {
    match button {
        PointerButton::Left => MouseButton::Left,
        PointerButton::Right => MouseButton::Right,
        PointerButton::Middle => MouseButton::Middle,
    }
}

/// Split `Ctrl+Shift+K` into the CDP modifier bitmask and the final key.
/// A spec without `+` is a bare key. Unrecognised modifier names are ignored.
fn parse_key_chord(spec: &str) -> (i64, String) {
    let parts: Vec<&str> = spec.split('+').collect();
    if parts.len() < 2 {
        return (0, spec.to_string());
    }

    let mut modifiers = 0;
    for part in &parts[..parts.len() - 1] {
        match part.to_ascii_lowercase().as_str() {
            "alt" => modifiers |= MOD_ALT,
            "ctrl" | "control" => modifiers |= MOD_CTRL,
            "meta" | "cmd" | "command" => modifiers |= MOD_META,
            "shift" => modifiers |= MOD_SHIFT,
            _ => {}
        }
    }
    (modifiers, parts[parts.len() - 1].to_string())
}

/// Find the first element whose text contains the needle, scroll it into
/// view, and dispatch mouseover/mouseenter.
fn hover_script(needle: &str) -> String {
    // JSON string literals are valid JS string literals
    let quoted = serde_json::to_string(needle).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
    const needle = {quoted};
    for (const el of document.querySelectorAll('body *')) {{
        const text = (el.textContent || '').trim();
        if (text && text.includes(needle)) {{
            el.scrollIntoView({{block: 'center', inline: 'center'}});
            el.dispatchEvent(new MouseEvent('mouseover', {{bubbles: true}}));
            el.dispatchEvent(new MouseEvent('mouseenter', {{bubbles: false}}));
            return true;
        }}
    }}
    return false;
}})()"#
    )
}
