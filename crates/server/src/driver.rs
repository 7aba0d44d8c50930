//! The browser-control seam.
//!
//! The pool, stream engine, and router never talk to an automation library
//! directly; they see a [`BrowserDriver`] that opens [`PageHandle`]s. The
//! production implementation lives in [`crate::cdp`]; tests substitute a
//! scripted driver so the whole core runs without a Chrome binary.
//!
//! Trait methods return `impl Future + Send` so driver calls can be awaited
//! inside spawned per-client tasks regardless of the concrete driver.

use periscope_protocol::{ImageFormat, InputAction};

/// Launches browser instances.
pub trait BrowserDriver: Send + Sync + 'static {
    type Page: PageHandle;

    /// Launch a dedicated browser showing `url` at the given viewport.
    fn open(
        &self,
        url: &str,
        width: u32,
        height: u32,
    ) -> impl Future<Output = Result<Self::Page, DriverError>> + Send;
}

/// One live browser page. All operations are callable through a shared
/// reference; implementations serialise internally where the underlying
/// protocol requires it.
pub trait PageHandle: Send + Sync + 'static {
    /// Navigate, waiting only for the document to be ready, not full load.
    fn goto(&self, url: &str) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn current_url(&self) -> impl Future<Output = Result<String, DriverError>> + Send;

    /// Rasterise the current viewport.
    fn screenshot(
        &self,
        opts: SnapshotOptions,
    ) -> impl Future<Output = Result<Vec<u8>, DriverError>> + Send;

    fn set_viewport(
        &self,
        width: u32,
        height: u32,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Replay one input action into the page.
    fn input(&self, action: &InputAction) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Tear the browser down. Idempotent; never fails into the caller.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Options for a single screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub format: ImageFormat,
    /// 1-100; only meaningful for jpeg.
    pub quality: u32,
    pub full_page: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("screenshot capture failed: {0}")]
    Capture(String),
    #[error("input dispatch failed: {0}")]
    Input(String),
    #[error("browser connection closed")]
    Closed,
}
