//! Scripted browser driver for tests. No Chrome involved: pages record what
//! was done to them and return deterministic raster bytes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use periscope_protocol::InputAction;

use crate::driver::{BrowserDriver, DriverError, PageHandle, SnapshotOptions};

/// Observable record of one fake page, shared between the page handle and
/// the test.
#[derive(Default)]
pub struct PageRecord {
    url: Mutex<String>,
    viewport: Mutex<(u32, u32)>,
    actions: Mutex<Vec<InputAction>>,
    close_calls: AtomicUsize,
    screenshot_calls: AtomicUsize,
    fail_screenshots: AtomicBool,
}

impl PageRecord {
    pub fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    pub fn viewport(&self) -> (u32, u32) {
        *self.viewport.lock().unwrap()
    }

    pub fn actions(&self) -> Vec<InputAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn screenshot_count(&self) -> usize {
        self.screenshot_calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent screenshot fail.
    pub fn fail_screenshots(&self) {
        self.fail_screenshots.store(true, Ordering::SeqCst);
    }
}

pub struct FakePage {
    record: Arc<PageRecord>,
}

impl PageHandle for FakePage {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        *self.record.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.record.url())
    }

    async fn screenshot(&self, opts: SnapshotOptions) -> Result<Vec<u8>, DriverError> {
        self.record.screenshot_calls.fetch_add(1, Ordering::SeqCst);
        if self.record.fail_screenshots.load(Ordering::SeqCst) {
            return Err(DriverError::Capture("scripted capture failure".to_string()));
        }
        Ok(format!("raster:{}:q{}", self.record.url(), opts.quality).into_bytes())
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), DriverError> {
        *self.record.viewport.lock().unwrap() = (width, height);
        Ok(())
    }

    async fn input(&self, action: &InputAction) -> Result<(), DriverError> {
        self.record.actions.lock().unwrap().push(action.clone());
        Ok(())
    }

    async fn close(&self) {
        self.record.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Driver that hands out [`FakePage`]s and keeps every page's record for
/// later inspection, in open order.
#[derive(Default)]
pub struct FakeDriver {
    records: Arc<Mutex<Vec<Arc<PageRecord>>>>,
    fail_next_open: AtomicBool,
}

impl FakeDriver {
    /// Shared view of all pages this driver has opened.
    pub fn records(&self) -> Arc<Mutex<Vec<Arc<PageRecord>>>> {
        Arc::clone(&self.records)
    }

    /// Make the next open fail once.
    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }
}

impl BrowserDriver for FakeDriver {
    type Page = FakePage;

    async fn open(&self, url: &str, width: u32, height: u32) -> Result<FakePage, DriverError> {
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(DriverError::Launch("scripted launch failure".to_string()));
        }
        let record = Arc::new(PageRecord::default());
        *record.url.lock().unwrap() = url.to_string();
        *record.viewport.lock().unwrap() = (width, height);
        self.records.lock().unwrap().push(Arc::clone(&record));
        Ok(FakePage { record })
    }
}
