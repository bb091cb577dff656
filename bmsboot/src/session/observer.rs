//! Notifications for the embedding application.
//!
//! The session controller never depends on a concrete UI type. It reports
//! through an [`Observer`], either a custom implementation or the
//! closure-based [`Callbacks`].

use std::path::Path;

/// Receiver of session notifications. All hooks default to no-ops.
///
/// Hooks are called from the caller's thread for setters and from the
/// worker thread during workflows, never while session state is locked.
pub trait Observer: Send + Sync {
    /// Free-text console line.
    fn log_line(&self, _line: &str) {}

    /// The firmware path changed.
    fn firmware_path_changed(&self, _path: &Path) {}

    /// The list of available serial ports changed.
    fn port_list_changed(&self, _ports: &[String]) {}

    /// The user-code address changed.
    fn user_code_address_changed(&self, _address: u32) {}

    /// Progress of the running transfer, 0..=100.
    fn progress_changed(&self, _percent: u8) {}

    /// A workflow started or finished.
    fn busy_changed(&self, _busy: bool) {}
}

type Hook<T> = Option<Box<dyn Fn(T) + Send + Sync>>;

/// Closure-based [`Observer`].
///
/// ```
/// use bmsboot::session::Callbacks;
///
/// let callbacks = Callbacks::default()
///     .on_log(|line| println!("{line}"))
///     .on_progress(|percent| println!("{percent}%"));
/// # let _ = callbacks;
/// ```
#[derive(Default)]
pub struct Callbacks {
    log: Option<Box<dyn Fn(&str) + Send + Sync>>,
    firmware_path: Option<Box<dyn Fn(&Path) + Send + Sync>>,
    port_list: Option<Box<dyn Fn(&[String]) + Send + Sync>>,
    user_code_address: Hook<u32>,
    progress: Hook<u8>,
    busy: Hook<bool>,
}

impl Callbacks {
    /// Called for every console line.
    #[must_use]
    pub fn on_log(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log = Some(Box::new(f));
        self
    }

    /// Called when the firmware path changes.
    #[must_use]
    pub fn on_firmware_path(mut self, f: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.firmware_path = Some(Box::new(f));
        self
    }

    /// Called when the port list changes.
    #[must_use]
    pub fn on_port_list(mut self, f: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.port_list = Some(Box::new(f));
        self
    }

    /// Called when the user-code address changes.
    #[must_use]
    pub fn on_user_code_address(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.user_code_address = Some(Box::new(f));
        self
    }

    /// Called when the progress percentage changes.
    #[must_use]
    pub fn on_progress(mut self, f: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Called when a workflow starts or finishes.
    #[must_use]
    pub fn on_busy(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.busy = Some(Box::new(f));
        self
    }
}

impl Observer for Callbacks {
    fn log_line(&self, line: &str) {
        if let Some(f) = &self.log {
            f(line);
        }
    }

    fn firmware_path_changed(&self, path: &Path) {
        if let Some(f) = &self.firmware_path {
            f(path);
        }
    }

    fn port_list_changed(&self, ports: &[String]) {
        if let Some(f) = &self.port_list {
            f(ports);
        }
    }

    fn user_code_address_changed(&self, address: u32) {
        if let Some(f) = &self.user_code_address {
            f(address);
        }
    }

    fn progress_changed(&self, percent: u8) {
        if let Some(f) = &self.progress {
            f(percent);
        }
    }

    fn busy_changed(&self, busy: bool) {
        if let Some(f) = &self.busy {
            f(busy);
        }
    }
}
