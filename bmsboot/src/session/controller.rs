//! Single-flight workflow controller.
//!
//! Workflows are queued to one worker thread. A coordinator thread receives
//! each completion, clears the busy flag and hands the result to the
//! [`WorkflowHandle`]. Callers never block on serial I/O unless they wait on
//! a handle.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use super::observer::Observer;
use super::settings::{PageSize, Settings, parse_user_code_address};
use super::workflow::{Session, Workflow, WorkflowOutcome};
use super::{SessionPhase, SessionState};
use crate::bootloader::{Bootloader, ProtocolConfig};
use crate::error::{Error, Result};
use crate::host;
use crate::memory::CancelToken;
use crate::port::{Connector, SerialConfig};
use crate::transport::Transport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the caller, the worker and the coordinator.
pub(super) struct Shared {
    state: Mutex<SessionState>,
    observer: Arc<dyn Observer>,
    cancel: CancelToken,
}

impl Shared {
    pub(super) fn log(&self, line: &str) {
        debug!("{line}");
        self.observer.log_line(line);
    }

    pub(super) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(super) fn set_progress(&self, percent: u8) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.progress_percent != percent;
            state.progress_percent = percent;
            changed
        };
        if changed {
            self.observer.progress_changed(percent);
        }
    }

    pub(super) fn set_phase(&self, phase: SessionPhase) {
        lock(&self.state).phase = phase;
    }

    fn settings(&self) -> Settings {
        lock(&self.state).settings.clone()
    }

    fn is_busy(&self) -> bool {
        lock(&self.state).busy
    }

    /// Claim the worker. Fails if a workflow is in flight.
    fn begin(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.busy {
                return Err(Error::Busy);
            }
            state.busy = true;
        }
        self.observer.busy_changed(true);
        Ok(())
    }

    fn finish(&self) {
        {
            let mut state = lock(&self.state);
            state.busy = false;
            state.phase = SessionPhase::Idle;
        }
        self.observer.busy_changed(false);
    }

    /// Apply `update` to the settings and report whether anything changed.
    fn update_settings(&self, update: impl FnOnce(&mut Settings)) -> bool {
        let mut state = lock(&self.state);
        let before = state.settings.clone();
        update(&mut state.settings);
        state.settings != before
    }

    fn set_ports(&self, ports: Vec<String>) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.ports != ports;
            state.ports.clone_from(&ports);
            changed
        };
        if changed {
            self.observer.port_list_changed(&ports);
        }
    }
}

struct Job {
    workflow: Workflow,
    reply: Sender<Result<WorkflowOutcome>>,
}

struct Completion {
    result: Result<WorkflowOutcome>,
    reply: Sender<Result<WorkflowOutcome>>,
}

/// Pending result of a submitted workflow.
#[derive(Debug)]
pub struct WorkflowHandle {
    rx: Receiver<Result<WorkflowOutcome>>,
}

fn worker_gone() -> Error {
    Error::Io(std::io::Error::other("session worker stopped"))
}

impl WorkflowHandle {
    /// Block until the workflow finishes. The busy flag is already clear
    /// when this returns.
    pub fn wait(self) -> Result<WorkflowOutcome> {
        self.rx.recv().map_err(|_| worker_gone())?
    }

    /// The result if the workflow has finished.
    pub fn try_wait(&self) -> Option<Result<WorkflowOutcome>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(worker_gone())),
        }
    }
}

/// Device session controller.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use bmsboot::session::{Callbacks, Controller, Settings};
/// use bmsboot::{NativeConnector, ProtocolConfig};
///
/// # fn main() -> bmsboot::Result<()> {
/// let observer = Callbacks::default().on_log(|line| println!("{line}"));
/// let controller = Controller::new(
///     Settings::default(),
///     ProtocolConfig::default(),
///     Arc::new(NativeConnector),
///     Arc::new(observer),
/// )?;
///
/// controller.select_port("/dev/ttyUSB0")?;
/// let status = controller.start_detect()?.wait()?;
/// println!("{status:?}");
/// # Ok(())
/// # }
/// ```
pub struct Controller {
    shared: Arc<Shared>,
    bootloader: Arc<Mutex<Bootloader>>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    coordinator: Option<JoinHandle<()>>,
}

impl Controller {
    /// Start a controller with default serial parameters.
    pub fn new(
        settings: Settings,
        protocol: ProtocolConfig,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        Self::with_serial_config(
            settings,
            SerialConfig::default(),
            protocol,
            connector,
            observer,
        )
    }

    /// Start a controller.
    ///
    /// The initial user-code address and port list are reported to the
    /// observer before this returns.
    pub fn with_serial_config(
        settings: Settings,
        serial: SerialConfig,
        protocol: ProtocolConfig,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        let ports: Vec<String> = connector
            .list_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.name)
            .collect();

        let address = settings.user_code_address;
        let firmware = settings.firmware_path.clone();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                settings,
                ports: ports.clone(),
                ..SessionState::default()
            }),
            observer,
            cancel: CancelToken::new(),
        });
        let bootloader = Arc::new(Mutex::new(Bootloader::new(
            Transport::new(connector, serial),
            protocol,
        )));

        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let (done_tx, done_rx) = mpsc::channel::<Completion>();

        let worker = {
            let shared = Arc::clone(&shared);
            let bootloader = Arc::clone(&bootloader);
            thread::Builder::new()
                .name("bmsboot-worker".into())
                .spawn(move || run_worker(&shared, &bootloader, &jobs_rx, &done_tx))?
        };
        let coordinator = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("bmsboot-coordinator".into())
                .spawn(move || run_coordinator(&shared, &done_rx))?
        };

        shared.observer.user_code_address_changed(address);
        shared.observer.port_list_changed(&ports);
        if let Some(path) = firmware {
            shared.observer.firmware_path_changed(&path);
        }

        Ok(Self {
            shared,
            bootloader,
            jobs: Some(jobs_tx),
            worker: Some(worker),
            coordinator: Some(coordinator),
        })
    }

    /// Current state.
    pub fn snapshot(&self) -> SessionState {
        lock(&self.shared.state).clone()
    }

    /// Current settings.
    pub fn settings(&self) -> Settings {
        self.shared.settings()
    }

    /// Whether a workflow is in flight.
    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    /// Ask the running transfer to stop before its next chunk.
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.shared.cancel.cancel();
    }

    /// The engine, if no workflow holds it. Never waits for the worker.
    fn idle_bootloader(&self) -> Result<MutexGuard<'_, Bootloader>> {
        if self.shared.is_busy() {
            return Err(Error::Busy);
        }
        match self.bootloader.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(Error::Busy),
        }
    }

    /// Select the firmware image to program.
    pub fn select_firmware_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.shared.update_settings(|s| s.firmware_path = Some(path.clone())) {
            self.shared.observer.firmware_path_changed(&path);
        }
    }

    /// Select the serial port. A port opened under another name is closed.
    pub fn select_port(&self, name: &str) -> Result<()> {
        let previous = self.shared.settings().port;
        if previous.as_deref() == Some(name) {
            return Ok(());
        }
        self.close_port()?;
        self.shared.update_settings(|s| s.port = Some(name.to_string()));
        Ok(())
    }

    /// Open the selected port outside of a workflow.
    pub fn open_port(&self) -> Result<()> {
        let mut bl = self.idle_bootloader()?;
        let Some(name) = self.shared.settings().port else {
            self.shared.log("Serial port is not selected");
            return Ok(());
        };
        if bl.is_open() {
            self.shared.log(&format!("Serial port {name} is already opened"));
            return Ok(());
        }
        match bl.open(&name) {
            Ok(()) => {
                self.shared.log(&format!("Serial port {name} opened"));
                Ok(())
            },
            Err(e) => {
                self.shared.log(&format!("Error: {e}"));
                Err(e)
            },
        }
    }

    /// Close the port if open.
    pub fn close_port(&self) -> Result<()> {
        let mut bl = self.idle_bootloader()?;
        if !bl.is_open() {
            return Ok(());
        }
        let name = bl.transport().port_name().unwrap_or_default().to_string();
        bl.close()?;
        self.shared.log(&format!("Serial port {name} closed"));
        Ok(())
    }

    /// Try every candidate port name and publish the ones that open.
    pub fn detect_ports(&self) -> Result<Vec<String>> {
        let bl = self.idle_bootloader()?;
        let transport = bl.transport();
        let connector = Arc::clone(transport.connector());
        let candidates = host::default_candidates(connector.as_ref());
        let ports = host::scan_ports(
            connector.as_ref(),
            transport.config(),
            candidates,
            transport.port_name(),
        );
        drop(bl);

        info!("Found {} serial port(s)", ports.len());
        self.shared.set_ports(ports.clone());
        Ok(ports)
    }

    /// Set the erase page size from its decimal text ("128", "256", "2048").
    pub fn set_page_size(&self, size: &str) -> Result<()> {
        let size: PageSize = size.parse()?;
        self.shared.update_settings(|s| s.page_size = size);
        Ok(())
    }

    /// Erase the whole flash instead of the covered pages.
    pub fn set_global_erase(&self, enabled: bool) {
        self.shared.update_settings(|s| s.global_erase = enabled);
    }

    /// Set the user-code address from hex text. Returns the address after
    /// alignment and clamping.
    pub fn set_user_code_address(&self, text: &str) -> Result<u32> {
        let address = parse_user_code_address(text)?;
        if self.shared.update_settings(|s| s.user_code_address = address) {
            self.shared.observer.user_code_address_changed(address);
        }
        Ok(address)
    }

    /// Read the image back after programming.
    pub fn set_verify(&self, enabled: bool) {
        self.shared.update_settings(|s| s.verify = enabled);
    }

    /// Write the validation marker around programming and erasing.
    pub fn set_mark_valid(&self, enabled: bool) {
        self.shared.update_settings(|s| s.mark_valid = enabled);
    }

    /// Bytes fetched by [`start_read`](Self::start_read).
    pub fn set_read_length(&self, length: usize) {
        self.shared.update_settings(|s| s.read_length = length);
    }

    /// Submit a workflow. Fails with [`Error::Busy`] while another runs.
    pub fn start(&self, workflow: Workflow) -> Result<WorkflowHandle> {
        let jobs = self.jobs.as_ref().ok_or_else(worker_gone)?;
        self.shared.begin()?;
        self.shared.cancel.reset();
        self.shared.set_progress(0);

        let (reply, rx) = mpsc::channel();
        if jobs.send(Job { workflow, reply }).is_err() {
            self.shared.finish();
            return Err(worker_gone());
        }
        Ok(WorkflowHandle { rx })
    }

    /// Detect the device mode.
    pub fn start_detect(&self) -> Result<WorkflowHandle> {
        self.start(Workflow::Detect)
    }

    /// Switch between application and bootloader.
    pub fn start_switch(&self) -> Result<WorkflowHandle> {
        self.start(Workflow::Switch)
    }

    /// Program the selected firmware.
    pub fn start_write(&self) -> Result<WorkflowHandle> {
        self.start(Workflow::Write)
    }

    /// Erase the flash.
    pub fn start_erase(&self) -> Result<WorkflowHandle> {
        self.start(Workflow::Erase)
    }

    /// Save flash contents to `output`.
    pub fn start_read(&self, output: impl Into<PathBuf>) -> Result<WorkflowHandle> {
        self.start(Workflow::Read {
            output: output.into(),
        })
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.join();
        }
    }
}

fn run_worker(
    shared: &Shared,
    bootloader: &Mutex<Bootloader>,
    jobs: &Receiver<Job>,
    done: &Sender<Completion>,
) {
    for job in jobs {
        let result = {
            let mut bl = lock(bootloader);
            let settings = shared.settings();
            debug!("Running {:?}", job.workflow);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let result = Session::new(&mut bl, shared, settings).run(job.workflow);
                if let Err(e) = &result {
                    shared.log(&format!("Error: {e}"));
                }
                result
            }))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!("Workflow panicked: {message}");
                Err(Error::WorkflowPanicked(message))
            });
            if let Err(e) = bl.close() {
                debug!("Close after workflow failed: {e}");
            }
            result
        };

        let completion = Completion {
            result,
            reply: job.reply,
        };
        if done.send(completion).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_coordinator(shared: &Shared, done: &Receiver<Completion>) {
    for completion in done {
        // The busy flag is cleared before the observer hook runs
        if panic::catch_unwind(AssertUnwindSafe(|| shared.finish())).is_err() {
            error!("Observer panicked while the workflow finished");
        }
        let _ = completion.reply.send(completion.result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{INVALID_MARKER_ADDRESS, VALID_MARKER_ADDRESS};
    use crate::port::mock::{MockConnector, MockPort};
    use crate::protocol::command::{CommandCode, EraseMode, Generation};
    use crate::session::{Callbacks, DeviceStatus, USER_CODE_BASE};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    const GET_REPLY: [u8; 11] = [
        0x79, 0x08, 0x31, 0x00, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73,
    ];
    const GET_ID_REPLY: [u8; 4] = [0x79, 0x01, 0x04, 0x10];

    #[derive(Default)]
    struct Recorded {
        lines: Vec<String>,
        progress: Vec<u8>,
        busy: Vec<bool>,
        addresses: Vec<u32>,
        ports: Vec<Vec<String>>,
    }

    fn recorder() -> (Arc<Mutex<Recorded>>, Callbacks) {
        let rec = Arc::new(Mutex::new(Recorded::default()));
        let (a, b, c, d, e) = (
            Arc::clone(&rec),
            Arc::clone(&rec),
            Arc::clone(&rec),
            Arc::clone(&rec),
            Arc::clone(&rec),
        );
        let callbacks = Callbacks::default()
            .on_log(move |l| a.lock().unwrap().lines.push(l.to_string()))
            .on_progress(move |p| b.lock().unwrap().progress.push(p))
            .on_busy(move |v| c.lock().unwrap().busy.push(v))
            .on_user_code_address(move |v| d.lock().unwrap().addresses.push(v))
            .on_port_list(move |p| e.lock().unwrap().ports.push(p.to_vec()));
        (rec, callbacks)
    }

    fn fast_protocol() -> ProtocolConfig {
        ProtocolConfig {
            wake_delay: Duration::ZERO,
            bootloader_start_delay: Duration::ZERO,
            app_start_delay: Duration::ZERO,
            ..ProtocolConfig::default()
        }
    }

    fn controller_with(
        script: &[u8],
        protocol: ProtocolConfig,
        observer: Arc<dyn Observer>,
    ) -> (Controller, MockPort) {
        let _ = env_logger::builder().is_test(true).try_init();
        let port = MockPort::new(script);
        let connector = MockConnector::new(port.clone()).with_available(&["COM3"]);
        let settings = Settings {
            port: Some("COM3".into()),
            ..Settings::default()
        };
        let ctl = Controller::new(settings, protocol, Arc::new(connector), observer).unwrap();
        (ctl, port)
    }

    fn controller(script: &[u8]) -> (Controller, MockPort, Arc<Mutex<Recorded>>) {
        let (rec, callbacks) = recorder();
        let (ctl, port) = controller_with(script, fast_protocol(), Arc::new(callbacks));
        (ctl, port, rec)
    }

    /// Replies for authorization followed by a fresh GET and GET_ID.
    fn authorize_and_connect_script() -> Vec<u8> {
        let mut script = vec![0x79];
        script.extend_from_slice(&[0; 8]);
        script.push(0x79);
        script.extend_from_slice(&GET_REPLY);
        script.extend_from_slice(&GET_ID_REPLY);
        script
    }

    fn acks(n: usize) -> Vec<u8> {
        vec![0x79; n]
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn address_frame(address: u32) -> Vec<u8> {
        Generation::Crc16.frame(&address.to_be_bytes())
    }

    fn firmware(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &vec![0xA5; len]).unwrap();
        file
    }

    fn line_index(rec: &Recorded, line: &str) -> usize {
        rec.lines
            .iter()
            .position(|l| l == line)
            .unwrap_or_else(|| panic!("missing {line}"))
    }

    fn bootloader_detect_script() -> Vec<u8> {
        let mut script = vec![0x1F];
        script.extend_from_slice(&GET_REPLY);
        script.extend_from_slice(&GET_ID_REPLY);
        script
    }

    #[test]
    fn test_initial_notifications() {
        let (_ctl, _port, rec) = controller(&[]);
        let rec = rec.lock().unwrap();
        assert_eq!(rec.addresses, vec![USER_CODE_BASE]);
        assert_eq!(rec.ports, vec![vec!["COM3".to_string()]]);
    }

    #[test]
    fn test_user_code_address_setter() {
        let (ctl, _port, rec) = controller(&[]);
        assert_eq!(ctl.set_user_code_address("8000123").unwrap(), 0x0800_0100);
        // Same value after masking: no second notification
        assert_eq!(ctl.set_user_code_address("80001FF").unwrap(), 0x0800_0100);
        assert_eq!(ctl.set_user_code_address("100").unwrap(), USER_CODE_BASE);
        assert!(ctl.set_user_code_address("xyz").is_err());

        assert_eq!(
            rec.lock().unwrap().addresses,
            vec![USER_CODE_BASE, 0x0800_0100, USER_CODE_BASE]
        );
        assert_eq!(ctl.settings().user_code_address, USER_CODE_BASE);
    }

    #[test]
    fn test_page_size_setter() {
        let (ctl, _port, _rec) = controller(&[]);
        ctl.set_page_size("2048").unwrap();
        assert_eq!(ctl.settings().page_size, PageSize::B2048);
        assert!(matches!(ctl.set_page_size("100"), Err(Error::Config(_))));
        assert_eq!(ctl.settings().page_size, PageSize::B2048);
    }

    #[test]
    fn test_detect_application() {
        let (ctl, port, rec) = controller(&[0xE2, 0xE2]);
        let outcome = ctl.start_detect().unwrap().wait().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Detected(DeviceStatus::Application));

        let written = port.written();
        assert_eq!(written[0], 0x00);
        assert_eq!(&written[1..5], &[0xAA, 0xAA, 0xAA, 0x08]);
        assert_eq!(written[5], 0x01);
        assert_eq!(written[9], 0x00);
        assert_eq!(written[14], 0x02);

        assert!(!ctl.is_busy());
        let rec = rec.lock().unwrap();
        assert!(
            rec.lines
                .contains(&"Detected device in application mode!".to_string())
        );
        assert_eq!(rec.busy, vec![true, false]);
    }

    #[test]
    fn test_detect_bootloader() {
        let (ctl, port, rec) = controller(&bootloader_detect_script());
        let outcome = ctl.start_detect().unwrap().wait().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Detected(DeviceStatus::Bootloader));
        assert_eq!(port.pending(), 0);
        assert!(
            rec.lock()
                .unwrap()
                .lines
                .contains(&"Detected device in bootloader mode!".to_string())
        );
    }

    #[test]
    fn test_detect_nothing() {
        let (ctl, port, rec) = controller(&[]);
        let outcome = ctl.start_detect().unwrap().wait().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Detected(DeviceStatus::Unknown));
        assert!(rec.lock().unwrap().lines.contains(&"No device detected!".to_string()));
        // Every open is matched by a close
        let state = port.state();
        assert_eq!(state.opens, state.closes);
    }

    #[test]
    fn test_failed_workflow_logs_closes_and_frees_worker() {
        let (ctl, port, rec) = controller(&[]);
        let err = ctl.start_erase().unwrap().wait().unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
        assert!(!ctl.is_busy());
        assert!(
            rec.lock()
                .unwrap()
                .lines
                .contains(&"Error: No device detected".to_string())
        );
        {
            let state = port.state();
            assert_eq!(state.opens, state.closes);
        }

        // Worker accepts the next workflow
        port.push(&[0xE2, 0xE2]);
        let outcome = ctl.start_detect().unwrap().wait().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Detected(DeviceStatus::Application));
    }

    #[test]
    fn test_busy_rejects_second_workflow() {
        let (ctl, _port, _rec) = controller(&[0xE2, 0xE2]);
        let guard = lock(&ctl.bootloader);
        let handle = ctl.start_detect().unwrap();
        assert!(ctl.is_busy());
        assert!(matches!(ctl.start_erase(), Err(Error::Busy)));
        assert!(matches!(ctl.open_port(), Err(Error::Busy)));
        drop(guard);

        handle.wait().unwrap();
        assert!(!ctl.is_busy());
    }

    #[test]
    fn test_write_workflow() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &[0xA5; 300]).unwrap();

        let mut script = bootloader_detect_script();
        // Authorization: ACK, challenge, ACK
        script.push(0x79);
        script.extend_from_slice(&[0; 8]);
        script.push(0x79);
        script.extend_from_slice(&GET_REPLY);
        script.extend_from_slice(&GET_ID_REPLY);
        // Invalidate, two page erases, two data chunks, validate
        script.extend(std::iter::repeat_n(0x79, 3 + 2 * 2 + 2 * 3 + 3));

        let (ctl, port, rec) = controller(&script);
        ctl.select_firmware_path(file.path());
        let outcome = ctl.start_write().unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Written { bytes: 300 });
        assert_eq!(port.pending(), 0);
        assert!(!ctl.is_busy());

        let rec = rec.lock().unwrap();
        for line in [
            "Detected device in bootloader mode!",
            "Authorization passed!",
            "Connected: Ver: 3.1, PID: 0x0410",
            "Erasing...",
            "Programming...",
            "Success: 300 bytes written",
        ] {
            assert!(rec.lines.contains(&line.to_string()), "missing {line}");
        }
        assert_eq!(rec.progress.last(), Some(&100));
    }

    #[test]
    fn test_write_rejects_oversized_image_before_touching_port() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &vec![0; 0x10000]).unwrap();

        let (ctl, port, rec) = controller(&[]);
        ctl.select_firmware_path(file.path());
        let err = ctl.start_write().unwrap().wait().unwrap_err();

        assert!(matches!(err, Error::FirmwareTooLarge { .. }));
        assert_eq!(port.state().opens, 0);
        assert!(rec.lock().unwrap().lines[0].starts_with("Error: Firmware file is too big"));
    }

    #[test]
    fn test_read_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("dump.bin");

        let mut script = bootloader_detect_script();
        script.extend_from_slice(&GET_REPLY);
        script.extend_from_slice(&GET_ID_REPLY);
        script.extend_from_slice(&[0x79, 0x79, 0x79, 1, 2, 3, 4]);

        let (ctl, _port, rec) = controller(&script);
        ctl.set_read_length(4);
        let outcome = ctl.start_read(&output).unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Read { bytes: 4 });
        assert_eq!(std::fs::read(&output).unwrap(), vec![1, 2, 3, 4]);
        assert!(rec.lock().unwrap().lines.contains(&"4 bytes read".to_string()));
    }

    #[test]
    fn test_switch_from_bootloader_jumps_to_user_code() {
        let mut script = bootloader_detect_script();
        script.extend_from_slice(&[0x79, 0x79]);

        let (ctl, port, _rec) = controller(&script);
        ctl.set_user_code_address("08004000").unwrap();
        let outcome = ctl.start_switch().unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Switched(DeviceStatus::Application));
        let written = port.written();
        // GO frame followed by the address and its checksum
        let tail = &written[written.len() - 9..];
        assert_eq!(&tail[..3], &[0x21, 0x18, 0xC0]);
        assert_eq!(&tail[3..7], &[0x08, 0x00, 0x40, 0x00]);
    }

    #[test]
    fn test_switch_from_application() {
        let (ctl, _port, rec) = controller(&[0xE2, 0xE2, 0xE2, 0xE2]);
        let outcome = ctl.start_switch().unwrap().wait().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Switched(DeviceStatus::Bootloader));
        assert!(
            rec.lock()
                .unwrap()
                .lines
                .contains(&"Jump to bootloader success!".to_string())
        );
    }

    #[test]
    fn test_open_and_close_port_messages() {
        let (ctl, port, rec) = controller(&[]);
        ctl.open_port().unwrap();
        ctl.open_port().unwrap();
        ctl.close_port().unwrap();
        ctl.close_port().unwrap();

        assert_eq!(port.state().opens, 1);
        assert_eq!(
            rec.lock().unwrap().lines,
            vec![
                "Serial port COM3 opened",
                "Serial port COM3 is already opened",
                "Serial port COM3 closed",
            ]
        );
    }

    #[test]
    fn test_open_without_port() {
        let (ctl, _port, rec) = controller(&[]);
        lock(&ctl.shared.state).settings.port = None;
        ctl.open_port().unwrap();
        assert_eq!(rec.lock().unwrap().lines, vec!["Serial port is not selected"]);
    }

    #[test]
    fn test_detect_ports_publishes_changes_only() {
        let (ctl, _port, rec) = controller(&[]);
        assert_eq!(ctl.detect_ports().unwrap(), vec!["COM3".to_string()]);
        // Same list as the initial enumeration
        assert_eq!(rec.lock().unwrap().ports.len(), 1);
    }

    #[test]
    fn test_cancel_token_reset_on_start() {
        let (ctl, _port, _rec) = controller(&[0xE2, 0xE2]);
        ctl.cancel();
        let outcome = ctl.start_detect().unwrap().wait().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Detected(DeviceStatus::Application));
        assert!(!ctl.shared.cancel.is_cancelled());
    }

    #[test]
    fn test_panicking_observer_does_not_leave_controller_busy() {
        let armed = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&armed);
        let callbacks = Callbacks::default().on_log(move |_| {
            assert!(!flag.load(Ordering::SeqCst), "observer failure");
        });
        let (ctl, port) = controller_with(&[], fast_protocol(), Arc::new(callbacks));

        let err = ctl.start_detect().unwrap().wait().unwrap_err();
        assert!(matches!(err, Error::WorkflowPanicked(ref m) if m.contains("observer failure")));
        assert!(!ctl.is_busy());
        {
            let state = port.state();
            assert_eq!(state.opens, state.closes);
        }

        armed.store(false, Ordering::SeqCst);
        port.push(&[0xE2, 0xE2]);
        let outcome = ctl.start_detect().unwrap().wait().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Detected(DeviceStatus::Application));
    }

    #[test]
    fn test_port_calls_do_not_wait_for_held_engine() {
        let (ctl, _port, _rec) = controller(&[]);
        let _guard = lock(&ctl.bootloader);
        assert!(!ctl.is_busy());
        assert!(matches!(ctl.open_port(), Err(Error::Busy)));
        assert!(matches!(ctl.close_port(), Err(Error::Busy)));
    }

    #[test]
    fn test_detect_unopenable_port_reports_no_device() {
        let (ctl, port, rec) = controller(&[]);
        ctl.select_port("COM9").unwrap();
        let outcome = ctl.start_detect().unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Detected(DeviceStatus::Unknown));
        assert_eq!(port.state().opens, 0);
        assert!(rec.lock().unwrap().lines.contains(&"No device detected!".to_string()));
    }

    #[test]
    fn test_write_from_application_jumps_before_authorizing() {
        let file = firmware(300);
        // Detect (enable, disable), then jump (enable, jump)
        let mut script = vec![0xE2; 4];
        script.extend(authorize_and_connect_script());
        script.extend(acks(3 + 2 * 2 + 2 * 3 + 3));

        let (ctl, port, rec) = controller(&script);
        ctl.select_firmware_path(file.path());
        let outcome = ctl.start_write().unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Written { bytes: 300 });
        assert_eq!(port.pending(), 0);
        let rec = rec.lock().unwrap();
        assert!(
            line_index(&rec, "Jump to bootloader success!")
                < line_index(&rec, "Authorization passed!")
        );
        assert!(line_index(&rec, "Authorization passed!") < line_index(&rec, "Erasing..."));
    }

    #[test]
    fn test_erase_from_application() {
        let mut script = vec![0xE2; 4];
        script.extend(authorize_and_connect_script());
        // Invalidate, global erase
        script.extend(acks(3 + 2));

        let (ctl, port, rec) = controller(&script);
        let outcome = ctl.start_erase().unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Erased);
        assert_eq!(port.pending(), 0);
        assert!(contains(
            &port.written(),
            &Generation::Crc16.frame(&[EraseMode::Global as u8])
        ));
        let rec = rec.lock().unwrap();
        assert!(line_index(&rec, "Jump to bootloader success!") < line_index(&rec, "Erase complete"));
    }

    #[test]
    fn test_write_with_verify_reads_image_back() {
        let file = firmware(300);
        let mut script = bootloader_detect_script();
        script.extend(authorize_and_connect_script());
        script.extend(acks(3 + 2 * 2 + 2 * 3));
        for chunk in [256, 44] {
            script.extend(acks(3));
            script.extend(vec![0xA5; chunk]);
        }
        script.extend(acks(3));

        let (ctl, port, rec) = controller(&script);
        ctl.select_firmware_path(file.path());
        ctl.set_verify(true);
        let outcome = ctl.start_write().unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Written { bytes: 300 });
        assert_eq!(port.pending(), 0);
        assert!(contains(
            &port.written(),
            &Generation::Crc16.command_frame(CommandCode::Read)
        ));
        let rec = rec.lock().unwrap();
        assert!(line_index(&rec, "Verifying...") < line_index(&rec, "Verification passed"));
    }

    #[test]
    fn test_write_verify_mismatch_skips_validation_marker() {
        let file = firmware(300);
        let mut script = bootloader_detect_script();
        script.extend(authorize_and_connect_script());
        script.extend(acks(3 + 2 * 2 + 2 * 3));
        script.extend(acks(3));
        script.extend(vec![0xA5; 256]);
        script.extend(acks(3));
        let mut tail = vec![0xA5; 44];
        tail[43] = 0x00;
        script.extend(tail);

        let (ctl, port, _rec) = controller(&script);
        ctl.select_firmware_path(file.path());
        ctl.set_verify(true);
        let err = ctl.start_write().unwrap().wait().unwrap_err();

        assert!(matches!(
            err,
            Error::VerificationFailed { address } if address == USER_CODE_BASE + 299
        ));
        let written = port.written();
        assert!(contains(&written, &address_frame(INVALID_MARKER_ADDRESS)));
        assert!(!contains(&written, &address_frame(VALID_MARKER_ADDRESS)));
    }

    #[test]
    fn test_write_without_marker() {
        let file = firmware(300);
        let mut script = bootloader_detect_script();
        script.extend(authorize_and_connect_script());
        // Two page erases, two data chunks, no marker writes
        script.extend(acks(2 * 2 + 2 * 3));

        let (ctl, port, _rec) = controller(&script);
        ctl.select_firmware_path(file.path());
        ctl.set_mark_valid(false);
        let outcome = ctl.start_write().unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Written { bytes: 300 });
        assert_eq!(port.pending(), 0);
        let written = port.written();
        assert!(!contains(&written, &address_frame(INVALID_MARKER_ADDRESS)));
        assert!(!contains(&written, &address_frame(VALID_MARKER_ADDRESS)));
    }

    #[test]
    fn test_write_with_global_erase() {
        let file = firmware(300);
        let mut script = bootloader_detect_script();
        script.extend(authorize_and_connect_script());
        // Invalidate, global erase, two data chunks, validate
        script.extend(acks(3 + 2 + 2 * 3 + 3));

        let (ctl, port, _rec) = controller(&script);
        ctl.select_firmware_path(file.path());
        ctl.set_global_erase(true);
        let outcome = ctl.start_write().unwrap().wait().unwrap();

        assert_eq!(outcome, WorkflowOutcome::Written { bytes: 300 });
        assert_eq!(port.pending(), 0);
        assert!(contains(
            &port.written(),
            &Generation::Crc16.frame(&[EraseMode::Global as u8])
        ));
    }

    #[test]
    fn test_switch_waits_for_bootloader_start() {
        let protocol = ProtocolConfig {
            bootloader_start_delay: Duration::from_millis(150),
            ..fast_protocol()
        };
        let (ctl, _port) =
            controller_with(&[0xE2; 4], protocol, Arc::new(Callbacks::default()));

        let started = Instant::now();
        let outcome = ctl.start_switch().unwrap().wait().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Switched(DeviceStatus::Bootloader));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
