// Staged firmware upgrade driven by an external flashing tool.
//
// `start_upgrade` checks the preconditions synchronously and hands the job to a dedicated worker
// thread. The worker walks the stages in order:
//
// 1. prepare      re-validate the image, check scratch space (and back up config if asked to)
// 2. verify       hash the image and record the digest
// 3. write_flash  run the flashing tool and wait for it to exit
// 4. reboot       settle and finish the bookkeeping
//
// Every change to the progress record goes through `Shared::update`, which publishes the new
// snapshot on a watch channel, rewrites the recovery file and then, with no lock held, calls the
// progress observer. Cancellation is checked between steps. Once the flashing tool runs it is
// left alone until it exits: killing it half way through a flash write can brick the device.

use crate::callback::invoke_guarded;
use crate::config::UpgradeConfig;
use crate::progress::{self, now_millis, Stage, UpgradeProgress, UpgradeStatus};
use crate::validator::{self, ValidationError};
use fs2::available_space;
use sha2::{Digest, Sha256};
use std::error;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// How often the worker checks on the running flashing tool.
const FLASH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// While the tool runs, progress creeps up by one point this often.
const FLASH_TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Output of the flashing tool, inside the scratch directory.
const TOOL_LOG_FILE: &str = "sysupgrade.log";

/// How many trailing lines of tool output are copied into the upgrade log.
const TOOL_LOG_TAIL: usize = 20;

pub type ProgressCallback = Arc<dyn Fn(&UpgradeProgress) + Send + Sync>;
pub type CompletionCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// Reasons `start_upgrade` refuses to start.
#[derive(Debug)]
pub enum UpgradeError {
    AlreadyInProgress,
    Validation(ValidationError),
    ToolUnavailable(String),
    Spawn(io::Error),
}

impl error::Error for UpgradeError {}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyInProgress => write!(f, "Upgrade already in progress"),
            Self::Validation(e) => write!(f, "Firmware validation failed: {e}"),
            Self::ToolUnavailable(tool) => {
                write!(f, "Upgrade tool '{tool}' is not available on this system")
            }
            Self::Spawn(e) => write!(f, "Unable to start upgrade worker: {e}"),
        }
    }
}

impl From<ValidationError> for UpgradeError {
    fn from(e: ValidationError) -> Self {
        UpgradeError::Validation(e)
    }
}

/// Why the worker stopped before the end of the pipeline.
#[derive(Debug)]
enum StageFailure {
    Cancelled,
    Failed(String),
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "Upgrade cancelled by user"),
            Self::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Poisoning only means an earlier holder panicked; the guarded data is still usable.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the orchestrator handle and its worker.
struct Shared {
    config: UpgradeConfig,
    progress: watch::Sender<UpgradeProgress>,
    update_lock: Mutex<()>,
    running: AtomicBool,
    cancelled: AtomicBool,
    on_progress: RwLock<Option<ProgressCallback>>,
    on_complete: RwLock<Option<CompletionCallback>>,
}

impl Shared {
    /// Applies `f` to the live progress, persists the result and notifies the observer.
    fn update<F: FnOnce(&mut UpgradeProgress)>(&self, f: F) {
        let mut snapshot = UpgradeProgress::default();
        {
            let _guard = lock(&self.update_lock);
            self.progress.send_modify(|p| {
                f(p);
                p.last_updated = now_millis();
                snapshot = p.clone();
            });
            self.persist(&snapshot);
        }

        let cb = self
            .on_progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(cb) = cb {
            invoke_guarded("upgrade progress", || cb(&snapshot));
        }
    }

    fn persist(&self, snapshot: &UpgradeProgress) {
        if let Err(e) = progress::save(snapshot, &self.config.recovery_file) {
            log::warn!(
                "Unable to persist upgrade progress to {}: {e}",
                self.config.recovery_file.display()
            );
        }
    }

    fn notify_completion(&self, success: bool, message: &str) {
        let cb = self
            .on_complete
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(cb) = cb {
            invoke_guarded("upgrade completion", || cb(success, message));
        }
    }
}

pub struct SysupgradeOrchestrator {
    shared: Arc<Shared>,
    start_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SysupgradeOrchestrator {
    /// Creates an orchestrator, picking up the state a previous process left in the recovery file.
    pub fn new(config: UpgradeConfig) -> SysupgradeOrchestrator {
        let initial = recover(&config.recovery_file);
        let (progress, _) = watch::channel(initial);

        let orchestrator = SysupgradeOrchestrator {
            shared: Arc::new(Shared {
                config,
                progress,
                update_lock: Mutex::new(()),
                running: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                on_progress: RwLock::new(None),
                on_complete: RwLock::new(None),
            }),
            start_lock: Mutex::new(()),
            worker: Mutex::new(None),
        };
        if !orchestrator.get_progress().upgrade_id.is_empty() {
            orchestrator.shared.persist(&orchestrator.get_progress());
        }
        orchestrator
    }

    /// Validates the image and starts the upgrade in the background, returning its id.
    pub fn start_upgrade(&self, firmware: &Path, preserve_config: bool) -> Result<String, UpgradeError> {
        let _guard = lock(&self.start_lock);

        if self.shared.running.load(Ordering::SeqCst) {
            log::warn!("Rejecting upgrade of {}: another upgrade is running", firmware.display());
            return Err(UpgradeError::AlreadyInProgress);
        }

        validator::validate_firmware_file(firmware)?;
        let tool = &self.shared.config.tool;
        if !validator::is_sysupgrade_available(tool) {
            return Err(UpgradeError::ToolUnavailable(tool.clone()));
        }

        let started = now_millis();
        let upgrade_id = format!("upgrade_{}", started.timestamp_millis());
        let estimated = chrono::Duration::from_std(self.shared.config.estimated_duration)
            .ok()
            .map(|d| started + d);

        self.shared.cancelled.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        let mut fresh = UpgradeProgress::new(upgrade_id.clone(), estimated);
        fresh.log(&format!(
            "Upgrade {upgrade_id} requested for {} (preserve config: {preserve_config})",
            firmware.display()
        ));
        self.shared.update(|p| *p = fresh);

        let worker = Worker {
            shared: self.shared.clone(),
            firmware: firmware.to_path_buf(),
            preserve_config,
        };
        let spawned = thread::Builder::new()
            .name("sysupgrade".to_string())
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                log::info!("Started upgrade {upgrade_id} with {}", firmware.display());
                *lock(&self.worker) = Some(handle);
                Ok(upgrade_id)
            }
            Err(e) => {
                log::error!("Unable to spawn upgrade worker: {e}");
                self.shared.update(|p| {
                    p.status = UpgradeStatus::Failed;
                    p.progress_percentage = -1;
                    p.error_message = format!("Unable to start upgrade worker: {e}");
                    p.log("Upgrade could not be started");
                });
                self.shared.running.store(false, Ordering::SeqCst);
                Err(UpgradeError::Spawn(e))
            }
        }
    }

    /// Asks the running upgrade to stop at its next checkpoint. False if nothing is running.
    pub fn cancel_upgrade(&self) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
        log::info!("Upgrade cancellation requested");
        self.shared
            .update(|p| p.log("Cancellation requested, stopping at the next safe point"));
        true
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn get_progress(&self) -> UpgradeProgress {
        self.shared.progress.borrow().clone()
    }

    /// A receiver that sees every published progress snapshot.
    pub fn subscribe(&self) -> watch::Receiver<UpgradeProgress> {
        self.shared.progress.subscribe()
    }

    pub fn set_progress_callback<F>(&self, f: F)
    where
        F: Fn(&UpgradeProgress) + Send + Sync + 'static,
    {
        *self.shared.on_progress.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(f));
    }

    pub fn set_completion_callback<F>(&self, f: F)
    where
        F: Fn(bool, &str) + Send + Sync + 'static,
    {
        *self.shared.on_complete.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(f));
    }

    /// Blocks until the current worker, if any, has finished.
    pub fn wait(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Upgrade worker panicked");
            }
        }
    }
}

/// Loads the recovery file. An upgrade that was still in flight when the previous process died
/// cannot be resumed and is reported as such.
fn recover(path: &Path) -> UpgradeProgress {
    let mut last = match progress::load(path) {
        Ok(p) => p,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Ignoring unreadable upgrade progress {}: {e}", path.display());
            }
            return UpgradeProgress::default();
        }
    };

    if last.status.is_active() {
        if last.is_stage_complete(Stage::WriteFlash) {
            last.status = UpgradeStatus::Completed;
            last.progress_percentage = 100;
            last.stages_completed.insert(Stage::Reboot, true);
            last.log("Device restarted after the firmware was written");
        } else {
            log::warn!("Upgrade {} was interrupted", last.upgrade_id);
            last.status = UpgradeStatus::Failed;
            last.progress_percentage = -1;
            last.error_message = "Upgrade interrupted before completion".to_string();
            last.log("Upgrade interrupted before completion");
        }
    }
    last
}

struct Worker {
    shared: Arc<Shared>,
    firmware: PathBuf,
    preserve_config: bool,
}

impl Worker {
    fn run(self) {
        let outcome = self.pipeline();

        let (success, message) = match &outcome {
            Ok(()) => {
                log::info!("Upgrade finished successfully");
                self.shared.update(|p| {
                    p.status = UpgradeStatus::Completed;
                    p.progress_percentage = 100;
                    p.stage_description = "Upgrade completed successfully".to_string();
                    p.log("Upgrade completed successfully");
                });
                (true, "Upgrade completed successfully".to_string())
            }
            Err(failure) => {
                let message = failure.to_string();
                log::error!("Upgrade failed: {message}");
                self.shared.update(|p| {
                    p.status = UpgradeStatus::Failed;
                    p.progress_percentage = -1;
                    p.error_message = message.clone();
                    p.stage_description = message.clone();
                    match failure {
                        StageFailure::Cancelled => {
                            p.log("Upgrade cancelled by user");
                            if p.is_stage_complete(Stage::WriteFlash) {
                                p.log("New firmware was already written to flash and stays installed");
                            }
                        }
                        StageFailure::Failed(_) => p.log(&format!("Upgrade failed: {message}")),
                    }
                });
                (false, message)
            }
        };

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.notify_completion(success, &message);
    }

    fn checkpoint(&self) -> Result<(), StageFailure> {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(StageFailure::Cancelled);
        }
        Ok(())
    }

    /// Moves to `stage` at `percentage` and logs `description`.
    fn step(&self, status: UpgradeStatus, stage: Stage, percentage: i32, description: &str) {
        log::info!("[{}] {description}", stage.id());
        self.shared.update(|p| {
            p.status = status;
            p.current_stage = Some(stage);
            p.progress_percentage = p.progress_percentage.max(percentage);
            p.stage_description = description.to_string();
            p.log(description);
        });
    }

    fn complete_stage(&self, stage: Stage) {
        self.shared.update(|p| {
            p.stages_completed.insert(stage, true);
            p.log(&format!("Stage '{}' complete", stage.id()));
        });
    }

    fn log(&self, message: &str) {
        self.shared.update(|p| p.log(message));
    }

    fn pipeline(&self) -> Result<(), StageFailure> {
        self.checkpoint()?;
        self.step(UpgradeStatus::Preparing, Stage::Prepare, 5, "Validating firmware file");
        validator::validate_firmware_file(&self.firmware)
            .map_err(|e| StageFailure::Failed(e.to_string()))?;

        self.checkpoint()?;
        self.step(UpgradeStatus::Preparing, Stage::Prepare, 10, "Checking system requirements");
        self.check_requirements()?;
        self.step(UpgradeStatus::Preparing, Stage::Prepare, 20, "System requirements met");
        self.complete_stage(Stage::Prepare);

        if self.preserve_config {
            self.checkpoint()?;
            self.step(UpgradeStatus::Preparing, Stage::Prepare, 30, "Backing up configuration");
            self.backup_config();
        }

        self.checkpoint()?;
        self.step(UpgradeStatus::Verifying, Stage::Verify, 40, "Computing firmware checksum");
        let digest = sha256_file(&self.firmware)
            .map_err(|e| StageFailure::Failed(format!("Unable to read firmware: {e}")))?;
        self.log(&format!("Firmware SHA-256: {digest}"));
        self.complete_stage(Stage::Verify);

        self.checkpoint()?;
        self.step(UpgradeStatus::Flashing, Stage::WriteFlash, 50, "Writing firmware to flash");
        self.flash()?;
        self.step(UpgradeStatus::Flashing, Stage::WriteFlash, 90, "Firmware written to flash");
        self.complete_stage(Stage::WriteFlash);

        self.checkpoint()?;
        self.step(UpgradeStatus::Rebooting, Stage::Reboot, 90, "Rebooting device");
        thread::sleep(self.shared.config.settle_delay);
        self.complete_stage(Stage::Reboot);
        Ok(())
    }

    fn check_requirements(&self) -> Result<(), StageFailure> {
        let needed = std::fs::metadata(&self.firmware)
            .map(|m| m.len())
            .map_err(|e| StageFailure::Failed(format!("Unable to read firmware: {e}")))?;
        let scratch = &self.shared.config.scratch_dir;

        match available_space(scratch) {
            Ok(free) if free < needed => Err(StageFailure::Failed(format!(
                "Insufficient space in {}: {needed} bytes needed, {free} available",
                scratch.display()
            ))),
            Ok(free) => {
                self.log(&format!("{free} bytes available in {}", scratch.display()));
                Ok(())
            }
            Err(e) => {
                log::warn!("Unable to determine free space in {}: {e}", scratch.display());
                Ok(())
            }
        }
    }

    /// Best effort: the flashing tool keeps the configuration on its own, the backup is a copy
    /// for the user.
    fn backup_config(&self) {
        let Some(tool) = validator::find_sysupgrade(&self.shared.config.tool) else {
            self.log("Upgrade tool not found, skipping configuration backup");
            return;
        };
        let backup = &self.shared.config.backup_file;
        let status = Command::new(&tool)
            .arg("-b")
            .arg(backup)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(s) if s.success() => {
                self.log(&format!("Configuration saved to {}", backup.display()))
            }
            Ok(s) => {
                log::warn!("Configuration backup exited with {s}");
                self.log(&format!("Configuration backup failed ({s}), continuing"));
            }
            Err(e) => {
                log::warn!("Unable to run configuration backup: {e}");
                self.log(&format!("Configuration backup failed ({e}), continuing"));
            }
        }
    }

    fn flash(&self) -> Result<(), StageFailure> {
        let tool = validator::find_sysupgrade(&self.shared.config.tool).ok_or_else(|| {
            StageFailure::Failed(format!(
                "Upgrade tool '{}' is not available",
                self.shared.config.tool
            ))
        })?;

        let log_path = self.shared.config.scratch_dir.join(TOOL_LOG_FILE);
        let spawn_failed =
            |e: io::Error| StageFailure::Failed(format!("Unable to run {}: {e}", tool.display()));
        let stdout = File::create(&log_path).map_err(spawn_failed)?;
        let stderr = stdout.try_clone().map_err(spawn_failed)?;

        let mut cmd = Command::new(&tool);
        if !self.preserve_config {
            cmd.arg("-n");
        }
        cmd.arg(&self.firmware)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        self.log(&format!(
            "Running {}{} {}",
            tool.display(),
            if self.preserve_config { "" } else { " -n" },
            self.firmware.display()
        ));
        let mut child = cmd.spawn().map_err(spawn_failed)?;

        let mut percentage = 50;
        let mut last_tick = Instant::now();
        let mut cancel_noted = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    return Err(StageFailure::Failed(format!(
                        "Lost track of the upgrade tool: {e}"
                    )))
                }
            }

            if !cancel_noted && self.shared.cancelled.load(Ordering::SeqCst) {
                cancel_noted = true;
                self.log("Flash write in progress, cancellation will take effect once it finishes");
            }
            if last_tick.elapsed() >= FLASH_TICK_INTERVAL && percentage < 89 {
                percentage += 1;
                last_tick = Instant::now();
                self.shared
                    .update(|p| p.progress_percentage = p.progress_percentage.max(percentage));
            }
            thread::sleep(FLASH_POLL_INTERVAL);
        };

        self.append_tool_output(&log_path);

        if !status.success() {
            return Err(StageFailure::Failed(format!(
                "Upgrade tool failed: {status}"
            )));
        }
        Ok(())
    }

    fn append_tool_output(&self, log_path: &Path) {
        let Ok(output) = std::fs::read_to_string(log_path) else {
            return;
        };
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        let tail = &lines[lines.len().saturating_sub(TOOL_LOG_TAIL)..];
        if tail.is_empty() {
            return;
        }
        self.shared.update(|p| {
            for line in tail {
                p.log(&format!("sysupgrade: {line}"));
            }
        });
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
