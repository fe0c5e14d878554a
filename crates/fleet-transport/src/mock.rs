//! Deterministic mock adapters.
//!
//! Each mock is scripted up front and records the traffic it sees, so core
//! tests can drive full flows (probe, build, deploy, flash) without real
//! infrastructure and then assert the exact adapter calls that happened.
//! Mocks never sleep on their own; the only suspension points are
//! explicitly scripted hangs (which resolve on cancellation) and the power
//! cycle delay, so tests under a paused tokio clock stay instant.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use fleet_types::{
    Error, PowerControlConfig, Result, ShellCredentials, TransportError, TransportErrorKind,
};

use crate::flash::{FlashOutcome, FlashProgress, FlashStation};
use crate::power::{PowerControl, PowerCycleResult};
use crate::serial::{SerialConsole, SerialExec, SerialLink, SerialSettings};
use crate::shell::{ExecResult, RemoteShell, ShellSession, UploadResult};
use crate::virt::{GuestConfig, GuestInfo, GuestState, HostCapabilities, VirtAdapter};
use crate::CancelToken;

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Remote shell
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ShellState {
    connect_failures_left: u32,
    connects: u32,
    closes: u32,
    scripted: Vec<(String, VecDeque<ExecResult>)>,
    hang_patterns: Vec<String>,
    calls: Vec<String>,
    remote_files: HashMap<String, Vec<u8>>,
    uploads: Vec<String>,
}

/// Scripted in-memory remote shell.
#[derive(Default)]
pub struct MockShell {
    state: Mutex<ShellState>,
}

impl MockShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connect attempts with a retryable transport error.
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().expect("mock lock").connect_failures_left = n;
    }

    /// Queue a response for commands containing `pattern`. Responses for a
    /// pattern are consumed in order; when the queue runs dry the default
    /// (exit 0, empty output) applies again.
    pub fn script_exec(&self, pattern: &str, result: ExecResult) {
        let mut state = self.state.lock().expect("mock lock");
        if let Some((_, queue)) = state.scripted.iter_mut().find(|(p, _)| p == pattern) {
            queue.push_back(result);
        } else {
            state
                .scripted
                .push((pattern.to_string(), VecDeque::from([result])));
        }
    }

    /// Queue a successful response with the given stdout.
    pub fn script_exec_ok(&self, pattern: &str, stdout: &str) {
        self.script_exec(
            pattern,
            ExecResult {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
                duration: Duration::from_millis(5),
            },
        );
    }

    /// Queue a failing response with the given exit code and stderr.
    pub fn script_exec_fail(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.script_exec(
            pattern,
            ExecResult {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
                duration: Duration::from_millis(5),
            },
        );
    }

    /// Commands containing `pattern` block until the call is cancelled.
    pub fn script_hang(&self, pattern: &str) {
        self.state
            .lock()
            .expect("mock lock")
            .hang_patterns
            .push(pattern.to_string());
    }

    /// Seed a file on the fake remote filesystem (for download paths).
    pub fn put_remote_file(&self, path: &str, bytes: &[u8]) {
        self.state
            .lock()
            .expect("mock lock")
            .remote_files
            .insert(path.to_string(), bytes.to_vec());
    }

    /// Bytes previously uploaded to (or seeded at) a remote path.
    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("mock lock")
            .remote_files
            .get(path)
            .cloned()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().expect("mock lock").connects
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().expect("mock lock").closes
    }

    /// Every exec command seen, in order.
    pub fn exec_calls(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("mock lock")
            .calls
            .iter()
            .filter_map(|c| c.strip_prefix("exec:").map(str::to_string))
            .collect()
    }

    /// Remote paths written by uploads, in order.
    pub fn uploaded_paths(&self) -> Vec<String> {
        self.state.lock().expect("mock lock").uploads.clone()
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn connect(
        &self,
        credentials: &ShellCredentials,
        cancel: &CancelToken,
    ) -> Result<ShellSession> {
        cancel.check()?;
        let mut state = self.state.lock().expect("mock lock");
        state.connects += 1;
        if state.connect_failures_left > 0 {
            state.connect_failures_left -= 1;
            return Err(Error::Transport(TransportError::connect(format!(
                "connection to {} refused",
                credentials.hostname
            ))));
        }
        let id = format!("sess-{}", state.connects);
        Ok(ShellSession {
            id,
            pool_key: credentials.pool_key(),
        })
    }

    async fn exec(
        &self,
        _session: &ShellSession,
        command: &str,
        _timeout: Duration,
        _env: &BTreeMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        cancel.check()?;
        let (hang, response) = {
            let mut state = self.state.lock().expect("mock lock");
            state.calls.push(format!("exec:{}", command));
            let hang = state
                .hang_patterns
                .iter()
                .any(|p| command.contains(p.as_str()));
            let response = state
                .scripted
                .iter_mut()
                .find(|(p, _)| command.contains(p.as_str()))
                .and_then(|(_, queue)| queue.pop_front());
            (hang, response)
        };

        if hang {
            cancel.cancelled().await;
            return Err(Error::Cancelled);
        }

        Ok(response.unwrap_or(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        }))
    }

    async fn upload(
        &self,
        _session: &ShellSession,
        local: &Path,
        remote: &str,
        cancel: &CancelToken,
    ) -> Result<UploadResult> {
        cancel.check()?;
        let bytes = std::fs::read(local).map_err(|e| {
            Error::Transport(TransportError::new(
                TransportErrorKind::Io,
                format!("read {}: {}", local.display(), e),
            ))
        })?;
        let digest = sha256_hex(&bytes);
        let size = bytes.len() as u64;
        let mut state = self.state.lock().expect("mock lock");
        state.remote_files.insert(remote.to_string(), bytes);
        state.uploads.push(remote.to_string());
        Ok(UploadResult {
            bytes: size,
            sha256: digest,
        })
    }

    async fn download(
        &self,
        _session: &ShellSession,
        remote: &str,
        local: &Path,
        cancel: &CancelToken,
    ) -> Result<u64> {
        cancel.check()?;
        let bytes = {
            let state = self.state.lock().expect("mock lock");
            state
                .remote_files
                .get(remote)
                .cloned()
                .ok_or_else(|| Error::Remote(format!("{}: no such file", remote)))?
        };
        std::fs::write(local, &bytes).map_err(|e| {
            Error::Transport(TransportError::new(
                TransportErrorKind::Io,
                format!("write {}: {}", local.display(), e),
            ))
        })?;
        Ok(bytes.len() as u64)
    }

    async fn validate(&self, _credentials: &ShellCredentials) -> Result<bool> {
        let state = self.state.lock().expect("mock lock");
        Ok(state.connect_failures_left == 0)
    }

    async fn close(&self, _session: ShellSession) -> Result<()> {
        self.state.lock().expect("mock lock").closes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Virtualization
// ---------------------------------------------------------------------------

#[derive(Default)]
struct VirtState {
    guests: HashMap<String, Vec<GuestInfo>>,
    capabilities: HashMap<String, HostCapabilities>,
    fail_creates_left: u32,
}

/// Scripted virtualization-host adapter.
#[derive(Default)]
pub struct MockVirt {
    state: Mutex<VirtState>,
}

impl MockVirt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates(&self, n: u32) {
        self.state.lock().expect("mock lock").fail_creates_left = n;
    }

    pub fn set_capabilities(&self, credentials: &ShellCredentials, caps: HostCapabilities) {
        self.state
            .lock()
            .expect("mock lock")
            .capabilities
            .insert(credentials.pool_key(), caps);
    }

    pub fn guest_count(&self, credentials: &ShellCredentials) -> usize {
        self.state
            .lock()
            .expect("mock lock")
            .guests
            .get(&credentials.pool_key())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl VirtAdapter for MockVirt {
    async fn list_guests(
        &self,
        credentials: &ShellCredentials,
        include_stopped: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<GuestInfo>> {
        cancel.check()?;
        let state = self.state.lock().expect("mock lock");
        let guests = state
            .guests
            .get(&credentials.pool_key())
            .cloned()
            .unwrap_or_default();
        Ok(guests
            .into_iter()
            .filter(|g| include_stopped || g.state == GuestState::Running)
            .collect())
    }

    async fn create_guest(
        &self,
        credentials: &ShellCredentials,
        config: &GuestConfig,
        cancel: &CancelToken,
    ) -> Result<GuestInfo> {
        cancel.check()?;
        let mut state = self.state.lock().expect("mock lock");
        if state.fail_creates_left > 0 {
            state.fail_creates_left -= 1;
            return Err(Error::Remote(format!(
                "failed to define guest {}",
                config.name
            )));
        }
        let info = GuestInfo {
            name: config.name.clone(),
            state: GuestState::Running,
            cpu_cores: config.cpu_cores,
            memory_mb: config.memory_mb,
        };
        state
            .guests
            .entry(credentials.pool_key())
            .or_default()
            .push(info.clone());
        Ok(info)
    }

    async fn destroy_guest(
        &self,
        credentials: &ShellCredentials,
        name: &str,
        undefine: bool,
        cancel: &CancelToken,
    ) -> Result<bool> {
        cancel.check()?;
        let mut state = self.state.lock().expect("mock lock");
        let Some(guests) = state.guests.get_mut(&credentials.pool_key()) else {
            return Ok(false);
        };
        let Some(position) = guests.iter().position(|g| g.name == name) else {
            return Ok(false);
        };
        if undefine {
            guests.remove(position);
        } else {
            guests[position].state = GuestState::Stopped;
        }
        Ok(true)
    }

    async fn capabilities(
        &self,
        credentials: &ShellCredentials,
        cancel: &CancelToken,
    ) -> Result<HostCapabilities> {
        cancel.check()?;
        let state = self.state.lock().expect("mock lock");
        Ok(state
            .capabilities
            .get(&credentials.pool_key())
            .cloned()
            .unwrap_or(HostCapabilities {
                architecture: "x86_64".to_string(),
                cpu_cores: 8,
                memory_mb: 16_384,
                hw_assist: true,
                nested_virt: false,
            }))
    }
}

// ---------------------------------------------------------------------------
// Serial console
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SerialState {
    opens: u32,
    closes: u32,
    breaks: u32,
    exec_outputs: VecDeque<SerialExec>,
    read_outputs: VecDeque<String>,
    fail_opens_left: u32,
}

/// Scripted serial console.
#[derive(Default)]
pub struct MockSerial {
    state: Mutex<SerialState>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_opens(&self, n: u32) {
        self.state.lock().expect("mock lock").fail_opens_left = n;
    }

    pub fn script_exec_output(&self, output: &str) {
        self.state
            .lock()
            .expect("mock lock")
            .exec_outputs
            .push_back(SerialExec {
                output: output.to_string(),
                duration: Duration::from_millis(20),
            });
    }

    pub fn script_read_output(&self, output: &str) {
        self.state
            .lock()
            .expect("mock lock")
            .read_outputs
            .push_back(output.to_string());
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().expect("mock lock").opens
    }

    pub fn break_count(&self) -> u32 {
        self.state.lock().expect("mock lock").breaks
    }
}

#[async_trait]
impl SerialConsole for MockSerial {
    async fn open(&self, settings: &SerialSettings, cancel: &CancelToken) -> Result<SerialLink> {
        cancel.check()?;
        let mut state = self.state.lock().expect("mock lock");
        state.opens += 1;
        if state.fail_opens_left > 0 {
            state.fail_opens_left -= 1;
            return Err(Error::Transport(TransportError::new(
                TransportErrorKind::Io,
                format!("{}: device busy", settings.device),
            )));
        }
        Ok(SerialLink {
            id: format!("tty-{}", state.opens),
            device: settings.device.clone(),
        })
    }

    async fn exec(
        &self,
        _link: &SerialLink,
        command: &str,
        _timeout: Duration,
        prompt_pattern: &str,
        cancel: &CancelToken,
    ) -> Result<SerialExec> {
        cancel.check()?;
        let mut state = self.state.lock().expect("mock lock");
        Ok(state.exec_outputs.pop_front().unwrap_or(SerialExec {
            output: format!("{}\n{}", command, prompt_pattern),
            duration: Duration::from_millis(20),
        }))
    }

    async fn read_until(
        &self,
        _link: &SerialLink,
        pattern: &str,
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<String> {
        cancel.check()?;
        let mut state = self.state.lock().expect("mock lock");
        Ok(state
            .read_outputs
            .pop_front()
            .unwrap_or_else(|| pattern.to_string()))
    }

    async fn send_break(&self, _link: &SerialLink) -> Result<()> {
        self.state.lock().expect("mock lock").breaks += 1;
        Ok(())
    }

    async fn close(&self, _link: SerialLink) -> Result<()> {
        self.state.lock().expect("mock lock").closes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Power control
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PowerState {
    on: HashMap<String, bool>,
    cycles: Vec<String>,
    fail_for: HashSet<String>,
    unrecovered: HashSet<String>,
}

/// Scripted power controller. Boards default to powered on.
#[derive(Default)]
pub struct MockPower {
    state: Mutex<PowerState>,
}

impl MockPower {
    pub fn new() -> Self {
        Self::default()
    }

    /// All switching for this board fails with a transport error.
    pub fn fail_for(&self, board_id: &str) {
        self.state
            .lock()
            .expect("mock lock")
            .fail_for
            .insert(board_id.to_string());
    }

    /// Cycles succeed but the board does not come back.
    pub fn mark_unrecovered(&self, board_id: &str) {
        self.state
            .lock()
            .expect("mock lock")
            .unrecovered
            .insert(board_id.to_string());
    }

    pub fn is_on(&self, board_id: &str) -> bool {
        *self
            .state
            .lock()
            .expect("mock lock")
            .on
            .get(board_id)
            .unwrap_or(&true)
    }

    pub fn cycle_count(&self, board_id: &str) -> usize {
        self.state
            .lock()
            .expect("mock lock")
            .cycles
            .iter()
            .filter(|b| b.as_str() == board_id)
            .count()
    }

    fn switch(&self, board_id: &str, config: &PowerControlConfig, to_on: bool) -> Result<()> {
        if !config.is_automated() {
            return Err(Error::conflict(format!(
                "board {} has manual power control",
                board_id
            )));
        }
        let mut state = self.state.lock().expect("mock lock");
        if state.fail_for.contains(board_id) {
            return Err(Error::Transport(TransportError::new(
                TransportErrorKind::Io,
                format!("power switch for {} unreachable", board_id),
            )));
        }
        state.on.insert(board_id.to_string(), to_on);
        Ok(())
    }
}

#[async_trait]
impl PowerControl for MockPower {
    async fn power_on(
        &self,
        board_id: &str,
        config: &PowerControlConfig,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        self.switch(board_id, config, true)
    }

    async fn power_off(
        &self,
        board_id: &str,
        config: &PowerControlConfig,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        self.switch(board_id, config, false)
    }

    async fn power_cycle(
        &self,
        board_id: &str,
        config: &PowerControlConfig,
        delay: Duration,
        cancel: &CancelToken,
    ) -> Result<PowerCycleResult> {
        cancel.check()?;
        self.switch(board_id, config, false)?;
        tokio::time::sleep(delay).await;
        cancel.check()?;
        self.switch(board_id, config, true)?;
        let mut state = self.state.lock().expect("mock lock");
        state.cycles.push(board_id.to_string());
        let recovered = !state.unrecovered.contains(board_id);
        Ok(PowerCycleResult {
            off_ok: true,
            on_ok: true,
            recovered: Some(recovered),
        })
    }
}

// ---------------------------------------------------------------------------
// Flash station
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FlashState {
    outcomes: HashMap<String, VecDeque<Result<FlashOutcome>>>,
    progress: HashMap<String, FlashProgress>,
    flashes: Vec<(String, String)>,
    cancels: Vec<String>,
}

/// Scripted flash station. Unscripted flashes succeed with the firmware
/// file's size and `verified` mirroring the request.
#[derive(Default)]
pub struct MockFlash {
    state: Mutex<FlashState>,
}

impl MockFlash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_outcome(&self, board_id: &str, outcome: Result<FlashOutcome>) {
        self.state
            .lock()
            .expect("mock lock")
            .outcomes
            .entry(board_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn set_progress(&self, board_id: &str, progress: FlashProgress) {
        self.state
            .lock()
            .expect("mock lock")
            .progress
            .insert(board_id.to_string(), progress);
    }

    /// (board, firmware path) pairs flashed, in order.
    pub fn flashes(&self) -> Vec<(String, String)> {
        self.state.lock().expect("mock lock").flashes.clone()
    }

    pub fn cancel_count(&self, board_id: &str) -> usize {
        self.state
            .lock()
            .expect("mock lock")
            .cancels
            .iter()
            .filter(|b| b.as_str() == board_id)
            .count()
    }
}

#[async_trait]
impl FlashStation for MockFlash {
    async fn flash(
        &self,
        board_id: &str,
        firmware: &Path,
        _station_credentials: &ShellCredentials,
        _board_type: &str,
        verify: bool,
        cancel: &CancelToken,
    ) -> Result<FlashOutcome> {
        cancel.check()?;
        let scripted = {
            let mut state = self.state.lock().expect("mock lock");
            state
                .flashes
                .push((board_id.to_string(), firmware.display().to_string()));
            state
                .outcomes
                .get_mut(board_id)
                .and_then(|queue| queue.pop_front())
        };
        if let Some(outcome) = scripted {
            return outcome;
        }
        let bytes = std::fs::metadata(firmware).map(|m| m.len()).unwrap_or(0);
        Ok(FlashOutcome {
            bytes_written: bytes,
            duration: Duration::from_secs(1),
            verified: verify,
        })
    }

    async fn cancel_flash(&self, board_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("mock lock");
        state.cancels.push(board_id.to_string());
        state.progress.remove(board_id);
        Ok(())
    }

    async fn progress(&self, board_id: &str) -> Result<Option<FlashProgress>> {
        let state = self.state.lock().expect("mock lock");
        Ok(state.progress.get(board_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FlashPhase;

    fn creds() -> ShellCredentials {
        ShellCredentials {
            hostname: "192.0.2.10".to_string(),
            username: "fleet".to_string(),
            port: 22,
            key_path: None,
        }
    }

    #[tokio::test]
    async fn shell_scripted_responses_consume_in_order() {
        let shell = MockShell::new();
        shell.script_exec_ok("uname", "Linux");
        shell.script_exec_fail("uname", 127, "not found");

        let session = shell
            .connect(&creds(), &CancelToken::none())
            .await
            .expect("connect");
        let env = BTreeMap::new();

        let first = shell
            .exec(&session, "uname -a", Duration::from_secs(5), &env, &CancelToken::none())
            .await
            .expect("exec");
        assert_eq!(first.stdout, "Linux");

        let second = shell
            .exec(&session, "uname -a", Duration::from_secs(5), &env, &CancelToken::none())
            .await
            .expect("exec");
        assert_eq!(second.exit_code, 127);

        // Queue dry: default response.
        let third = shell
            .exec(&session, "uname -a", Duration::from_secs(5), &env, &CancelToken::none())
            .await
            .expect("exec");
        assert_eq!(third.exit_code, 0);

        assert_eq!(shell.exec_calls().len(), 3);
    }

    #[tokio::test]
    async fn shell_hang_resolves_on_cancel() {
        let shell = std::sync::Arc::new(MockShell::new());
        shell.script_hang("make");
        let session = shell
            .connect(&creds(), &CancelToken::none())
            .await
            .expect("connect");

        let token = CancelToken::new();
        let task = {
            let shell = std::sync::Arc::clone(&shell);
            let token = token.clone();
            tokio::spawn(async move {
                shell
                    .exec(
                        &session,
                        "make -j7",
                        Duration::from_secs(600),
                        &BTreeMap::new(),
                        &token,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert_eq!(task.await.expect("join"), Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn shell_upload_round_trips_bytes() {
        let td = tempfile::tempdir().expect("tempdir");
        let local = td.path().join("image");
        std::fs::write(&local, b"kernel bits").expect("write");

        let shell = MockShell::new();
        let session = shell
            .connect(&creds(), &CancelToken::none())
            .await
            .expect("connect");
        let result = shell
            .upload(&session, &local, "/srv/image", &CancelToken::none())
            .await
            .expect("upload");
        assert_eq!(result.bytes, 11);
        assert_eq!(result.sha256, sha256_hex(b"kernel bits"));
        assert_eq!(shell.remote_file("/srv/image").as_deref(), Some(&b"kernel bits"[..]));

        let dest = td.path().join("copy");
        let bytes = shell
            .download(&session, "/srv/image", &dest, &CancelToken::none())
            .await
            .expect("download");
        assert_eq!(bytes, 11);
        assert_eq!(std::fs::read(dest).expect("read"), b"kernel bits");
    }

    #[tokio::test]
    async fn virt_guest_lifecycle() {
        let virt = MockVirt::new();
        let config = GuestConfig {
            name: "guest-1".to_string(),
            architecture: "x86_64".to_string(),
            cpu_cores: 2,
            memory_mb: 2048,
            kernel_path: "/srv/kernel".to_string(),
            initrd_path: None,
            rootfs_path: None,
            kernel_cmdline: None,
        };

        let info = virt
            .create_guest(&creds(), &config, &CancelToken::none())
            .await
            .expect("create");
        assert_eq!(info.state, GuestState::Running);

        let running = virt
            .list_guests(&creds(), false, &CancelToken::none())
            .await
            .expect("list");
        assert_eq!(running.len(), 1);

        assert!(
            virt.destroy_guest(&creds(), "guest-1", false, &CancelToken::none())
                .await
                .expect("destroy")
        );
        let running = virt
            .list_guests(&creds(), false, &CancelToken::none())
            .await
            .expect("list");
        assert!(running.is_empty());
        let all = virt
            .list_guests(&creds(), true, &CancelToken::none())
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn power_rejects_manual_control() {
        let power = MockPower::new();
        let result = power
            .power_on("brd-1", &PowerControlConfig::manual(), &CancelToken::none())
            .await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn power_cycle_switches_off_then_on() {
        let power = MockPower::new();
        let config = PowerControlConfig {
            method: fleet_types::PowerMethod::UsbHub,
            usb_hub_port: Some(3),
            ..PowerControlConfig::manual()
        };
        let result = power
            .power_cycle("brd-1", &config, Duration::from_secs(2), &CancelToken::none())
            .await
            .expect("cycle");
        assert!(result.off_ok && result.on_ok);
        assert_eq!(result.recovered, Some(true));
        assert!(power.is_on("brd-1"));
        assert_eq!(power.cycle_count("brd-1"), 1);
    }

    #[tokio::test]
    async fn flash_defaults_to_firmware_size() {
        let td = tempfile::tempdir().expect("tempdir");
        let firmware = td.path().join("fw.img");
        std::fs::write(&firmware, vec![0u8; 256]).expect("write");

        let flash = MockFlash::new();
        let outcome = flash
            .flash(
                "brd-1",
                &firmware,
                &creds(),
                "raspberry_pi_4",
                true,
                &CancelToken::none(),
            )
            .await
            .expect("flash");
        assert_eq!(outcome.bytes_written, 256);
        assert!(outcome.verified);
        assert_eq!(flash.flashes().len(), 1);
    }

    #[tokio::test]
    async fn flash_progress_is_scripted() {
        let flash = MockFlash::new();
        assert!(flash.progress("brd-1").await.expect("progress").is_none());
        flash.set_progress(
            "brd-1",
            FlashProgress {
                phase: FlashPhase::Writing,
                percent: 40.0,
                bytes_written: 1024,
                remaining_seconds: Some(9),
            },
        );
        let progress = flash.progress("brd-1").await.expect("progress").expect("some");
        assert_eq!(progress.phase, FlashPhase::Writing);
        flash.cancel_flash("brd-1").await.expect("cancel");
        assert!(flash.progress("brd-1").await.expect("progress").is_none());
        assert_eq!(flash.cancel_count("brd-1"), 1);
    }

    #[tokio::test]
    async fn serial_defaults_echo_prompt() {
        let serial = MockSerial::new();
        let link = serial
            .open(
                &SerialSettings {
                    device: "/dev/ttyUSB0".to_string(),
                    baud_rate: 115_200,
                    data_bits: 8,
                    stop_bits: 1,
                    parity: crate::serial::Parity::None,
                },
                &CancelToken::none(),
            )
            .await
            .expect("open");

        serial.script_read_output("login: ");
        let read = serial
            .read_until(&link, "login:", Duration::from_secs(5), &CancelToken::none())
            .await
            .expect("read");
        assert_eq!(read, "login: ");

        serial.send_break(&link).await.expect("break");
        assert_eq!(serial.break_count(), 1);
        serial.close(link).await.expect("close");
    }
}
