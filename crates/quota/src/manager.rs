//! Quota manager lifecycle and the command server.
//!
//! The manager exists in two deployment modes. **Embedded** keeps the LRU
//! index in-process: before [`QuotaManager::spawn`] every call goes straight
//! to the index, afterwards a dedicated server task owns it and commands
//! travel through the workspace command FIFO. **Shared** execs a helper
//! process (`cairn-quotad`) serving multiple client processes through the
//! same FIFO; the client side then never touches the index itself.
//!
//! Exactly one writer may own the index: both modes hold an exclusive
//! `flock` on the lock file next to the database for the process lifetime.

use crate::error::{QuotaError, QuotaResult};
use crate::index::{BatchOp, LruIndex};
use crate::protocol::{
    self, COMMAND_BUFFER_SIZE, CommandType, LruCommand, PROTOCOL_REVISION, backchannel,
};
use bytes::{Buf, BytesMut};
use cairn_core::{CacheConfig, Digest, QuotaConfig};
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::{Mutex, Notify};

/// Exit code of the shared helper when the cache database is already locked.
pub const EXIT_CODE_LOCKED: i32 = 2;

/// Mutable state owned by whoever currently serves commands: the index, the
/// registered back channels, and the cleanup pacing record.
struct ServerState {
    index: LruIndex,
    workspace: PathBuf,
    backchannels: HashMap<String, pipe::Sender>,
    cleanup_times: Vec<Instant>,
}

impl ServerState {
    async fn insert(
        &mut self,
        hash: &Digest,
        size: u64,
        description: &str,
        volatile: bool,
    ) -> QuotaResult<()> {
        self.index.insert(hash, size, description, volatile).await?;
        self.cleanup_if_over_limit().await
    }

    async fn apply_batch(&mut self, ops: Vec<BatchOp>) -> QuotaResult<()> {
        self.index.apply_batch(ops).await?;
        self.cleanup_if_over_limit().await
    }

    async fn unpin(&mut self, hash: &Digest) -> QuotaResult<()> {
        self.index.unpin(hash).await?;
        self.cleanup_if_over_limit().await
    }

    async fn cleanup_if_over_limit(&mut self) -> QuotaResult<()> {
        if self.index.gauge() > self.index.limit() {
            let threshold = self.index.cleanup_threshold();
            self.cleanup(threshold).await?;
        }
        Ok(())
    }

    /// Run a cleanup, notifying back channels around it and recording the
    /// run for the cleanup-rate report.
    async fn cleanup(&mut self, leave_size: u64) -> QuotaResult<bool> {
        self.cleanup_times.push(Instant::now());
        self.broadcast(backchannel::CLEANUP_START);
        let result = self.index.cleanup(leave_size).await;
        self.broadcast(backchannel::CLEANUP_FINISH);
        result
    }

    fn cleanup_rate(&self, period: Duration) -> u64 {
        let now = Instant::now();
        self.cleanup_times
            .iter()
            .filter(|t| now.duration_since(**t) <= period)
            .count() as u64
    }

    /// Write a one-byte opcode to every registered back channel. A channel
    /// that cannot take the byte is dropped rather than allowed to block
    /// the manager.
    fn broadcast(&mut self, opcode: u8) {
        self.backchannels.retain(|id, sender| {
            if let Err(e) = sender.try_write(&[opcode]) {
                tracing::debug!(channel = %id, error = %e, "unregistering failed back channel");
                false
            } else {
                true
            }
        });
    }

    fn register_back_channel(&mut self, channel_id: &str) -> QuotaResult<()> {
        let path = back_channel_path(&self.workspace, channel_id);
        let sender = pipe::OpenOptions::new().open_sender(&path)?;
        self.backchannels.insert(channel_id.to_string(), sender);
        Ok(())
    }

    fn unregister_back_channel(&mut self, channel_id: &str) {
        self.backchannels.remove(channel_id);
    }
}

enum Backend {
    /// The index lives in this process.
    Local(Arc<Mutex<ServerState>>),
    /// The index lives in the shared helper process.
    Remote,
}

struct ServerHandle {
    shutdown: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

/// Handle to the cache quota manager.
pub struct QuotaManager {
    cache: CacheConfig,
    quota: QuotaConfig,
    backend: Backend,
    spawned: bool,
    server: Option<ServerHandle>,
    command_sender: Option<pipe::Sender>,
    child: Option<tokio::process::Child>,
    _lock: Option<std::fs::File>,
}

impl QuotaManager {
    /// Create an embedded manager: the index is opened in this process and
    /// served synchronously until [`spawn`](Self::spawn).
    pub async fn create(
        cache: CacheConfig,
        quota: QuotaConfig,
        rebuild: bool,
    ) -> QuotaResult<QuotaManager> {
        quota
            .validate()
            .map_err(cairn_core::Error::InvalidConfig)
            .map_err(QuotaError::Core)?;
        std::fs::create_dir_all(cache.workspace())?;

        let lock = acquire_lock(&cache.lock_path())?;
        sweep_stale_pipes(cache.workspace());

        let index = LruIndex::open(&cache, &quota, rebuild).await?;
        let state = ServerState {
            index,
            workspace: cache.workspace().to_path_buf(),
            backchannels: HashMap::new(),
            cleanup_times: Vec::new(),
        };

        Ok(QuotaManager {
            cache,
            quota,
            backend: Backend::Local(Arc::new(Mutex::new(state))),
            spawned: false,
            server: None,
            command_sender: None,
            child: None,
            _lock: Some(lock),
        })
    }

    /// Create a client of a shared manager, exec'ing the helper binary and
    /// waiting for its ready handshake.
    pub async fn create_shared(
        exe_path: &Path,
        cache: CacheConfig,
        quota: QuotaConfig,
        foreground: bool,
    ) -> QuotaResult<QuotaManager> {
        let mut command = tokio::process::Command::new(exe_path);
        command
            .arg("--workspace")
            .arg(cache.workspace())
            .arg("--cache-dir")
            .arg(&cache.cache_dir)
            .arg("--limit")
            .arg(quota.limit.to_string())
            .arg("--cleanup-threshold")
            .arg(quota.threshold().to_string())
            .stdout(Stdio::piped());
        if foreground {
            command.arg("--foreground");
        }

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            QuotaError::Io(std::io::Error::other("cache manager stdout unavailable"))
        })?;
        let mut lines = BufReader::new(stdout).lines();
        match lines.next_line().await? {
            Some(line) if line.trim() == "ready" => {}
            _ => {
                let status = child.wait().await?;
                if status.code() == Some(EXIT_CODE_LOCKED) {
                    return Err(QuotaError::Locked);
                }
                return Err(QuotaError::Io(std::io::Error::other(format!(
                    "cache manager failed to start ({status})"
                ))));
            }
        }

        Ok(QuotaManager {
            cache,
            quota,
            backend: Backend::Remote,
            spawned: true,
            server: None,
            command_sender: None,
            child: Some(child),
            _lock: None,
        })
    }

    /// Transition from synchronous handling to the asynchronous command
    /// server reading the workspace FIFO.
    pub fn spawn(&mut self) -> QuotaResult<()> {
        if self.spawned {
            return Ok(());
        }
        let Backend::Local(state) = &self.backend else {
            self.spawned = true;
            return Ok(());
        };

        let fifo = self.cache.command_pipe_path();
        if fifo.exists() {
            std::fs::remove_file(&fifo)?;
        }
        make_fifo(&fifo)?;
        // The server keeps a write end open itself so readers never see EOF
        // between clients.
        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&fifo)?;

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(command_server(
            Arc::clone(state),
            receiver,
            self.cache.workspace().to_path_buf(),
            Arc::clone(&shutdown),
        ));
        self.server = Some(ServerHandle { shutdown, task });
        self.spawned = true;
        Ok(())
    }

    /// Drain and stop the command server, checkpoint the index, and unlink
    /// the command FIFO. A shared helper child is terminated.
    pub async fn shutdown(&mut self) -> QuotaResult<()> {
        if let Some(server) = self.server.take() {
            server.shutdown.notify_one();
            let _ = server.task.await;
        }
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            let _ = child.wait().await;
        }
        if let Backend::Local(state) = &self.backend {
            let mut state = state.lock().await;
            state.broadcast(backchannel::RELEASE);
            state.index.checkpoint().await?;
        }
        let fifo = self.cache.command_pipe_path();
        if fifo.exists() {
            let _ = std::fs::remove_file(&fifo);
        }
        self.command_sender = None;
        Ok(())
    }

    /// Track a new object under normal LRU accounting.
    pub async fn insert(&mut self, hash: &Digest, size: u64, description: &str) -> QuotaResult<()> {
        if let Some(state) = self.local_state() {
            return state.lock().await.insert(hash, size, description, false).await;
        }
        self.send(
            LruCommand::for_object(CommandType::Insert, hash)
                .with_size(size)
                .with_description(description),
        )
        .await
    }

    /// Track a new object opted into aggressive eviction.
    pub async fn insert_volatile(
        &mut self,
        hash: &Digest,
        size: u64,
        description: &str,
    ) -> QuotaResult<()> {
        if let Some(state) = self.local_state() {
            return state.lock().await.insert(hash, size, description, true).await;
        }
        self.send(
            LruCommand::for_object(CommandType::InsertVolatile, hash)
                .with_size(size)
                .with_description(description),
        )
        .await
    }

    /// Bump an object to the most recently used position.
    pub async fn touch(&mut self, hash: &Digest) -> QuotaResult<()> {
        if let Some(state) = self.local_state() {
            return state.lock().await.index.touch(hash).await;
        }
        self.send(LruCommand::for_object(CommandType::Touch, hash))
            .await
    }

    /// Pin an object, exempting it from eviction. Blocks until the server
    /// acknowledges; fails with [`QuotaError::PinLimit`] when the pinned
    /// budget is exhausted.
    pub async fn pin(
        &mut self,
        hash: &Digest,
        size: u64,
        description: &str,
        is_catalog: bool,
    ) -> QuotaResult<()> {
        if let Some(state) = self.local_state() {
            return state.lock().await.index.pin(hash, size, description, is_catalog).await;
        }
        let command_type = if is_catalog {
            CommandType::Pin
        } else {
            CommandType::PinRegular
        };
        let reply = self
            .transact(
                LruCommand::for_object(command_type, hash)
                    .with_size(size)
                    .with_description(description),
            )
            .await?;
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(()),
            Some("pin_limit") => Err(QuotaError::PinLimit),
            other => Err(QuotaError::ProtocolFrame(format!(
                "unexpected pin reply {other:?}"
            ))),
        }
    }

    /// Return a pinned object to normal LRU accounting.
    pub async fn unpin(&mut self, hash: &Digest) -> QuotaResult<()> {
        if let Some(state) = self.local_state() {
            return state.lock().await.unpin(hash).await;
        }
        self.send(LruCommand::for_object(CommandType::Unpin, hash))
            .await
    }

    /// Drop an object from the cache. Blocks until the server acknowledges.
    pub async fn remove(&mut self, hash: &Digest) -> QuotaResult<()> {
        if let Some(state) = self.local_state() {
            return state.lock().await.index.remove(hash).await;
        }
        self.transact(LruCommand::for_object(CommandType::Remove, hash))
            .await?;
        Ok(())
    }

    /// Check whether an object of the given size can be admitted next to
    /// the current pins.
    pub async fn reserve(&mut self, size: u64) -> QuotaResult<bool> {
        if let Some(state) = self.local_state() {
            return Ok(size <= state.lock().await.index.max_file_size());
        }
        let reply = self
            .transact(LruCommand::bare(CommandType::Reserve).with_size(size))
            .await?;
        Ok(reply.first().map(String::as_str) == Some("1"))
    }

    /// Evict entries until at most `leave_size` unpinned bytes remain.
    /// Returns whether the target was reached.
    pub async fn cleanup(&mut self, leave_size: u64) -> QuotaResult<bool> {
        if let Some(state) = self.local_state() {
            return state.lock().await.cleanup(leave_size).await;
        }
        let reply = self
            .transact(LruCommand::bare(CommandType::Cleanup).with_size(leave_size))
            .await?;
        match reply.first().map(String::as_str) {
            Some("1") => Ok(true),
            Some("0") => Ok(false),
            other => Err(QuotaError::ProtocolFrame(format!(
                "unexpected cleanup reply {other:?}"
            ))),
        }
    }

    /// Descriptions of all tracked objects in LRU order.
    pub async fn list(&mut self) -> QuotaResult<Vec<String>> {
        self.list_command(CommandType::List).await
    }

    /// Descriptions of pinned objects.
    pub async fn list_pinned(&mut self) -> QuotaResult<Vec<String>> {
        self.list_command(CommandType::ListPinned).await
    }

    /// Descriptions of tracked catalogs.
    pub async fn list_catalogs(&mut self) -> QuotaResult<Vec<String>> {
        self.list_command(CommandType::ListCatalogs).await
    }

    /// Descriptions of volatile objects.
    pub async fn list_volatile(&mut self) -> QuotaResult<Vec<String>> {
        self.list_command(CommandType::ListVolatile).await
    }

    async fn list_command(&mut self, command_type: CommandType) -> QuotaResult<Vec<String>> {
        if let Some(state) = self.local_state() {
            let state = state.lock().await;
            return match command_type {
                CommandType::List => state.index.list().await,
                CommandType::ListPinned => state.index.list_pinned().await,
                CommandType::ListCatalogs => state.index.list_catalogs().await,
                CommandType::ListVolatile => state.index.list_volatile().await,
                _ => Ok(Vec::new()),
            };
        }
        self.transact(LruCommand::bare(command_type)).await
    }

    /// Current gauges: (unpinned bytes, pinned bytes).
    pub async fn status(&mut self) -> QuotaResult<(u64, u64)> {
        if let Some(state) = self.local_state() {
            let state = state.lock().await;
            return Ok((state.index.gauge(), state.index.pinned_gauge()));
        }
        let reply = self.transact(LruCommand::bare(CommandType::Status)).await?;
        parse_u64_pair(reply.first())
    }

    /// Configured limits: (byte limit, cleanup threshold).
    pub async fn limits(&mut self) -> QuotaResult<(u64, u64)> {
        if self.local_state().is_some() {
            return Ok((self.quota.limit, self.quota.threshold()));
        }
        let reply = self.transact(LruCommand::bare(CommandType::Limits)).await?;
        parse_u64_pair(reply.first())
    }

    /// Pid of the process serving the index.
    pub async fn pid(&mut self) -> QuotaResult<u32> {
        if matches!(self.backend, Backend::Local(_)) {
            return Ok(std::process::id());
        }
        let reply = self.transact(LruCommand::bare(CommandType::Pid)).await?;
        reply
            .first()
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| QuotaError::ProtocolFrame("unexpected pid reply".to_string()))
    }

    /// Protocol revision spoken by the serving side.
    pub async fn protocol_revision(&mut self) -> QuotaResult<u32> {
        if matches!(self.backend, Backend::Local(_)) {
            return Ok(PROTOCOL_REVISION);
        }
        let reply = self
            .transact(LruCommand::bare(CommandType::GetProtocolRevision))
            .await?;
        reply
            .first()
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| QuotaError::ProtocolFrame("unexpected revision reply".to_string()))
    }

    /// Number of cleanups within the trailing period.
    pub async fn cleanup_rate(&mut self, period: Duration) -> QuotaResult<u64> {
        if let Some(state) = self.local_state() {
            return Ok(state.lock().await.cleanup_rate(period));
        }
        let reply = self
            .transact(LruCommand::bare(CommandType::CleanupRate).with_size(period.as_secs()))
            .await?;
        reply
            .first()
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| QuotaError::ProtocolFrame("unexpected rate reply".to_string()))
    }

    /// Open a back channel: the manager broadcasts one-byte event opcodes
    /// into the returned receiver until the channel is unregistered or a
    /// write fails.
    pub async fn register_back_channel(&mut self, channel_id: &str) -> QuotaResult<pipe::Receiver> {
        let path = back_channel_path(self.cache.workspace(), channel_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        make_fifo(&path)?;
        let receiver = pipe::OpenOptions::new().read_write(true).open_receiver(&path)?;

        if let Some(state) = self.local_state() {
            state.lock().await.register_back_channel(channel_id)?;
            return Ok(receiver);
        }
        self.transact(
            LruCommand::bare(CommandType::RegisterBackChannel).with_description(channel_id),
        )
        .await?;
        Ok(receiver)
    }

    /// Close a back channel and remove its FIFO.
    pub async fn unregister_back_channel(&mut self, channel_id: &str) -> QuotaResult<()> {
        if let Some(state) = self.local_state() {
            state.lock().await.unregister_back_channel(channel_id);
        } else {
            self.send(
                LruCommand::bare(CommandType::UnregisterBackChannel).with_description(channel_id),
            )
            .await?;
        }
        let path = back_channel_path(self.cache.workspace(), channel_id);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        Ok(())
    }

    /// Direct state access, available only before the manager went
    /// asynchronous.
    fn local_state(&self) -> Option<&Arc<Mutex<ServerState>>> {
        match (&self.backend, self.spawned) {
            (Backend::Local(state), false) => Some(state),
            _ => None,
        }
    }

    /// Write one command frame to the command FIFO.
    async fn send(&mut self, command: LruCommand) -> QuotaResult<()> {
        if self.command_sender.is_none() {
            self.command_sender =
                Some(pipe::OpenOptions::new().open_sender(self.cache.command_pipe_path())?);
        }
        let sender = self
            .command_sender
            .as_mut()
            .ok_or_else(|| QuotaError::Io(std::io::Error::other("command pipe unavailable")))?;
        // One frame, one write: frames stay atomic within the pipe budget.
        sender.write_all(&command.encode()).await?;
        Ok(())
    }

    /// Send a command carrying a freshly created return pipe and collect
    /// the reply records.
    async fn transact(&mut self, command: LruCommand) -> QuotaResult<Vec<String>> {
        let (id, path, mut receiver) = self.make_return_pipe()?;
        let result = async {
            self.send(command.with_return_pipe(id)).await?;
            read_reply(&mut receiver).await
        }
        .await;
        let _ = std::fs::remove_file(&path);
        result
    }

    /// Create a randomly named return FIFO under the workspace and open its
    /// read end.
    fn make_return_pipe(&self) -> QuotaResult<(i32, PathBuf, pipe::Receiver)> {
        loop {
            let raw = u32::from_le_bytes(
                uuid::Uuid::new_v4().as_bytes()[..4]
                    .try_into()
                    .unwrap_or([0; 4]),
            );
            let id = (raw & 0x7fff_ffff) as i32;
            if id == 0 {
                continue;
            }
            let path = return_pipe_path(self.cache.workspace(), id);
            match make_fifo(&path) {
                Ok(()) => {
                    let receiver = pipe::OpenOptions::new().read_write(true).open_receiver(&path)?;
                    return Ok((id, path, receiver));
                }
                Err(QuotaError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for QuotaManager {
    fn drop(&mut self) {
        if let Some(server) = &self.server {
            server.task.abort();
        }
    }
}

/// The asynchronous command server: reads frames from the FIFO, coalesces
/// insert/touch runs into transactional batches, and answers over return
/// pipes.
async fn command_server(
    state: Arc<Mutex<ServerState>>,
    mut receiver: pipe::Receiver,
    workspace: PathBuf,
    shutdown: Arc<Notify>,
) {
    let mut buf = BytesMut::with_capacity(8192);
    let mut chunk = [0u8; 4096];
    let mut batch: Vec<LruCommand> = Vec::with_capacity(COMMAND_BUFFER_SIZE);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            read = receiver.read(&mut chunk) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        process_buffer(&state, &workspace, &mut buf, &mut batch).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "command pipe read failed");
                        break;
                    }
                }
            }
        }
    }

    // Drain whatever is still sitting in the pipe, then flush.
    while let Ok(n) = receiver.try_read(&mut chunk) {
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    process_buffer(&state, &workspace, &mut buf, &mut batch).await;
    flush_batch(&state, &mut batch).await;
}

/// Parse and execute all complete frames in the buffer. The batch is
/// flushed when full, before any non-batchable command, and once the buffer
/// runs dry.
async fn process_buffer(
    state: &Arc<Mutex<ServerState>>,
    workspace: &Path,
    buf: &mut BytesMut,
    batch: &mut Vec<LruCommand>,
) {
    loop {
        match protocol::decode_frame(buf) {
            Ok(Some((command, consumed))) => {
                buf.advance(consumed);
                if command.command_type.is_batchable() {
                    batch.push(command);
                    if batch.len() >= COMMAND_BUFFER_SIZE {
                        flush_batch(state, batch).await;
                    }
                } else {
                    flush_batch(state, batch).await;
                    execute_command(state, workspace, command).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                // No way to resync a corrupt stream; drop what we have.
                tracing::error!(error = %e, "dropping corrupt command buffer");
                buf.clear();
                break;
            }
        }
    }
    flush_batch(state, batch).await;
}

/// Apply a coalesced run of insert/touch commands in one index transaction.
async fn flush_batch(state: &Arc<Mutex<ServerState>>, batch: &mut Vec<LruCommand>) {
    if batch.is_empty() {
        return;
    }
    let ops = batch
        .drain(..)
        .map(|command| match command.command_type {
            CommandType::Touch => BatchOp::Touch { hash: command.hash },
            command_type => BatchOp::Insert {
                hash: command.hash,
                size: command.size,
                description: command.description,
                volatile: command_type == CommandType::InsertVolatile,
            },
        })
        .collect();
    if let Err(e) = state.lock().await.apply_batch(ops).await {
        tracing::error!(error = %e, "failed to apply command batch");
    }
}

async fn execute_command(state: &Arc<Mutex<ServerState>>, workspace: &Path, command: LruCommand) {
    let return_pipe = command.return_pipe;
    let reply = dispatch_command(state, command).await;
    match reply {
        Ok(lines) => {
            if let Err(e) = send_reply(workspace, return_pipe, &lines).await {
                tracing::debug!(error = %e, "failed to answer on return pipe");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            let _ = send_reply(workspace, return_pipe, &["error".to_string()]).await;
        }
    }
}

async fn dispatch_command(
    state: &Arc<Mutex<ServerState>>,
    command: LruCommand,
) -> QuotaResult<Vec<String>> {
    let mut state = state.lock().await;
    match command.command_type {
        CommandType::Reserve => {
            let fits = command.size <= state.index.max_file_size();
            Ok(vec![if fits { "1" } else { "0" }.to_string()])
        }
        CommandType::Pin | CommandType::PinRegular => {
            let is_catalog = command.command_type == CommandType::Pin;
            match state
                .index
                .pin(&command.hash, command.size, &command.description, is_catalog)
                .await
            {
                Ok(()) => Ok(vec!["ok".to_string()]),
                Err(QuotaError::PinLimit) => Ok(vec!["pin_limit".to_string()]),
                Err(e) => Err(e),
            }
        }
        CommandType::Unpin => {
            state.unpin(&command.hash).await?;
            Ok(Vec::new())
        }
        CommandType::Remove => {
            state.index.remove(&command.hash).await?;
            Ok(vec!["ok".to_string()])
        }
        CommandType::Cleanup => {
            // The wire contract is a plain did-we-get-there bool; a stuck
            // file stops the run and reads as "no".
            let reached = match state.cleanup(command.size).await {
                Ok(reached) => reached,
                Err(QuotaError::UnlinkFailed { path, source }) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %source,
                        "cleanup stopped at undeletable file"
                    );
                    false
                }
                Err(e) => return Err(e),
            };
            Ok(vec![if reached { "1" } else { "0" }.to_string()])
        }
        CommandType::List => state.index.list().await,
        CommandType::ListPinned => state.index.list_pinned().await,
        CommandType::ListCatalogs => state.index.list_catalogs().await,
        CommandType::ListVolatile => state.index.list_volatile().await,
        CommandType::Status => Ok(vec![format!(
            "{} {}",
            state.index.gauge(),
            state.index.pinned_gauge()
        )]),
        CommandType::Limits => Ok(vec![format!(
            "{} {}",
            state.index.limit(),
            state.index.cleanup_threshold()
        )]),
        CommandType::Pid => Ok(vec![std::process::id().to_string()]),
        CommandType::GetProtocolRevision => Ok(vec![PROTOCOL_REVISION.to_string()]),
        CommandType::CleanupRate => {
            let rate = state.cleanup_rate(Duration::from_secs(command.size));
            Ok(vec![rate.to_string()])
        }
        CommandType::RegisterBackChannel => {
            state.register_back_channel(&command.description)?;
            Ok(vec!["ok".to_string()])
        }
        CommandType::UnregisterBackChannel => {
            state.unregister_back_channel(&command.description);
            Ok(Vec::new())
        }
        // Batchable commands never reach the dispatcher.
        CommandType::Touch | CommandType::Insert | CommandType::InsertVolatile => Ok(Vec::new()),
    }
}

/// Write length-prefixed reply records plus the terminator to the client's
/// return pipe.
async fn send_reply(workspace: &Path, return_pipe: i32, lines: &[String]) -> QuotaResult<()> {
    if return_pipe < 0 {
        return Ok(());
    }
    let path = return_pipe_path(workspace, return_pipe);
    let mut sender = pipe::OpenOptions::new().open_sender(&path)?;
    for line in lines {
        sender.write_all(&protocol::encode_reply_line(line)).await?;
    }
    sender.write_all(&protocol::encode_reply_end()).await?;
    Ok(())
}

/// Read reply records until the terminator.
async fn read_reply(receiver: &mut pipe::Receiver) -> QuotaResult<Vec<String>> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut lines = Vec::new();
    loop {
        while let Some((record, consumed)) = protocol::decode_reply_line(&buf)? {
            buf.advance(consumed);
            match record {
                Some(line) => lines.push(line),
                None => return Ok(lines),
            }
        }
        let n = receiver.read(&mut chunk).await?;
        if n == 0 {
            return Err(QuotaError::ProtocolFrame(
                "reply stream ended before terminator".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_u64_pair(line: Option<&String>) -> QuotaResult<(u64, u64)> {
    let parsed = line.and_then(|l| {
        let mut parts = l.split_whitespace();
        let a = parts.next()?.parse().ok()?;
        let b = parts.next()?.parse().ok()?;
        Some((a, b))
    });
    parsed.ok_or_else(|| QuotaError::ProtocolFrame(format!("unexpected status reply {line:?}")))
}

fn return_pipe_path(workspace: &Path, id: i32) -> PathBuf {
    workspace.join(format!("pipe{id}"))
}

fn back_channel_path(workspace: &Path, channel_id: &str) -> PathBuf {
    workspace.join(format!("chn{channel_id}"))
}

/// Take the exclusive cache database lock. Held for the process lifetime.
fn acquire_lock(path: &Path) -> QuotaResult<std::fs::File> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => Err(QuotaError::Locked),
            _ => Err(QuotaError::Io(err)),
        };
    }
    Ok(file)
}

/// Create a FIFO with owner-only permissions.
fn make_fifo(path: &Path) -> QuotaResult<()> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| QuotaError::Io(std::io::Error::other("path contains NUL")))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(QuotaError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Remove return-pipe and back-channel FIFOs left behind by dead clients.
fn sweep_stale_pipes(workspace: &Path) {
    let Ok(entries) = std::fs::read_dir(workspace) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("pipe") || name.starts_with("chn") {
            tracing::debug!(pipe = %name, "sweeping stale fifo");
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
